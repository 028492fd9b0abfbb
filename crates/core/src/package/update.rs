//! Update engine: bring a working copy to a new server revision.
//!
//! The target listing is journalled before any working file changes, every
//! replaced working file is backed up first, and pristine copies are only
//! written once the working file is final. An update interrupted at any
//! point converges when run again.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::link::LinkMode;
use super::PackageWc;
use crate::api::Transport;
use crate::conflict::{MergeResult, ThreeWayMerge};
use crate::context::Context;
use crate::errors::WcError;
use crate::models::{md5_hex, FileStatus, SourceTree};
use crate::transaction::UpdateJournal;

/// What to update to.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Explicit revision; latest when `None`.
    pub revision: Option<String>,
    pub link_mode: LinkMode,
}

/// What happened to one file during an update or pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Added,
    Deleted,
    /// Replaced with the new server content.
    Updated,
    /// Local and server changes merged without overlap.
    Merged,
    Conflicted,
    /// A missing working file was written back.
    Restored,
    /// Not fetched: above the size limit, or conflicted locally.
    Skipped,
    /// Deleted upstream but modified locally; left as an unversioned file.
    Kept,
}

impl FileAction {
    pub fn code(self) -> char {
        match self {
            Self::Added => 'A',
            Self::Deleted => 'D',
            Self::Updated => 'U',
            Self::Merged => 'G',
            Self::Conflicted => 'C',
            Self::Restored => 'R',
            Self::Skipped => 'S',
            Self::Kept => '?',
        }
    }
}

/// Result of an update.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    /// Revision the working copy is at afterwards.
    pub revision: String,
    pub changes: Vec<(FileAction, String)>,
    /// Files an interrupted update's recovery moved out of the way.
    pub moved_aside: Vec<String>,
}

impl UpdateReport {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && self.moved_aside.is_empty()
    }

    pub fn action(&self, name: &str) -> Option<FileAction> {
        self.changes
            .iter()
            .rev()
            .find(|(_, n)| n == name)
            .map(|(a, _)| *a)
    }

    pub(super) fn record(&mut self, action: FileAction, name: &str) {
        debug!(file = %name, action = %action.code(), "update");
        self.changes.push((action, name.to_string()));
    }
}

impl PackageWc {
    /// Update to the latest (or a given) revision.
    ///
    /// An interrupted update is recovered and finished first; this is the
    /// only operation allowed on an interrupted working copy.
    pub async fn update<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        opts: &UpdateOptions,
    ) -> Result<UpdateReport, WcError> {
        let mut report = UpdateReport::default();

        if let Some(journal) = UpdateJournal::find(&self.store) {
            info!(path = %self.dir().display(), "resuming interrupted update");
            self.interrupted = true;
            report.moved_aside = journal.recover()?;
            self.reload()?;
            let target = journal.target()?;
            self.apply_target(ctx, &journal, &target, &mut report).await?;
            journal.close()?;
            self.interrupted = false;
        }

        let target = self.update_target(ctx, opts).await?;
        report.revision = target.meta.revision.clone();
        if self.is_current(&target)? {
            debug!(revision = %target.meta.revision, "already up to date");
            return Ok(report);
        }
        self.check_added_collisions(ctx, &target)?;
        self.install(ctx, &target, &mut report).await?;
        info!(
            revision = %report.revision,
            changes = report.changes.len(),
            "update complete"
        );
        Ok(report)
    }

    /// Journal `target` and apply it.
    pub(super) async fn install<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        target: &SourceTree,
        report: &mut UpdateReport,
    ) -> Result<(), WcError> {
        let journal = UpdateJournal::begin(&self.store, target)?;
        self.interrupted = true;
        self.apply_target(ctx, &journal, target, report).await?;
        journal.close()?;
        self.interrupted = false;
        Ok(())
    }

    /// Whether `target` is what the working copy already has and no
    /// tracked file needs restoring.
    fn is_current(&self, target: &SourceTree) -> Result<bool, WcError> {
        let current = SourceTree {
            meta: self.state.meta.clone(),
            files: self.state.files.values().cloned().collect(),
        };
        if !target.same_snapshot(&current) {
            return Ok(false);
        }
        for name in self.state.files.keys() {
            if self.status_of(name)? == FileStatus::Missing {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// An added file may only land on a local file with identical content.
    fn check_added_collisions<T>(
        &self,
        ctx: &Context<T>,
        target: &SourceTree,
    ) -> Result<(), WcError> {
        for entry in &target.files {
            if self.state.files.contains_key(&entry.name)
                || ctx.options.exceeds_size_limit(entry.size)
                || !self.store.has_work(&entry.name)
            {
                continue;
            }
            if md5_hex(&self.store.read_work(&entry.name)?) != entry.md5 {
                return Err(WcError::conflict(
                    entry.name.clone(),
                    "a different local file is in the way of an added file",
                ));
            }
        }
        Ok(())
    }

    async fn apply_target<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        journal: &UpdateJournal,
        target: &SourceTree,
        report: &mut UpdateReport,
    ) -> Result<(), WcError> {
        let merger = ctx.options.merge_tool.merger();
        let revision = target.meta.revision.clone();
        let old_names: BTreeSet<String> = self.state.files.keys().cloned().collect();
        let new_names = target.names();
        self.check_added_collisions(ctx, target)?;

        // DELETED upstream
        let mut drop_pristine = Vec::new();
        for name in old_names.difference(&new_names) {
            match self.status_of(name)? {
                FileStatus::Modified | FileStatus::ReAdded | FileStatus::Conflicted => {
                    warn!(file = %name, "deleted upstream but modified locally; keeping it unversioned");
                    report.record(FileAction::Kept, name);
                }
                FileStatus::Unmodified => {
                    self.store.remove_work(name)?;
                    report.record(FileAction::Deleted, name);
                }
                _ => report.record(FileAction::Deleted, name),
            }
            self.state.files.remove(name);
            self.state.pending.forget(name);
            drop_pristine.push(name.clone());
        }

        // ADDED upstream
        for entry in target.files.iter().filter(|e| !old_names.contains(&e.name)) {
            let name = entry.name.as_str();
            let mut entry = entry.clone();
            if ctx.options.exceeds_size_limit(entry.size) {
                entry.skipped = true;
                report.record(FileAction::Skipped, name);
            } else if self.store.has_work(name) {
                // identical content, checked above
                let content = self.store.read_work(name)?;
                self.store.write_pristine(name, &content)?;
                report.record(FileAction::Added, name);
            } else {
                let content = self.fetch(ctx, name, &revision).await?;
                self.store.write_work(name, &content)?;
                self.store.write_pristine(name, &content)?;
                report.record(FileAction::Added, name);
            }
            self.state.pending.forget(name);
            self.state.files.insert(entry.name.clone(), entry);
        }

        // KEPT
        for new_entry in target.files.iter().filter(|e| old_names.contains(&e.name)) {
            let name = new_entry.name.as_str();
            let changed = self
                .state
                .files
                .get(name)
                .map_or(true, |old| old.md5 != new_entry.md5);
            let mut entry = new_entry.clone();

            match self.status_of(name)? {
                FileStatus::Skipped => entry.skipped = true,
                FileStatus::Unmodified if changed => {
                    let yours = self.fetch(ctx, name, &revision).await?;
                    self.replace_work(Some(journal), name, &yours)?;
                    self.store.write_pristine(name, &yours)?;
                    report.record(FileAction::Updated, name);
                }
                FileStatus::Modified | FileStatus::ReAdded if changed => {
                    let yours = self.fetch(ctx, name, &revision).await?;
                    let mine = self.store.read_work(name)?;
                    let older = self.store.read_pristine(name)?;
                    let action =
                        self.merge_file(merger.as_ref(), Some(journal), name, &mine, &older, &yours)?;
                    self.store.write_pristine(name, &yours)?;
                    report.record(action, name);
                }
                FileStatus::Missing | FileStatus::MissingAdded => {
                    let content = if changed {
                        self.fetch(ctx, name, &revision).await?
                    } else {
                        self.store.read_pristine(name)?
                    };
                    self.store.write_work(name, &content)?;
                    if changed {
                        self.store.write_pristine(name, &content)?;
                    }
                    self.state.pending.to_be_added.remove(name);
                    report.record(FileAction::Restored, name);
                }
                FileStatus::Conflicted if changed => {
                    let yours = self.fetch(ctx, name, &revision).await?;
                    self.store.write_pristine(name, &yours)?;
                    report.record(FileAction::Skipped, name);
                }
                FileStatus::Deleted if changed => {
                    let yours = self.fetch(ctx, name, &revision).await?;
                    if self.store.has_work(name) {
                        let mine = self.store.read_work(name)?;
                        let older = self.store.read_pristine(name)?;
                        self.state.pending.to_be_deleted.remove(name);
                        let action = self.merge_file(
                            merger.as_ref(),
                            Some(journal),
                            name,
                            &mine,
                            &older,
                            &yours,
                        )?;
                        report.record(action, name);
                    }
                    self.store.write_pristine(name, &yours)?;
                }
                _ => {}
            }
            self.state.files.insert(entry.name.clone(), entry);
        }

        // Persist: file table first, pristine removals last.
        self.state.meta = target.meta.clone();
        self.store.write_files(&self.state.files)?;
        self.store.write_meta(&self.state.meta)?;
        self.save_pending()?;
        self.store
            .set_frozen(self.state.frozen && self.state.meta.is_link())?;
        for name in &drop_pristine {
            self.store.remove_pristine(name)?;
        }
        Ok(())
    }

    pub(super) async fn fetch<T: Transport>(
        &self,
        ctx: &Context<T>,
        name: &str,
        revision: &str,
    ) -> Result<Vec<u8>, WcError> {
        Ok(ctx
            .transport
            .fetch_file(self.project(), self.package(), name, revision)
            .await?)
    }

    /// Back up, write, release. Without a journal the write is plain.
    pub(super) fn replace_work(
        &self,
        journal: Option<&UpdateJournal>,
        name: &str,
        content: &[u8],
    ) -> Result<(), WcError> {
        if let Some(journal) = journal {
            journal.backup(name, content)?;
        }
        self.store.write_work(name, content)?;
        if let Some(journal) = journal {
            journal.release(name)?;
        }
        Ok(())
    }

    /// Merge server changes (`older` to `yours`) into the working file.
    ///
    /// A clean merge only rewrites the working file when the result differs
    /// from it. Conflicts leave `<name>.mine`, `<name>.old` and `<name>.new`
    /// next to the working file and add `name` to the conflict set. Binary
    /// files are never merged: the working file becomes `yours`.
    pub(super) fn merge_file(
        &mut self,
        merger: &dyn ThreeWayMerge,
        journal: Option<&UpdateJournal>,
        name: &str,
        mine: &[u8],
        older: &[u8],
        yours: &[u8],
    ) -> Result<FileAction, WcError> {
        let result = merger
            .merge(mine, older, yours)
            .map_err(|source| WcError::MergeTool {
                name: name.to_string(),
                source,
            })?;
        match result {
            MergeResult::Clean(merged) => {
                if merged != mine {
                    self.replace_work(journal, name, &merged)?;
                }
                Ok(FileAction::Merged)
            }
            MergeResult::Conflict(text) => {
                self.write_side_files(name, mine, older, yours)?;
                self.replace_work(journal, name, &text)?;
                self.mark_conflict(name)?;
                warn!(file = %name, "merge conflict");
                Ok(FileAction::Conflicted)
            }
            MergeResult::Binary => {
                self.write_side_files(name, mine, older, yours)?;
                self.replace_work(journal, name, yours)?;
                self.mark_conflict(name)?;
                warn!(file = %name, "binary file changed on both sides");
                Ok(FileAction::Conflicted)
            }
        }
    }
}
