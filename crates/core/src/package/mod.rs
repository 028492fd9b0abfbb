//! Package working copies.
//!
//! [`PackageWc`] is the only way to touch a package directory. Handles are
//! obtained through [`PackageWc::open`], [`PackageWc::checkout`],
//! [`PackageWc::repair`] or [`PackageWc::repair_link`]; `open` refuses a
//! store whose invariants are violated.
//!
//! Local operations live here; the network protocols are split into
//! [`commit`], [`update`] and [`link`].

pub mod commit;
pub mod link;
pub mod update;

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::api::Transport;
use crate::context::{Context, WcOptions};
use crate::errors::WcError;
use crate::models::{md5_hex, FileEntry, FileStatus, RevisionMeta};
use crate::status::{classify, needs_content_check, StatusFacts};
use crate::store::{is_valid_file_name, Pending, PullRecord, Store, WcState};
use crate::transaction::{recover_commit, UpdateJournal};

pub use commit::CommitOutcome;
pub use link::{LinkMode, PullOutcome};
pub use update::{FileAction, UpdateOptions, UpdateReport};

/// Suffixes of the files a conflicted merge leaves next to the working file.
pub const SIDE_FILE_SUFFIXES: [&str; 3] = ["mine", "old", "new"];

/// A package working copy.
#[derive(Debug)]
pub struct PackageWc {
    store: Store,
    state: WcState,
    /// An update journal is pending; only `update` may run.
    interrupted: bool,
}

impl PackageWc {
    /// Open an existing working copy.
    ///
    /// A leftover commit staging area is rolled forward or discarded first.
    /// A leftover update journal yields an *interrupted* handle on which
    /// only [`update`](Self::update) is allowed.
    pub fn open(dir: &Path) -> Result<Self, WcError> {
        let store = Store::locate(dir)?;
        recover_commit(&store)?;
        let state = store.load()?;

        if UpdateJournal::find(&store).is_some() {
            warn!(path = %dir.display(), "working copy has an interrupted update; run update to finish it");
            return Ok(Self {
                store,
                state,
                interrupted: true,
            });
        }

        let violations = store.check(&state)?;
        if !violations.is_empty() {
            return Err(WcError::Inconsistent {
                path: dir.display().to_string(),
                violations,
            });
        }
        Ok(Self {
            store,
            state,
            interrupted: false,
        })
    }

    /// Check out `project/package` into `dir`.
    pub async fn checkout<T: Transport>(
        ctx: &Context<T>,
        project: &str,
        package: &str,
        dir: &Path,
        opts: &UpdateOptions,
    ) -> Result<Self, WcError> {
        let mut wc = Self::init(project, package, dir)?;
        match wc.update(ctx, opts).await {
            Ok(report) => {
                info!(project, package, revision = %report.revision, files = wc.state.files.len(), "checked out");
                Ok(wc)
            }
            Err(e) => {
                if !wc.interrupted {
                    let store_dir = dir.join(crate::store::STORE_DIR);
                    if let Err(cleanup) = std::fs::remove_dir_all(&store_dir) {
                        warn!(path = %store_dir.display(), error = %cleanup, "could not remove store of failed checkout");
                    }
                }
                Err(e)
            }
        }
    }

    /// Create an empty working copy at revision 0.
    pub(crate) fn init(project: &str, package: &str, dir: &Path) -> Result<Self, WcError> {
        if Store::is_working_copy(dir) {
            return Err(WcError::InvalidOperation(format!(
                "'{}' is already a working copy",
                dir.display()
            )));
        }
        let ident = crate::store::PackageIdent {
            project: project.to_string(),
            package: package.to_string(),
        };
        let store = Store::init(dir, &ident)?;
        let state = store.load()?;
        Ok(Self {
            store,
            state,
            interrupted: false,
        })
    }

    /// Bring a damaged store back to a consistent state: re-fetch missing
    /// pristine copies at the recorded revision, delete orphans and drop
    /// dangling pending names.
    pub async fn repair<T: Transport>(ctx: &Context<T>, dir: &Path) -> Result<Self, WcError> {
        let store = Store::locate(dir)?;
        recover_commit(&store)?;
        let mut state = store.load()?;
        let pristine = store.pristine_names()?;

        for name in pristine.iter().filter(|n| !state.files.contains_key(*n)) {
            warn!(file = %name, "removing orphaned pristine copy");
            store.remove_pristine(name)?;
        }
        for entry in state.files.values() {
            if entry.skipped || pristine.contains(&entry.name) {
                continue;
            }
            info!(file = %entry.name, revision = %state.meta.revision, "re-fetching pristine copy");
            let content = ctx
                .transport
                .fetch_file(
                    &state.ident.project,
                    &state.ident.package,
                    &entry.name,
                    &state.meta.revision,
                )
                .await?;
            store.write_pristine(&entry.name, &content)?;
        }

        let files = &state.files;
        state.pending.to_be_deleted.retain(|n| files.contains_key(n));
        state.pending.in_conflict.retain(|n| files.contains_key(n));
        let Pending {
            to_be_deleted,
            in_conflict,
            to_be_added,
        } = &mut state.pending;
        to_be_added.retain(|n| !to_be_deleted.contains(n) && !in_conflict.contains(n));
        store.write_pending(&state.pending)?;
        if !state.meta.is_link() {
            store.set_frozen(false)?;
            store.write_pulled(None)?;
        }
        Self::open(dir)
    }

    // -- accessors ----------------------------------------------------------

    pub fn dir(&self) -> &Path {
        self.store.root()
    }

    pub fn project(&self) -> &str {
        &self.state.ident.project
    }

    pub fn package(&self) -> &str {
        &self.state.ident.package
    }

    pub fn meta(&self) -> &RevisionMeta {
        &self.state.meta
    }

    pub fn revision(&self) -> &str {
        &self.state.meta.revision
    }

    pub fn file_entry(&self, name: &str) -> Option<&FileEntry> {
        self.state.files.get(name)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.state.files.values()
    }

    pub fn pending(&self) -> &Pending {
        &self.state.pending
    }

    pub fn is_frozen(&self) -> bool {
        self.state.frozen
    }

    pub fn pulled(&self) -> Option<&PullRecord> {
        self.state.pulled.as_ref()
    }

    pub fn is_link_repair(&self) -> bool {
        self.state.link_repair
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    // -- internals ----------------------------------------------------------

    fn ensure_ready(&self) -> Result<(), WcError> {
        if self.interrupted {
            return Err(WcError::Inconsistent {
                path: self.dir().display().to_string(),
                violations: vec!["an interrupted update must be finished first".into()],
            });
        }
        Ok(())
    }

    fn reload(&mut self) -> Result<(), WcError> {
        self.state = self.store.load()?;
        Ok(())
    }

    fn save_pending(&self) -> Result<(), WcError> {
        self.store.write_pending(&self.state.pending)
    }

    fn facts(&self, name: &str) -> Result<StatusFacts, WcError> {
        let entry = self.state.files.get(name);
        let pending = &self.state.pending;
        let mut facts = StatusFacts {
            in_working_dir: self.store.has_work(name),
            in_store: self.store.has_pristine(name),
            known: entry.is_some(),
            to_be_added: pending.to_be_added.contains(name),
            to_be_deleted: pending.to_be_deleted.contains(name),
            in_conflict: pending.in_conflict.contains(name),
            skipped: entry.is_some_and(|e| e.skipped),
            content_changed: false,
        };
        if let Some(entry) = entry.filter(|_| needs_content_check(&facts)) {
            facts.content_changed = md5_hex(&self.store.read_work(name)?) != entry.md5;
        }
        Ok(facts)
    }

    /// Status without the interrupted-update guard.
    fn status_of(&self, name: &str) -> Result<FileStatus, WcError> {
        classify(name, &self.facts(name)?)
    }

    fn is_nowhere(facts: &StatusFacts) -> bool {
        !facts.in_working_dir
            && !facts.in_store
            && !facts.known
            && !facts.to_be_added
            && !facts.to_be_deleted
            && !facts.in_conflict
    }

    // -- status -------------------------------------------------------------

    /// Status of one file.
    pub fn file_status(&self, name: &str) -> Result<FileStatus, WcError> {
        self.ensure_ready()?;
        let facts = self.facts(name)?;
        if Self::is_nowhere(&facts) {
            return Err(WcError::NotFound(name.to_string()));
        }
        classify(name, &facts)
    }

    /// Status of `names`, or of every tracked, pending and unversioned file
    /// when `names` is empty. Unversioned files matching `exclude_glob` are
    /// left out of the full listing.
    pub fn status(
        &self,
        options: &WcOptions,
        names: &[String],
    ) -> Result<Vec<(FileStatus, String)>, WcError> {
        self.ensure_ready()?;
        if !names.is_empty() {
            return names
                .iter()
                .map(|n| self.file_status(n).map(|s| (s, n.clone())))
                .collect();
        }

        let pending = &self.state.pending;
        let mut candidates: BTreeSet<String> = self.state.files.keys().cloned().collect();
        candidates.extend(pending.to_be_added.iter().cloned());
        candidates.extend(pending.to_be_deleted.iter().cloned());
        candidates.extend(pending.in_conflict.iter().cloned());
        for name in self.store.work_names()? {
            if !candidates.contains(&name) && !options.is_excluded(&name) {
                candidates.insert(name);
            }
        }
        candidates
            .into_iter()
            .map(|n| self.status_of(&n).map(|s| (s, n)))
            .collect()
    }

    /// Whether any file carries a change a commit would send, or a conflict.
    pub fn has_local_changes(&self, options: &WcOptions) -> Result<bool, WcError> {
        Ok(self
            .status(options, &[])?
            .iter()
            .any(|(s, _)| s.is_local_change() || *s == FileStatus::Conflicted))
    }

    /// Store invariant violations; empty means consistent.
    pub fn check(&self) -> Result<Vec<String>, WcError> {
        self.store.check(&self.state)
    }

    // -- local operations ---------------------------------------------------

    /// Schedule unversioned files for addition. Adding a file scheduled for
    /// deletion turns it into a re-add.
    pub fn add(&mut self, names: &[String]) -> Result<(), WcError> {
        self.ensure_ready()?;
        for name in names {
            if !is_valid_file_name(name) {
                return Err(WcError::InvalidOperation(format!(
                    "'{name}' is not a valid file name"
                )));
            }
            if !self.store.has_work(name) {
                return Err(WcError::NotFound(name.clone()));
            }
            match self.status_of(name)? {
                FileStatus::Unversioned => {
                    self.state.pending.to_be_added.insert(name.clone());
                    info!(file = %name, "scheduled for addition");
                }
                FileStatus::Deleted => {
                    self.state.pending.to_be_deleted.remove(name);
                    self.state.pending.to_be_added.insert(name.clone());
                    info!(file = %name, "scheduled for re-addition");
                }
                status => {
                    debug!(file = %name, %status, "already under version control");
                }
            }
        }
        self.save_pending()
    }

    /// Schedule files for deletion and remove them from the working
    /// directory. Local modifications require `force`.
    pub fn delete(&mut self, names: &[String], force: bool) -> Result<(), WcError> {
        self.ensure_ready()?;
        for name in names {
            let status = self.file_status(name)?;
            match status {
                FileStatus::Unversioned => return Err(WcError::NotFound(name.clone())),
                FileStatus::Modified | FileStatus::Conflicted if !force => {
                    return Err(WcError::conflict(
                        name.clone(),
                        format!("file is {status}; use force to delete it"),
                    ));
                }
                FileStatus::Added | FileStatus::MissingAdded => {
                    self.state.pending.to_be_added.remove(name);
                    if force {
                        self.store.remove_work(name)?;
                    }
                }
                FileStatus::Deleted => {}
                _ => {
                    if status == FileStatus::Conflicted {
                        self.remove_side_files(name)?;
                    }
                    self.state.pending.forget(name);
                    self.state.pending.to_be_deleted.insert(name.clone());
                    self.store.remove_work(name)?;
                }
            }
            info!(file = %name, "scheduled for deletion");
        }
        self.save_pending()
    }

    /// Undo local changes to files.
    pub fn revert(&mut self, names: &[String]) -> Result<(), WcError> {
        self.ensure_ready()?;
        for name in names {
            let status = self.file_status(name)?;
            match status {
                FileStatus::Unversioned => return Err(WcError::NotFound(name.clone())),
                FileStatus::Added | FileStatus::MissingAdded => {
                    self.state.pending.to_be_added.remove(name);
                }
                FileStatus::Skipped | FileStatus::Unmodified => {}
                FileStatus::Modified
                | FileStatus::Conflicted
                | FileStatus::Missing
                | FileStatus::Deleted
                | FileStatus::ReAdded => {
                    if status == FileStatus::Conflicted {
                        self.remove_side_files(name)?;
                    }
                    self.state.pending.forget(name);
                    let pristine = self.store.read_pristine(name)?;
                    self.store.write_work(name, &pristine)?;
                }
            }
            debug!(file = %name, %status, "reverted");
        }
        self.save_pending()
    }

    /// Mark conflicted files as resolved and drop their side-files.
    pub fn resolve(&mut self, names: &[String]) -> Result<(), WcError> {
        self.ensure_ready()?;
        for name in names {
            if self.file_status(name)? != FileStatus::Conflicted {
                return Err(WcError::InvalidOperation(format!(
                    "'{name}' is not in conflict"
                )));
            }
            self.remove_side_files(name)?;
            self.state.pending.in_conflict.remove(name);
            info!(file = %name, "resolved");
        }
        self.save_pending()
    }

    // -- conflict side-files ------------------------------------------------

    pub fn side_file_names(name: &str) -> [String; 3] {
        SIDE_FILE_SUFFIXES.map(|suffix| format!("{name}.{suffix}"))
    }

    fn write_side_files(
        &self,
        name: &str,
        mine: &[u8],
        older: &[u8],
        yours: &[u8],
    ) -> Result<(), WcError> {
        let [m, o, n] = Self::side_file_names(name);
        self.store.write_work(&m, mine)?;
        self.store.write_work(&o, older)?;
        self.store.write_work(&n, yours)?;
        Ok(())
    }

    fn remove_side_files(&self, name: &str) -> Result<(), WcError> {
        for side in Self::side_file_names(name) {
            self.store.remove_work(&side)?;
        }
        Ok(())
    }

    /// Move `name` into the conflict set and persist the pending sets.
    fn mark_conflict(&mut self, name: &str) -> Result<(), WcError> {
        self.state.pending.forget(name);
        self.state.pending.in_conflict.insert(name.to_string());
        self.save_pending()
    }
}
