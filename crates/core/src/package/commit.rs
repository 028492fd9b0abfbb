//! Commit protocol: propose a manifest, upload what the server is missing,
//! retry, and promote the staged pristine copies once the server accepts.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use super::link::LinkMode;
use super::PackageWc;
use crate::api::{CommitFlags, CommitReply, ManifestEntry, RevisionQuery, Transport};
use crate::context::Context;
use crate::errors::WcError;
use crate::models::{md5_hex, sha256_hex, FileStatus, SourceTree};
use crate::transaction::{PromotionPlan, Transaction};

/// Upload rounds before the commit gives up on a server that keeps
/// reporting missing content.
pub const MAX_UPLOAD_ROUNDS: usize = 3;

/// Result of [`PackageWc::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    NothingToCommit,
    Committed {
        revision: String,
        /// Names uploaded during the commit, in upload order.
        uploaded: Vec<String>,
    },
}

/// What a commit sends.
#[derive(Debug, Default)]
struct Selection {
    manifest: Vec<ManifestEntry>,
    /// Content of every file whose local change is committed.
    send: BTreeMap<String, Vec<u8>>,
    added: Vec<String>,
    deleted: Vec<String>,
}

impl PackageWc {
    /// Commit local changes: every change when `todo` is `None`, otherwise
    /// only the named files.
    ///
    /// Nothing is written locally until the server has accepted the new
    /// revision; a failed commit leaves the working copy exactly as it was.
    pub async fn commit<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        message: &str,
        todo: Option<&[String]>,
    ) -> Result<CommitOutcome, WcError> {
        self.ensure_ready()?;
        if self.state.frozen {
            return Err(self.link_error("link is frozen; pull the target changes before committing"));
        }
        let selection = self.select(todo)?;
        if selection.send.is_empty()
            && selection.deleted.is_empty()
            && self.state.pulled.is_none()
            && !self.state.link_repair
        {
            info!(path = %self.dir().display(), "nothing to commit");
            return Ok(CommitOutcome::NothingToCommit);
        }

        let latest = self.latest_revision(ctx, LinkMode::Default).await?;
        if self.state.frozen {
            return Err(self.link_error("link is broken against its target; the working copy is now frozen"));
        }
        if latest != self.state.meta.revision {
            return Err(WcError::Outdated {
                path: self.dir().display().to_string(),
                local: self.state.meta.revision.clone(),
                upstream: latest,
            });
        }

        let repairlink = self.state.pulled.is_some() || self.state.link_repair;
        let flags = CommitFlags {
            keeplink: self.state.meta.is_expanded_link(),
            repairlink,
            linkrev: self
                .state
                .meta
                .linkinfo
                .as_ref()
                .and_then(|li| li.base_revision.clone())
                .filter(|_| repairlink),
        };

        let mut txn = Transaction::begin(&self.store)?;
        let (tree, uploaded) = match self
            .transmit(ctx, &mut txn, &selection, message, &flags)
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                txn.rollback()?;
                return Err(e);
            }
        };

        let plan = match self.plan(ctx, &mut txn, &selection, tree).await {
            Ok(plan) => plan,
            Err(e) => {
                txn.rollback()?;
                return Err(e);
            }
        };
        let revision = plan.meta.revision.clone();
        txn.promote(&plan)?;
        self.reload()?;
        info!(
            revision = %revision,
            sent = selection.send.len(),
            deleted = selection.deleted.len(),
            uploaded = uploaded.len(),
            "committed"
        );
        Ok(CommitOutcome::Committed { revision, uploaded })
    }

    /// Build the manifest of the new revision from the current file states.
    fn select(&self, todo: Option<&[String]>) -> Result<Selection, WcError> {
        if let Some(names) = todo {
            for name in names {
                if self.file_status(name)? == FileStatus::Unversioned {
                    return Err(WcError::NotFound(name.clone()));
                }
            }
        }
        let chosen = |name: &str| todo.map_or(true, |names| names.iter().any(|n| n == name));

        let mut candidates: BTreeSet<String> = self.state.files.keys().cloned().collect();
        candidates.extend(self.state.pending.to_be_added.iter().cloned());

        let mut sel = Selection::default();
        for name in candidates {
            let status = self.status_of(&name)?;
            let selected = chosen(&name);
            match status {
                FileStatus::Conflicted | FileStatus::MissingAdded if selected => {
                    return Err(WcError::conflict(
                        name,
                        format!("file is {status}; resolve it before committing"),
                    ));
                }
                FileStatus::Added | FileStatus::ReAdded | FileStatus::Modified if selected => {
                    let content = self.store.read_work(&name)?;
                    sel.manifest.push(ManifestEntry {
                        name: name.clone(),
                        md5: md5_hex(&content),
                        sha256: Some(sha256_hex(&content)),
                    });
                    if status != FileStatus::Modified {
                        sel.added.push(name.clone());
                    }
                    sel.send.insert(name, content);
                }
                FileStatus::Deleted if selected => sel.deleted.push(name),
                FileStatus::Added | FileStatus::MissingAdded => {}
                _ => {
                    if let Some(entry) = self.state.files.get(&name) {
                        sel.manifest.push(ManifestEntry {
                            name,
                            md5: entry.md5.clone(),
                            sha256: None,
                        });
                    }
                }
            }
        }
        debug!(
            entries = sel.manifest.len(),
            send = sel.send.len(),
            "commit manifest built"
        );
        Ok(sel)
    }

    /// Propose the manifest, uploading whatever the server reports missing,
    /// until it accepts or the upload rounds run out.
    async fn transmit<T: Transport>(
        &self,
        ctx: &Context<T>,
        txn: &mut Transaction<'_>,
        sel: &Selection,
        message: &str,
        flags: &CommitFlags,
    ) -> Result<(SourceTree, Vec<String>), WcError> {
        let (project, package) = (self.project(), self.package());
        let mut uploaded = Vec::new();
        let mut rounds = 0;
        loop {
            let reply = ctx
                .transport
                .propose_commit(project, package, &sel.manifest, message, flags)
                .await?;
            let missing = match reply {
                CommitReply::Committed(tree) => break Ok((tree, uploaded)),
                CommitReply::Missing(missing) => missing,
            };
            if rounds == MAX_UPLOAD_ROUNDS {
                warn!(rounds, ?missing, "server still reports missing content");
                return Err(WcError::Protocol { rounds, missing });
            }
            rounds += 1;
            for name in &missing {
                let content = match sel.send.get(name) {
                    Some(content) => content.clone(),
                    None => self.store.read_pristine(name)?,
                };
                debug!(file = %name, round = rounds, "uploading");
                ctx.transport
                    .upload_file(project, package, name, &content)
                    .await?;
                if !txn.is_staged(name) {
                    txn.stage(name, &content)?;
                }
                uploaded.push(name.clone());
            }
        }
    }

    /// Stage every pristine copy the new revision needs and describe the
    /// promotion.
    async fn plan<T: Transport>(
        &self,
        ctx: &Context<T>,
        txn: &mut Transaction<'_>,
        sel: &Selection,
        reply: SourceTree,
    ) -> Result<PromotionPlan, WcError> {
        for (name, content) in &sel.send {
            if !txn.is_staged(name) {
                txn.stage(name, content)?;
            }
        }

        let tree = if self.state.meta.is_expanded_link() {
            let expanded = reply
                .meta
                .linkinfo
                .as_ref()
                .and_then(|li| li.expanded_hash.clone())
                .ok_or_else(|| {
                    self.link_error("committed, but the server could not expand the link; run update")
                })?;
            ctx.transport
                .fetch_tree(
                    self.project(),
                    self.package(),
                    &RevisionQuery::at(expanded).expanded(),
                )
                .await?
        } else {
            reply
        };

        let mut files = Vec::with_capacity(tree.files.len());
        for entry in &tree.files {
            let old = self.state.files.get(&entry.name);
            let unchanged = old.is_some_and(|o| o.md5 == entry.md5);
            let mut entry = entry.clone();
            if unchanged && old.is_some_and(|o| o.skipped) {
                entry.skipped = true;
            } else if !txn.is_staged(&entry.name)
                && !(unchanged && self.store.has_pristine(&entry.name))
            {
                debug!(file = %entry.name, "fetching pristine copy of new revision");
                let content = self.fetch(ctx, &entry.name, &tree.meta.revision).await?;
                txn.stage(&entry.name, &content)?;
            }
            files.push(entry);
        }

        let new_names = tree.names();
        Ok(PromotionPlan {
            remove: self
                .state
                .files
                .keys()
                .filter(|n| !new_names.contains(*n))
                .cloned()
                .collect(),
            clear_added: sel.added.clone(),
            clear_deleted: sel.deleted.clone(),
            meta: tree.meta,
            files,
        })
    }
}
