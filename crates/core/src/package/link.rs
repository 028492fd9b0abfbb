//! Source link handling: resolving the revision to work against, freezing
//! on broken links, pulling target changes and repairing broken links.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{info, warn};

use super::update::{FileAction, UpdateOptions, UpdateReport};
use super::PackageWc;
use crate::api::{LinkResolution, RevisionQuery, Transport};
use crate::context::Context;
use crate::errors::WcError;
use crate::models::{md5_hex, FileStatus, Linkinfo, SourceTree};
use crate::store::PullRecord;

/// Which shape of a link package to work with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkMode {
    /// Keep the working copy's current shape; new checkouts expand.
    #[default]
    Default,
    Expand,
    Unexpand,
}

/// Result of [`PackageWc::pull`].
#[derive(Debug, Clone)]
pub enum PullOutcome {
    /// The link target has not moved.
    UpToDate,
    Pulled(UpdateReport),
}

impl PackageWc {
    fn wants_expansion(&self, mode: LinkMode) -> bool {
        match mode {
            LinkMode::Expand => true,
            LinkMode::Unexpand => false,
            LinkMode::Default => {
                self.state.meta.is_expanded_link()
                    || (self.state.meta.linkinfo.is_none() && self.state.files.is_empty())
            }
        }
    }

    pub(super) fn link_error(&self, detail: impl Into<String>) -> WcError {
        WcError::LinkExpand {
            package: format!("{}/{}", self.project(), self.package()),
            detail: detail.into(),
        }
    }

    /// The newest revision this working copy may move to.
    ///
    /// Expanded links are resolved on the server. Frozen and pulled copies
    /// resolve against their known-good target. When the link is broken
    /// against the target's latest revision, the known-good targets are
    /// tried in turn and the copy is frozen on success.
    pub async fn latest_revision<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        mode: LinkMode,
    ) -> Result<String, WcError> {
        let (project, package) = (self.project().to_string(), self.package().to_string());
        if self.state.link_repair {
            return Ok(self.state.meta.revision.clone());
        }
        if !self.wants_expansion(mode) {
            let raw = ctx
                .transport
                .fetch_tree(&project, &package, &RevisionQuery::latest())
                .await?;
            return Ok(raw.meta.revision);
        }

        if self.state.frozen || self.state.pulled.is_some() {
            let known_good = self
                .state
                .meta
                .linkinfo
                .as_ref()
                .and_then(|li| li.known_good_targets().into_iter().next())
                .ok_or_else(|| self.link_error("no known-good link target recorded"))?;
            return match ctx
                .transport
                .resolve_link(&project, &package, Some(&known_good))
                .await?
            {
                LinkResolution::Expanded(hash) => Ok(hash),
                LinkResolution::Broken(reason) => Err(self.link_error(reason)),
            };
        }

        let raw = ctx
            .transport
            .fetch_tree(&project, &package, &RevisionQuery::latest())
            .await?;
        let Some(raw_link) = raw.meta.linkinfo else {
            return Ok(raw.meta.revision);
        };
        let reason = match ctx.transport.resolve_link(&project, &package, None).await? {
            LinkResolution::Expanded(hash) => return Ok(hash),
            LinkResolution::Broken(reason) => reason,
        };

        warn!(project = %project, package = %package, %reason, "link is broken against the latest target");
        let candidates = match &self.state.meta.linkinfo {
            Some(li) => li.known_good_targets(),
            None => raw_link.base_revision.into_iter().collect(),
        };
        for target in candidates {
            if let LinkResolution::Expanded(hash) = ctx
                .transport
                .resolve_link(&project, &package, Some(&target))
                .await?
            {
                warn!(target = %target, "falling back to known-good link target; working copy is frozen");
                self.state.frozen = true;
                if self.state.meta.is_link() {
                    self.store.set_frozen(true)?;
                }
                return Ok(hash);
            }
        }
        Err(self.link_error(reason))
    }

    /// The listing an update should move to.
    pub(super) async fn update_target<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        opts: &UpdateOptions,
    ) -> Result<SourceTree, WcError> {
        let expand = self.wants_expansion(opts.link_mode);
        let rev = match &opts.revision {
            Some(rev) => rev.clone(),
            None => self.latest_revision(ctx, opts.link_mode).await?,
        };
        let mut query = RevisionQuery::at(rev);
        query.expand = expand;
        if expand && (self.state.frozen || self.state.pulled.is_some()) {
            query.linkrev = self
                .state
                .meta
                .linkinfo
                .as_ref()
                .and_then(|li| li.known_good_targets().into_iter().next());
        }
        let tree = ctx
            .transport
            .fetch_tree(self.project(), self.package(), &query)
            .await?;
        if let Some(err) = tree.meta.linkinfo.as_ref().and_then(|li| li.error.clone()) {
            if expand {
                return Err(self.link_error(err));
            }
        }
        Ok(tree)
    }

    /// Merge the link target's latest changes into a frozen (or already
    /// pulled) expanded link.
    ///
    /// Pristine copies keep describing the old expansion, so the merged
    /// changes show up as local modifications; the next commit sends them
    /// with `repairlink` and clears the pull record.
    pub async fn pull<T: Transport>(&mut self, ctx: &Context<T>) -> Result<PullOutcome, WcError> {
        self.ensure_ready()?;
        let linkinfo = self
            .state
            .meta
            .linkinfo
            .clone()
            .filter(Linkinfo::is_expanded)
            .ok_or_else(|| WcError::InvalidOperation("not an expanded link".into()))?;
        if !self.state.frozen && self.state.pulled.is_none() {
            return Err(WcError::InvalidOperation(
                "link is neither frozen nor pulled; run update instead".into(),
            ));
        }
        let conflicted: Vec<String> = self
            .status(&ctx.options, &[])?
            .into_iter()
            .filter(|(s, _)| *s == FileStatus::Conflicted)
            .map(|(_, n)| n)
            .collect();
        if !conflicted.is_empty() {
            return Err(WcError::conflict(
                conflicted.join(", "),
                "resolve conflicts before pulling",
            ));
        }
        let latest = self.latest_revision(ctx, LinkMode::Default).await?;
        if latest != self.state.meta.revision {
            return Err(WcError::Outdated {
                path: self.dir().display().to_string(),
                local: self.state.meta.revision.clone(),
                upstream: latest,
            });
        }

        let old_base = match &self.state.pulled {
            Some(p) => p.new_base.clone(),
            None => linkinfo.tree_hash.clone(),
        };
        let new_base = ctx
            .transport
            .fetch_tree(&linkinfo.project, &linkinfo.package, &RevisionQuery::latest())
            .await?
            .meta
            .tree_hash;

        let mut report = UpdateReport {
            revision: self.state.meta.revision.clone(),
            ..UpdateReport::default()
        };
        if !self
            .merge_target_change(ctx, &linkinfo, &old_base, &new_base, &mut report)
            .await?
        {
            return Ok(PullOutcome::UpToDate);
        }

        let record = PullRecord {
            old_base: self
                .state
                .pulled
                .as_ref()
                .map_or(old_base, |p| p.old_base.clone()),
            new_base: new_base.clone(),
        };
        self.store.write_pulled(Some(&record))?;
        self.state.pulled = Some(record);
        self.state.frozen = false;
        self.store.set_frozen(false)?;
        self.set_base_revision(new_base)?;
        info!(changes = report.changes.len(), "pulled link target changes");
        Ok(PullOutcome::Pulled(report))
    }

    /// Check out the last working expansion of a broken link into `dir` and
    /// merge the target's changes since then into it.
    pub async fn repair_link<T: Transport>(
        ctx: &Context<T>,
        project: &str,
        package: &str,
        dir: &Path,
    ) -> Result<Self, WcError> {
        let raw = ctx
            .transport
            .fetch_tree(project, package, &RevisionQuery::latest())
            .await?;
        let broken = raw
            .meta
            .linkinfo
            .ok_or_else(|| WcError::InvalidOperation(format!("{project}/{package} is not a link")))?;
        if !broken.has_error() {
            return Err(WcError::InvalidOperation(format!(
                "link {project}/{package} is not broken"
            )));
        }

        let query = RevisionQuery {
            expand: true,
            last_working: true,
            ..RevisionQuery::default()
        };
        let good = ctx.transport.fetch_tree(project, package, &query).await?;
        let good_link = good
            .meta
            .linkinfo
            .clone()
            .filter(Linkinfo::is_expanded)
            .ok_or_else(|| WcError::LinkExpand {
                package: format!("{project}/{package}"),
                detail: "server has no working expansion of this link".into(),
            })?;

        let mut wc = Self::init(project, package, dir)?;
        let mut report = UpdateReport::default();
        wc.install(ctx, &good, &mut report).await?;

        let new_base = broken.tree_hash.clone();
        wc.merge_target_change(ctx, &good_link, &good_link.tree_hash, &new_base, &mut report)
            .await?;
        wc.set_base_revision(new_base)?;
        wc.state.link_repair = true;
        wc.store.set_link_repair(true)?;
        info!(project, package, changes = report.changes.len(), "prepared link repair");
        Ok(wc)
    }

    fn set_base_revision(&mut self, base: String) -> Result<(), WcError> {
        if let Some(li) = self.state.meta.linkinfo.as_mut() {
            li.base_revision = Some(base);
        }
        self.store.write_meta(&self.state.meta)
    }

    /// Apply the link target's change from `old_base` to `new_base` to the
    /// working files. Returns `false` when the target did not change.
    async fn merge_target_change<T: Transport>(
        &mut self,
        ctx: &Context<T>,
        target: &Linkinfo,
        old_base: &str,
        new_base: &str,
        report: &mut UpdateReport,
    ) -> Result<bool, WcError> {
        let (tp, tpkg) = (target.project.as_str(), target.package.as_str());
        let older = ctx
            .transport
            .fetch_tree(tp, tpkg, &RevisionQuery::at(old_base))
            .await?;
        let newer = ctx
            .transport
            .fetch_tree(tp, tpkg, &RevisionQuery::at(new_base))
            .await?;
        if older.meta.tree_hash == newer.meta.tree_hash {
            return Ok(false);
        }
        let merger = ctx.options.merge_tool.merger();

        let names: BTreeSet<String> = older.names().union(&newer.names()).cloned().collect();
        for name in &names {
            match (older.file(name), newer.file(name)) {
                (None, Some(_)) => {
                    let yours = ctx.transport.fetch_file(tp, tpkg, name, new_base).await?;
                    let tracked = self.state.files.contains_key(name);
                    if !self.store.has_work(name) {
                        self.store.write_work(name, &yours)?;
                    } else if self.store.read_work(name)? != yours {
                        if !tracked {
                            warn!(file = %name, "target added a file that exists locally; leaving it alone");
                            report.record(FileAction::Kept, name);
                            continue;
                        }
                        let mine = self.store.read_work(name)?;
                        let action =
                            self.merge_file(merger.as_ref(), None, name, &mine, b"", &yours)?;
                        report.record(action, name);
                        continue;
                    }
                    if !tracked {
                        self.state.pending.to_be_added.insert(name.clone());
                    }
                    report.record(FileAction::Added, name);
                }
                (Some(old), None) => {
                    let unchanged = !self.store.has_work(name)
                        || md5_hex(&self.store.read_work(name)?) == old.md5;
                    if unchanged {
                        self.store.remove_work(name)?;
                        if self.state.files.contains_key(name) {
                            self.state.pending.to_be_deleted.insert(name.clone());
                        }
                        report.record(FileAction::Deleted, name);
                    } else {
                        warn!(file = %name, "target removed a file the link changed; keeping it");
                        report.record(FileAction::Kept, name);
                    }
                }
                (Some(old), Some(new)) if old.md5 != new.md5 => {
                    let yours = ctx.transport.fetch_file(tp, tpkg, name, new_base).await?;
                    if !self.store.has_work(name) {
                        self.store.write_work(name, &yours)?;
                        report.record(FileAction::Restored, name);
                        continue;
                    }
                    let older_content = ctx.transport.fetch_file(tp, tpkg, name, old_base).await?;
                    let mine = self.store.read_work(name)?;
                    let action = self.merge_file(
                        merger.as_ref(),
                        None,
                        name,
                        &mine,
                        &older_content,
                        &yours,
                    )?;
                    report.record(action, name);
                }
                _ => {}
            }
        }
        self.save_pending()?;
        Ok(true)
    }
}
