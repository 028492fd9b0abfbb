//! In-process build service.
//!
//! Keeps packages, revisions and a content-addressed blob store in memory,
//! expands source links, and can be told to misbehave (drop uploads, fail
//! downloads) so tests can exercise the engine's recovery paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{CommitFlags, CommitReply, LinkResolution, ManifestEntry, RevisionQuery, Transport};
use crate::errors::ApiError;
use crate::models::{md5_hex, tree_hash, FileEntry, Linkinfo, RevisionMeta, SourceTree};

const LINK_FILE: &str = "_link";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stored {
    md5: String,
    mtime: DateTime<Utc>,
}

type Tree = BTreeMap<String, Stored>;

#[derive(Debug, Clone)]
struct LinkTarget {
    project: String,
    package: String,
}

#[derive(Debug, Clone, Default)]
struct Revision {
    /// Raw files; for links the local overlay plus `_link`.
    files: Tree,
    /// Target tree hash the overlay is based on.
    base: Option<String>,
    /// Target files the link drops.
    removed: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct PackageRecord {
    revisions: Vec<Revision>,
    link: Option<LinkTarget>,
    /// Target tree hash the link fails to expand against, with the reason.
    broken: Option<(String, String)>,
    last_working: Option<String>,
}

#[derive(Debug, Clone)]
struct Expansion {
    project: String,
    package: String,
    target_hash: String,
    raw_hash: String,
    base: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    /// Every tree ever listed, by tree hash.
    trees: HashMap<String, Tree>,
    expansions: HashMap<String, Expansion>,
    packages: BTreeMap<(String, String), PackageRecord>,
    clock: i64,
    uploads: HashMap<String, usize>,
    requests: usize,
    commits: usize,
    drop_uploads: bool,
    /// Uploads of a name still to be dropped.
    drop_budget: HashMap<String, usize>,
    fetch_budget: Option<usize>,
}

/// In-memory [`Transport`] implementation.
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<State>,
}

fn key(project: &str, package: &str) -> (String, String) {
    (project.to_string(), package.to_string())
}

fn not_found(what: impl Into<String>) -> ApiError {
    ApiError::NotFound(what.into())
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::<Utc>::from_timestamp(1_700_000_000 + self.clock, 0).unwrap_or_default()
    }

    fn store_blob(&mut self, content: &[u8]) -> String {
        let md5 = md5_hex(content);
        self.blobs.entry(md5.clone()).or_insert_with(|| content.to_vec());
        md5
    }

    fn entries(&self, tree: &Tree) -> Vec<FileEntry> {
        tree.iter()
            .map(|(name, s)| FileEntry {
                name: name.clone(),
                md5: s.md5.clone(),
                size: self.blobs.get(&s.md5).map_or(0, |b| b.len() as u64),
                mtime: s.mtime,
                skipped: false,
            })
            .collect()
    }

    fn remember(&mut self, tree: &Tree) -> String {
        let hash = tree_hash(&self.entries(tree));
        self.trees.insert(hash.clone(), tree.clone());
        hash
    }

    fn record(&self, project: &str, package: &str) -> Result<&PackageRecord, ApiError> {
        self.packages
            .get(&key(project, package))
            .ok_or_else(|| not_found(format!("{project}/{package}")))
    }

    fn record_mut(&mut self, project: &str, package: &str) -> Result<&mut PackageRecord, ApiError> {
        self.packages
            .get_mut(&key(project, package))
            .ok_or_else(|| not_found(format!("{project}/{package}")))
    }

    /// Raw revision by ordinal, raw tree hash, or latest. Ordinal 0 is the
    /// empty revision of a package that was never committed.
    fn raw_revision(
        &self,
        project: &str,
        package: &str,
        rev: Option<&str>,
    ) -> Result<(usize, Revision), ApiError> {
        let rec = self.record(project, package)?;
        let latest = rec.revisions.len();
        let idx = match rev {
            None => latest,
            Some(r) => match r.parse::<usize>() {
                Ok(n) if n <= latest => n,
                _ => rec
                    .revisions
                    .iter()
                    .position(|rv| tree_hash(&self.entries(&rv.files)) == r)
                    .map(|i| i + 1)
                    .ok_or_else(|| not_found(format!("{project}/{package} revision {r}")))?,
            },
        };
        let revision = match idx {
            0 => Revision::default(),
            n => rec.revisions[n - 1].clone(),
        };
        Ok((idx, revision))
    }

    /// Target tree at `linkrev` (ordinal or tree hash) or latest.
    fn target_tree(
        &mut self,
        target: &LinkTarget,
        linkrev: Option<&str>,
    ) -> Result<(String, Tree), ApiError> {
        if let Some(hash) = linkrev {
            if let Some(tree) = self.trees.get(hash) {
                return Ok((hash.to_string(), tree.clone()));
            }
        }
        let (_, rev) = self.raw_revision(&target.project, &target.package, linkrev)?;
        let hash = self.remember(&rev.files);
        Ok((hash, rev.files))
    }

    /// Expand `raw` against the link target. `Ok(Err(reason))` means the
    /// link is broken for that target.
    fn expand(
        &mut self,
        project: &str,
        package: &str,
        raw: &Revision,
        linkrev: Option<&str>,
    ) -> Result<Result<String, String>, ApiError> {
        let rec = self.record(project, package)?;
        let target = rec
            .link
            .clone()
            .ok_or_else(|| ApiError::Status {
                status: 400,
                body: format!("{project}/{package} is not a link"),
            })?;
        let broken = rec.broken.clone();
        let (target_hash, mut files) = self.target_tree(&target, linkrev)?;
        if let Some((at, reason)) = broken {
            if at == target_hash {
                return Ok(Err(reason));
            }
        }
        files.retain(|name, _| !raw.removed.contains(name));
        for (name, stored) in &raw.files {
            if name != LINK_FILE {
                files.insert(name.clone(), stored.clone());
            }
        }
        let raw_hash = tree_hash(&self.entries(&raw.files));
        let hash = self.remember(&files);
        self.expansions.insert(
            hash.clone(),
            Expansion {
                project: project.to_string(),
                package: package.to_string(),
                target_hash,
                raw_hash,
                base: raw.base.clone(),
            },
        );
        Ok(Ok(hash))
    }

    fn expanded_listing(&self, hash: &str) -> Result<SourceTree, ApiError> {
        let exp = self
            .expansions
            .get(hash)
            .ok_or_else(|| not_found(format!("expanded tree {hash}")))?;
        let tree = self
            .trees
            .get(hash)
            .ok_or_else(|| not_found(format!("tree {hash}")))?;
        let rec = self.record(&exp.project, &exp.package)?;
        let target = rec.link.clone().ok_or_else(|| not_found("link target"))?;
        Ok(SourceTree {
            meta: RevisionMeta {
                revision: hash.to_string(),
                tree_hash: hash.to_string(),
                linkinfo: Some(Linkinfo {
                    project: target.project,
                    package: target.package,
                    tree_hash: exp.target_hash.clone(),
                    expanded_hash: Some(hash.to_string()),
                    unexpanded_hash: Some(exp.raw_hash.clone()),
                    error: None,
                    revision: None,
                    base_revision: exp.base.clone(),
                    last_working: rec.last_working.clone(),
                }),
            },
            files: self.entries(tree),
        })
    }

    fn raw_listing(
        &mut self,
        project: &str,
        package: &str,
        idx: usize,
        raw: &Revision,
    ) -> Result<SourceTree, ApiError> {
        let hash = self.remember(&raw.files);
        let target = self.record(project, package)?.link.clone();
        let linkinfo = match target {
            None => None,
            Some(target) => {
                let (target_hash, _) = self.target_tree(&target, None)?;
                let expansion = self.expand(project, package, raw, None)?;
                let last_working = self.record(project, package)?.last_working.clone();
                let (expanded_hash, error) = match expansion {
                    Ok(h) => (Some(h), None),
                    Err(reason) => (None, Some(reason)),
                };
                Some(Linkinfo {
                    project: target.project,
                    package: target.package,
                    tree_hash: target_hash,
                    expanded_hash,
                    unexpanded_hash: None,
                    error,
                    revision: None,
                    base_revision: raw.base.clone(),
                    last_working,
                })
            }
        };
        Ok(SourceTree {
            meta: RevisionMeta {
                revision: idx.to_string(),
                tree_hash: hash,
                linkinfo,
            },
            files: self.entries(&raw.files),
        })
    }

    fn push_revision(&mut self, project: &str, package: &str, revision: Revision) -> String {
        let rec = self.packages.entry(key(project, package)).or_default();
        rec.revisions.push(revision);
        rec.revisions.len().to_string()
    }

    fn take_fetch_budget(&mut self) -> Result<(), ApiError> {
        match self.fetch_budget {
            Some(0) => Err(ApiError::Unavailable("injected download failure".into())),
            Some(ref mut n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- fixture helpers ----------------------------------------------------

    /// Record a new revision containing exactly `files` (plus `_link` for
    /// link packages). Creates the package when needed.
    pub fn commit_files(&self, project: &str, package: &str, files: &[(&str, &[u8])]) -> String {
        let mut st = self.lock();
        let mtime = st.tick();
        let mut tree = Tree::new();
        for (name, content) in files {
            let md5 = st.store_blob(content);
            tree.insert(name.to_string(), Stored { md5, mtime });
        }
        let prev = st
            .packages
            .get(&key(project, package))
            .and_then(|r| r.revisions.last().cloned())
            .unwrap_or_default();
        if let Some(link) = prev.files.get(LINK_FILE) {
            tree.insert(LINK_FILE.to_string(), link.clone());
        }
        let rev = st.push_revision(
            project,
            package,
            Revision {
                files: tree,
                base: prev.base,
                removed: prev.removed,
            },
        );
        debug!(project, package, rev = %rev, "fixture commit");
        rev
    }

    /// Add or replace one file on top of the latest revision.
    pub fn put_file(&self, project: &str, package: &str, name: &str, content: &[u8]) -> String {
        let mut files = self.latest_files(project, package);
        files.insert(name.to_string(), content.to_vec());
        self.commit_owned(project, package, files)
    }

    /// Drop one file from the latest revision.
    pub fn remove_file(&self, project: &str, package: &str, name: &str) -> String {
        let mut files = self.latest_files(project, package);
        files.remove(name);
        self.commit_owned(project, package, files)
    }

    fn commit_owned(&self, project: &str, package: &str, files: BTreeMap<String, Vec<u8>>) -> String {
        let borrowed: Vec<(&str, &[u8])> = files
            .iter()
            .filter(|(n, _)| n.as_str() != LINK_FILE)
            .map(|(n, c)| (n.as_str(), c.as_slice()))
            .collect();
        self.commit_files(project, package, &borrowed)
    }

    fn latest_files(&self, project: &str, package: &str) -> BTreeMap<String, Vec<u8>> {
        let st = self.lock();
        let Some(rev) = st
            .packages
            .get(&key(project, package))
            .and_then(|r| r.revisions.last())
        else {
            return BTreeMap::new();
        };
        rev.files
            .iter()
            .filter_map(|(n, s)| st.blobs.get(&s.md5).map(|b| (n.clone(), b.clone())))
            .collect()
    }

    /// Create `package` as a link to `target_project/target_package`.
    pub fn create_link(&self, project: &str, package: &str, target_project: &str, target_package: &str) {
        let mut st = self.lock();
        let target = LinkTarget {
            project: target_project.to_string(),
            package: target_package.to_string(),
        };
        let base = st
            .target_tree(&target, None)
            .map(|(hash, _)| hash)
            .ok();
        let mtime = st.tick();
        let xml = format!("<link project=\"{target_project}\" package=\"{target_package}\"/>\n");
        let md5 = st.store_blob(xml.as_bytes());
        let mut files = Tree::new();
        files.insert(LINK_FILE.to_string(), Stored { md5, mtime });
        let rec = st.packages.entry(key(project, package)).or_default();
        rec.link = Some(target);
        rec.revisions.push(Revision {
            files,
            base,
            removed: BTreeSet::new(),
        });
    }

    /// Make the link fail to expand against its target's current latest
    /// revision.
    pub fn break_link(&self, project: &str, package: &str, reason: &str) {
        let mut st = self.lock();
        let Some(target) = st
            .packages
            .get(&key(project, package))
            .and_then(|r| r.link.clone())
        else {
            return;
        };
        if let Ok((hash, _)) = st.target_tree(&target, None) {
            if let Some(rec) = st.packages.get_mut(&key(project, package)) {
                rec.broken = Some((hash, reason.to_string()));
            }
        }
    }

    /// Remove a package directly, as another client would.
    pub fn remove_package(&self, project: &str, package: &str) {
        self.lock().packages.remove(&key(project, package));
    }

    /// Latest raw content of `name`.
    pub fn file_content(&self, project: &str, package: &str, name: &str) -> Option<Vec<u8>> {
        self.latest_files(project, package).remove(name)
    }

    /// Latest revision ordinal.
    pub fn latest_revision(&self, project: &str, package: &str) -> Option<String> {
        self.lock()
            .packages
            .get(&key(project, package))
            .map(|r| r.revisions.len().to_string())
    }

    /// Content of `name` in the expanded tree of the latest link revision.
    pub fn expanded_content(&self, project: &str, package: &str, name: &str) -> Option<Vec<u8>> {
        let mut st = self.lock();
        let (_, raw) = st.raw_revision(project, package, None).ok()?;
        let hash = st.expand(project, package, &raw, None).ok()?.ok()?;
        let md5 = st.trees.get(&hash)?.get(name)?.md5.clone();
        st.blobs.get(&md5).cloned()
    }

    // -- failure injection & counters ---------------------------------------

    /// Accept uploads without storing them.
    pub fn drop_uploads(&self, drop: bool) {
        self.lock().drop_uploads = drop;
    }

    /// Accept the next `n` uploads of `name` without storing them.
    pub fn drop_uploads_for(&self, name: &str, n: usize) {
        self.lock().drop_budget.insert(name.to_string(), n);
    }

    /// Let `n` more file downloads succeed, then fail every one after.
    pub fn fail_file_fetches_after(&self, n: usize) {
        self.lock().fetch_budget = Some(n);
    }

    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.fetch_budget = None;
        st.drop_uploads = false;
        st.drop_budget.clear();
    }

    pub fn upload_count(&self, name: &str) -> usize {
        self.lock().uploads.get(name).copied().unwrap_or(0)
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }
}

impl Transport for MemoryServer {
    async fn fetch_tree(
        &self,
        project: &str,
        package: &str,
        query: &RevisionQuery,
    ) -> Result<SourceTree, ApiError> {
        let mut st = self.lock();
        st.requests += 1;

        if let Some(rev) = &query.rev {
            let ours = st
                .expansions
                .get(rev)
                .is_some_and(|e| e.project == project && e.package == package);
            if ours {
                return st.expanded_listing(rev);
            }
        }
        if query.last_working {
            let hash = st
                .record(project, package)?
                .last_working
                .clone()
                .ok_or_else(|| not_found(format!("{project}/{package} has no working expansion")))?;
            return st.expanded_listing(&hash);
        }

        let (idx, raw) = st.raw_revision(project, package, query.rev.as_deref())?;
        let is_link = st.record(project, package)?.link.is_some();
        if is_link && query.expand {
            return match st.expand(project, package, &raw, query.linkrev.as_deref())? {
                Ok(hash) => {
                    if query.linkrev.is_none() && query.rev.is_none() {
                        st.record_mut(project, package)?.last_working = Some(hash.clone());
                    }
                    st.expanded_listing(&hash)
                }
                Err(reason) => Err(ApiError::Status {
                    status: 400,
                    body: reason,
                }),
            };
        }
        st.raw_listing(project, package, idx, &raw)
    }

    async fn fetch_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        revision: &str,
    ) -> Result<Vec<u8>, ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        st.take_fetch_budget()?;
        let tree = match st.trees.get(revision) {
            Some(tree) => tree.clone(),
            None => st.raw_revision(project, package, Some(revision))?.1.files,
        };
        let stored = tree
            .get(name)
            .ok_or_else(|| not_found(format!("{project}/{package}/{name}@{revision}")))?;
        st.blobs
            .get(&stored.md5)
            .cloned()
            .ok_or_else(|| not_found(format!("blob {}", stored.md5)))
    }

    async fn propose_commit(
        &self,
        project: &str,
        package: &str,
        manifest: &[ManifestEntry],
        _message: &str,
        flags: &CommitFlags,
    ) -> Result<CommitReply, ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        let rec = st.record(project, package)?;
        let link = rec.link.clone();

        let missing: Vec<String> = manifest
            .iter()
            .filter(|e| !st.blobs.contains_key(&e.md5))
            .map(|e| e.name.clone())
            .collect();
        if !missing.is_empty() {
            debug!(?missing, "commit needs uploads");
            return Ok(CommitReply::Missing(missing));
        }

        let mtime = st.tick();
        let tree: Tree = manifest
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    Stored {
                        md5: e.md5.clone(),
                        mtime,
                    },
                )
            })
            .collect();
        let (_, prev) = st.raw_revision(project, package, None)?;

        let revision = match link {
            Some(target) if flags.keeplink => {
                let linkrev = if flags.repairlink {
                    flags.linkrev.as_deref()
                } else {
                    None
                };
                let (target_hash, target_files) = st.target_tree(&target, linkrev)?;
                let mut files: Tree = tree
                    .iter()
                    .filter(|(name, s)| target_files.get(*name).map(|t| &t.md5) != Some(&s.md5))
                    .map(|(n, s)| (n.clone(), s.clone()))
                    .collect();
                if let Some(l) = prev.files.get(LINK_FILE) {
                    files.insert(LINK_FILE.to_string(), l.clone());
                }
                let removed = target_files
                    .keys()
                    .filter(|n| !tree.contains_key(*n))
                    .cloned()
                    .collect();
                if flags.repairlink {
                    st.record_mut(project, package)?.broken = None;
                }
                Revision {
                    files,
                    base: Some(target_hash),
                    removed,
                }
            }
            _ => Revision {
                files: tree,
                base: prev.base,
                removed: prev.removed,
            },
        };

        let rev = st.push_revision(project, package, revision.clone());
        st.commits += 1;
        let idx = rev.parse::<usize>().unwrap_or_default();
        let listing = st.raw_listing(project, package, idx, &revision)?;
        if let Some(hash) = listing
            .meta
            .linkinfo
            .as_ref()
            .and_then(|li| li.expanded_hash.clone())
        {
            st.record_mut(project, package)?.last_working = Some(hash);
        }
        debug!(project, package, rev = %rev, "committed");
        Ok(CommitReply::Committed(listing))
    }

    async fn upload_file(
        &self,
        _project: &str,
        _package: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        *st.uploads.entry(name.to_string()).or_default() += 1;
        let budgeted = match st.drop_budget.get_mut(name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        if !st.drop_uploads && !budgeted {
            st.store_blob(content);
        }
        Ok(())
    }

    async fn create_package(
        &self,
        project: &str,
        package: &str,
        _title: &str,
    ) -> Result<(), ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        if st.packages.contains_key(&key(project, package)) {
            return Err(ApiError::Status {
                status: 400,
                body: format!("package {project}/{package} already exists"),
            });
        }
        st.packages.insert(key(project, package), PackageRecord::default());
        Ok(())
    }

    async fn delete_package(&self, project: &str, package: &str) -> Result<(), ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        st.packages
            .remove(&key(project, package))
            .map(|_| ())
            .ok_or_else(|| not_found(format!("{project}/{package}")))
    }

    async fn resolve_link(
        &self,
        project: &str,
        package: &str,
        linkrev: Option<&str>,
    ) -> Result<LinkResolution, ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        let (_, raw) = st.raw_revision(project, package, None)?;
        Ok(match st.expand(project, package, &raw, linkrev)? {
            Ok(hash) => {
                if linkrev.is_none() {
                    st.record_mut(project, package)?.last_working = Some(hash.clone());
                }
                LinkResolution::Expanded(hash)
            }
            Err(reason) => LinkResolution::Broken(reason),
        })
    }

    async fn list_packages(&self, project: &str) -> Result<Vec<String>, ApiError> {
        let mut st = self.lock();
        st.requests += 1;
        Ok(st
            .packages
            .keys()
            .filter(|(p, _)| p == project)
            .map(|(_, name)| name.clone())
            .collect())
    }
}
