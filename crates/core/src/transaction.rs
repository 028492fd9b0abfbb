//! Crash-safe staging for commits and updates.
//!
//! A commit stages pristine copies under `_in_commit/files/` and promotes
//! them in one step: the promotion plan is written first as a marker, so an
//! interrupted promotion is rolled forward on the next open, and a staging
//! area without a marker is simply discarded.
//!
//! An update writes its target listing to `_in_update/_target` before
//! touching any working file and keeps a backup of every working file it is
//! about to replace, along with the md5 of the replacement. [`UpdateJournal::recover`]
//! turns a leftover journal back into a state the update can be re-applied to.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::WcError;
use crate::models::{md5_hex, FileEntry, RevisionMeta, SourceTree};
use crate::store::{remove_if_exists, write_atomic, Store};

const PROMOTE_MARKER: &str = "_promote";
const STAGED_DIR: &str = "files";
const TARGET_FILE: &str = "_target";
const BACKUP_DIR: &str = "backup";
const WANT_DIR: &str = "want";
const COPY_SUFFIX: &str = ".copy";

/// Everything a promotion changes in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPlan {
    pub meta: RevisionMeta,
    pub files: Vec<FileEntry>,
    /// Pristine copies to delete.
    pub remove: Vec<String>,
    pub clear_added: Vec<String>,
    pub clear_deleted: Vec<String>,
}

/// Staging area of one commit.
#[derive(Debug)]
pub struct Transaction<'a> {
    store: &'a Store,
    dir: PathBuf,
    staged: BTreeSet<String>,
}

impl<'a> Transaction<'a> {
    pub fn begin(store: &'a Store) -> Result<Self, WcError> {
        let dir = store.commit_staging();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(dir.join(STAGED_DIR))?;
        Ok(Self {
            store,
            dir,
            staged: BTreeSet::new(),
        })
    }

    /// Stage the new pristine content of `name`.
    pub fn stage(&mut self, name: &str, content: &[u8]) -> Result<(), WcError> {
        write_atomic(&self.dir.join(STAGED_DIR).join(name), content)?;
        self.staged.insert(name.to_string());
        Ok(())
    }

    pub fn is_staged(&self, name: &str) -> bool {
        self.staged.contains(name)
    }

    /// Record the plan, then move staged files into place.
    pub fn promote(self, plan: &PromotionPlan) -> Result<(), WcError> {
        let raw = serde_json::to_vec_pretty(plan)?;
        write_atomic(&self.dir.join(PROMOTE_MARKER), &raw)?;
        debug!(staged = self.staged.len(), "promotion marker written");
        apply_promotion(self.store, &self.dir, plan)
    }

    /// Throw the staged files away.
    pub fn rollback(self) -> Result<(), WcError> {
        debug!(staged = self.staged.len(), "rolling back commit staging");
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

/// Reconcile a staging area left by an interrupted commit. Returns `true`
/// when a promotion was rolled forward.
pub fn recover_commit(store: &Store) -> Result<bool, WcError> {
    let dir = store.commit_staging();
    if !dir.exists() {
        return Ok(false);
    }
    let marker = dir.join(PROMOTE_MARKER);
    if !marker.exists() {
        warn!(path = %dir.display(), "discarding unfinished commit staging");
        fs::remove_dir_all(&dir)?;
        return Ok(false);
    }
    let plan: PromotionPlan = serde_json::from_slice(&fs::read(&marker)?)?;
    info!(revision = %plan.meta.revision, "rolling forward interrupted commit");
    apply_promotion(store, &dir, &plan)?;
    Ok(true)
}

/// Idempotent: every step can be repeated after a crash.
fn apply_promotion(store: &Store, dir: &Path, plan: &PromotionPlan) -> Result<(), WcError> {
    let staged = dir.join(STAGED_DIR);
    if staged.exists() {
        for entry in fs::read_dir(&staged)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                fs::rename(entry.path(), store.pristine_path(name))?;
            }
        }
    }

    let files: BTreeMap<String, FileEntry> = plan
        .files
        .iter()
        .map(|e| (e.name.clone(), e.clone()))
        .collect();
    store.write_files(&files)?;
    store.write_meta(&plan.meta)?;

    let mut state = store.load()?;
    for name in &plan.clear_added {
        state.pending.to_be_added.remove(name);
    }
    for name in &plan.clear_deleted {
        state.pending.to_be_deleted.remove(name);
    }
    store.write_pending(&state.pending)?;
    store.write_pulled(None)?;
    store.set_link_repair(false)?;

    for name in &plan.remove {
        store.remove_pristine(name)?;
    }
    fs::remove_dir_all(dir)?;
    Ok(())
}

/// Journal of one in-flight update.
#[derive(Debug)]
pub struct UpdateJournal {
    dir: PathBuf,
    root: PathBuf,
}

impl UpdateJournal {
    /// Record `target` before anything in the working copy changes.
    pub fn begin(store: &Store, target: &SourceTree) -> Result<Self, WcError> {
        let dir = store.update_staging();
        fs::create_dir_all(dir.join(BACKUP_DIR))?;
        fs::create_dir_all(dir.join(WANT_DIR))?;
        write_atomic(&dir.join(TARGET_FILE), &serde_json::to_vec_pretty(target)?)?;
        debug!(revision = %target.meta.revision, "update journal opened");
        Ok(Self {
            dir,
            root: store.root().to_path_buf(),
        })
    }

    /// The journal an interrupted update left behind, if any.
    pub fn find(store: &Store) -> Option<Self> {
        let dir = store.update_staging();
        dir.join(TARGET_FILE).is_file().then(|| Self {
            dir,
            root: store.root().to_path_buf(),
        })
    }

    pub fn target(&self) -> Result<SourceTree, WcError> {
        Ok(serde_json::from_slice(&fs::read(
            self.dir.join(TARGET_FILE),
        )?)?)
    }

    /// Save the current working file `name` before it is replaced by
    /// `replacement`.
    pub fn backup(&self, name: &str, replacement: &[u8]) -> Result<(), WcError> {
        let live = self.root.join(name);
        if !live.is_file() {
            return Ok(());
        }
        write_atomic(
            &self.dir.join(WANT_DIR).join(name),
            md5_hex(replacement).as_bytes(),
        )?;
        let copy = self.dir.join(format!("{name}{COPY_SUFFIX}"));
        fs::copy(&live, &copy)?;
        fs::rename(&copy, self.dir.join(BACKUP_DIR).join(name))?;
        Ok(())
    }

    /// Drop the backup of `name` once its replacement is in place.
    pub fn release(&self, name: &str) -> Result<(), WcError> {
        remove_if_exists(&self.dir.join(BACKUP_DIR).join(name))?;
        remove_if_exists(&self.dir.join(WANT_DIR).join(name))?;
        Ok(())
    }

    fn wanted_md5(&self, name: &str) -> Result<Option<String>, WcError> {
        match fs::read_to_string(self.dir.join(WANT_DIR).join(name)) {
            Ok(md5) => Ok(Some(md5.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Undo half-finished file replacements. Returns the names working
    /// files were moved aside to.
    ///
    /// A live file that still matches its backup, or that holds exactly the
    /// replacement this journal was writing, goes back to the backup
    /// silently: the update re-applies it. Anything else was edited while
    /// the update was interrupted and is moved aside.
    pub fn recover(&self) -> Result<Vec<String>, WcError> {
        let mut asides = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_file() && name.ends_with(COPY_SUFFIX) {
                debug!(file = %name, "discarding unfinished backup copy");
                fs::remove_file(entry.path())?;
            }
        }

        let backups = self.dir.join(BACKUP_DIR);
        if !backups.exists() {
            return Ok(asides);
        }
        for entry in fs::read_dir(&backups)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let backup = entry.path();
            let live = self.root.join(&name);
            let wanted = self.wanted_md5(&name)?;
            remove_if_exists(&self.dir.join(WANT_DIR).join(&name))?;
            if !live.is_file() {
                debug!(file = %name, "restoring backup of missing file");
                fs::rename(&backup, &live)?;
                continue;
            }
            let live_md5 = md5_hex(&fs::read(&live)?);
            if live_md5 == md5_hex(&fs::read(&backup)?) {
                fs::remove_file(&backup)?;
            } else if wanted.as_deref() == Some(live_md5.as_str()) {
                debug!(file = %name, "rolling back unreleased replacement");
                fs::rename(&backup, &live)?;
            } else {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                let aside = format!("{name}.{}", &suffix[..8]);
                fs::rename(&live, self.root.join(&aside))?;
                fs::rename(&backup, &live)?;
                warn!(file = %name, moved_to = %aside, "interrupted update left a changed file; moved it aside");
                asides.push(aside);
            }
        }
        Ok(asides)
    }

    pub fn close(self) -> Result<(), WcError> {
        fs::remove_dir_all(&self.dir)?;
        debug!("update journal closed");
        Ok(())
    }
}
