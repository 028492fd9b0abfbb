//! On-disk state of a package working copy.
//!
//! Everything lives under `<package>/.pkgsync/`:
//!
//! ```text
//! _package        {"project", "package"}
//! _revision       RevisionMeta
//! _files          FileEntry table
//! _to_be_added    one name per line
//! _to_be_deleted  one name per line
//! _in_conflict    one name per line
//! _frozenlink     marker
//! _pulled         PullRecord
//! _linkrepair     marker
//! sources/        pristine copies
//! _in_commit/     commit staging
//! _in_update/     update journal
//! ```
//!
//! Every metadata write goes through a temp file and a rename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::WcError;
use crate::models::{FileEntry, RevisionMeta};

pub const STORE_DIR: &str = ".pkgsync";

const PACKAGE_FILE: &str = "_package";
const REVISION_FILE: &str = "_revision";
const FILES_FILE: &str = "_files";
const ADDED_FILE: &str = "_to_be_added";
const DELETED_FILE: &str = "_to_be_deleted";
const CONFLICT_FILE: &str = "_in_conflict";
const FROZEN_FILE: &str = "_frozenlink";
const PULLED_FILE: &str = "_pulled";
const LINKREPAIR_FILE: &str = "_linkrepair";
const SOURCES_DIR: &str = "sources";
const COMMIT_DIR: &str = "_in_commit";
const UPDATE_DIR: &str = "_in_update";

/// Which server package a working copy mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageIdent {
    pub project: String,
    pub package: String,
}

/// Link bases recorded by a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRecord {
    pub old_base: String,
    pub new_base: String,
}

/// Locally scheduled changes. The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pending {
    pub to_be_added: BTreeSet<String>,
    pub to_be_deleted: BTreeSet<String>,
    pub in_conflict: BTreeSet<String>,
}

impl Pending {
    /// Forget `name` in every set.
    pub fn forget(&mut self, name: &str) {
        self.to_be_added.remove(name);
        self.to_be_deleted.remove(name);
        self.in_conflict.remove(name);
    }
}

/// Everything loaded from a store.
#[derive(Debug, Clone)]
pub struct WcState {
    pub ident: PackageIdent,
    pub meta: RevisionMeta,
    pub files: BTreeMap<String, FileEntry>,
    pub pending: Pending,
    pub frozen: bool,
    pub pulled: Option<PullRecord>,
    pub link_repair: bool,
}

/// Handle on a package directory and its store.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    dir: PathBuf,
}

impl Store {
    /// Create an empty store (revision 0, no files) in `root`.
    pub fn init(root: &Path, ident: &PackageIdent) -> Result<Self, WcError> {
        let store = Self::at(root);
        fs::create_dir_all(store.dir.join(SOURCES_DIR))?;
        store.write_json(PACKAGE_FILE, ident)?;
        store.write_meta(&RevisionMeta::empty())?;
        store.write_files(&BTreeMap::new())?;
        debug!(root = %root.display(), "initialised store");
        Ok(store)
    }

    /// Find the store of an existing working copy.
    pub fn locate(root: &Path) -> Result<Self, WcError> {
        if !Self::is_working_copy(root) {
            return Err(WcError::NotAWorkingCopy(root.display().to_string()));
        }
        Ok(Self::at(root))
    }

    pub fn is_working_copy(root: &Path) -> bool {
        root.join(STORE_DIR).join(PACKAGE_FILE).is_file()
    }

    fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dir: root.join(STORE_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn commit_staging(&self) -> PathBuf {
        self.dir.join(COMMIT_DIR)
    }

    pub fn update_staging(&self) -> PathBuf {
        self.dir.join(UPDATE_DIR)
    }

    // -- metadata -----------------------------------------------------------

    pub fn load(&self) -> Result<WcState, WcError> {
        let ident: PackageIdent = self.read_json(PACKAGE_FILE)?;
        let meta: RevisionMeta = self.read_json(REVISION_FILE)?;
        let entries: Vec<FileEntry> = self.read_json(FILES_FILE)?;
        let pulled = if self.dir.join(PULLED_FILE).exists() {
            Some(self.read_json(PULLED_FILE)?)
        } else {
            None
        };
        Ok(WcState {
            ident,
            meta,
            files: entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
            pending: Pending {
                to_be_added: self.read_set(ADDED_FILE)?,
                to_be_deleted: self.read_set(DELETED_FILE)?,
                in_conflict: self.read_set(CONFLICT_FILE)?,
            },
            frozen: self.dir.join(FROZEN_FILE).exists(),
            pulled,
            link_repair: self.dir.join(LINKREPAIR_FILE).exists(),
        })
    }

    pub fn write_meta(&self, meta: &RevisionMeta) -> Result<(), WcError> {
        self.write_json(REVISION_FILE, meta)
    }

    pub fn write_files(&self, files: &BTreeMap<String, FileEntry>) -> Result<(), WcError> {
        let entries: Vec<&FileEntry> = files.values().collect();
        self.write_json(FILES_FILE, &entries)
    }

    pub fn write_pending(&self, pending: &Pending) -> Result<(), WcError> {
        self.write_set(ADDED_FILE, &pending.to_be_added)?;
        self.write_set(DELETED_FILE, &pending.to_be_deleted)?;
        self.write_set(CONFLICT_FILE, &pending.in_conflict)
    }

    pub fn set_frozen(&self, frozen: bool) -> Result<(), WcError> {
        self.set_marker(FROZEN_FILE, frozen)
    }

    pub fn set_link_repair(&self, on: bool) -> Result<(), WcError> {
        self.set_marker(LINKREPAIR_FILE, on)
    }

    pub fn write_pulled(&self, pulled: Option<&PullRecord>) -> Result<(), WcError> {
        match pulled {
            Some(record) => self.write_json(PULLED_FILE, record),
            None => remove_if_exists(&self.dir.join(PULLED_FILE)).map_err(Into::into),
        }
    }

    fn set_marker(&self, file: &str, on: bool) -> Result<(), WcError> {
        let path = self.dir.join(file);
        if on {
            write_atomic(&path, b"")?;
        } else {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    fn read_json<D: serde::de::DeserializeOwned>(&self, file: &str) -> Result<D, WcError> {
        let raw = fs::read(self.dir.join(file))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write_json<S: Serialize + ?Sized>(&self, file: &str, value: &S) -> Result<(), WcError> {
        let mut raw = serde_json::to_vec_pretty(value)?;
        raw.push(b'\n');
        write_atomic(&self.dir.join(file), &raw)?;
        Ok(())
    }

    fn read_set(&self, file: &str) -> Result<BTreeSet<String>, WcError> {
        match fs::read_to_string(self.dir.join(file)) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_set(&self, file: &str, names: &BTreeSet<String>) -> Result<(), WcError> {
        let path = self.dir.join(file);
        if names.is_empty() {
            remove_if_exists(&path)?;
            return Ok(());
        }
        let text: String = names.iter().map(|n| format!("{n}\n")).collect();
        write_atomic(&path, text.as_bytes())?;
        Ok(())
    }

    // -- pristine copies ----------------------------------------------------

    pub fn pristine_path(&self, name: &str) -> PathBuf {
        self.dir.join(SOURCES_DIR).join(name)
    }

    pub fn has_pristine(&self, name: &str) -> bool {
        self.pristine_path(name).is_file()
    }

    pub fn read_pristine(&self, name: &str) -> Result<Vec<u8>, WcError> {
        Ok(fs::read(self.pristine_path(name))?)
    }

    pub fn write_pristine(&self, name: &str, content: &[u8]) -> Result<(), WcError> {
        write_atomic(&self.pristine_path(name), content)?;
        Ok(())
    }

    pub fn remove_pristine(&self, name: &str) -> Result<(), WcError> {
        remove_if_exists(&self.pristine_path(name))?;
        Ok(())
    }

    pub fn pristine_names(&self) -> Result<BTreeSet<String>, WcError> {
        list_files(&self.dir.join(SOURCES_DIR))
    }

    // -- working files ------------------------------------------------------

    pub fn work_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn has_work(&self, name: &str) -> bool {
        self.work_path(name).is_file()
    }

    pub fn read_work(&self, name: &str) -> Result<Vec<u8>, WcError> {
        Ok(fs::read(self.work_path(name))?)
    }

    pub fn write_work(&self, name: &str, content: &[u8]) -> Result<(), WcError> {
        write_atomic(&self.work_path(name), content)?;
        Ok(())
    }

    pub fn remove_work(&self, name: &str) -> Result<(), WcError> {
        remove_if_exists(&self.work_path(name))?;
        Ok(())
    }

    /// Regular files in the package directory.
    pub fn work_names(&self) -> Result<BTreeSet<String>, WcError> {
        list_files(&self.root)
    }

    // -- consistency --------------------------------------------------------

    /// Violations of the store invariants; empty means consistent.
    pub fn check(&self, state: &WcState) -> Result<Vec<String>, WcError> {
        let pristine = self.pristine_names()?;
        let mut violations = Vec::new();
        for entry in state.files.values() {
            if !entry.skipped && !pristine.contains(&entry.name) {
                violations.push(format!("'{}' has no pristine copy", entry.name));
            }
        }
        for name in &pristine {
            if !state.files.contains_key(name) {
                violations.push(format!("pristine copy '{name}' is not in the file list"));
            }
        }
        for name in &state.pending.to_be_deleted {
            if !state.files.contains_key(name) {
                violations.push(format!("'{name}' is scheduled for deletion but not tracked"));
            }
        }
        for name in &state.pending.in_conflict {
            if !state.files.contains_key(name) {
                violations.push(format!("'{name}' is in conflict but not tracked"));
            }
        }
        if !state.meta.is_link() && (state.frozen || state.pulled.is_some()) {
            violations.push("link flags set on a package that is not a link".to_string());
        }
        Ok(violations)
    }
}

/// Whether `name` may be used as a file name inside a package.
pub fn is_valid_file_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[^/\\\x00]+$").ok());
    re.as_ref().is_some_and(|re| re.is_match(name))
        && name != "."
        && name != ".."
        && name != STORE_DIR
}

/// Write `content` to `path` via a temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn list_files(dir: &Path) -> Result<BTreeSet<String>, WcError> {
    let mut names = BTreeSet::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Linkinfo;
    use chrono::Utc;

    fn ident() -> PackageIdent {
        PackageIdent {
            project: "home:alice".into(),
            package: "foo".into(),
        }
    }

    #[test]
    fn test_init_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path(), &ident()).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.ident, ident());
        assert_eq!(state.meta.revision, "0");
        assert!(state.files.is_empty());
        assert!(!state.frozen);
        assert!(store.check(&state).unwrap().is_empty());
        assert!(Store::is_working_copy(dir.path()));
    }

    #[test]
    fn test_locate_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Store::locate(dir.path()),
            Err(WcError::NotAWorkingCopy(_))
        ));
    }

    #[test]
    fn test_pending_sets_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path(), &ident()).unwrap();
        let mut pending = Pending::default();
        pending.to_be_added.insert("new.patch".into());
        pending.to_be_added.insert("a b.txt".into());
        store.write_pending(&pending).unwrap();
        assert_eq!(store.load().unwrap().pending, pending);

        store.write_pending(&Pending::default()).unwrap();
        assert!(!dir.path().join(STORE_DIR).join(ADDED_FILE).exists());
    }

    #[test]
    fn test_check_reports_violations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path(), &ident()).unwrap();
        let mut files = BTreeMap::new();
        files.insert(
            "foo.spec".to_string(),
            FileEntry::for_content("foo.spec", b"x", Utc::now()),
        );
        store.write_files(&files).unwrap();
        store.write_pristine("orphan", b"y").unwrap();
        let mut pending = Pending::default();
        pending.in_conflict.insert("ghost".into());
        store.write_pending(&pending).unwrap();

        let violations = store.check(&store.load().unwrap()).unwrap();
        assert_eq!(violations.len(), 3, "{violations:?}");
    }

    #[test]
    fn test_link_flags() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path(), &ident()).unwrap();
        let mut meta = RevisionMeta::empty();
        meta.linkinfo = Some(Linkinfo::default());
        store.write_meta(&meta).unwrap();
        store.set_frozen(true).unwrap();
        let record = PullRecord {
            old_base: "a".into(),
            new_base: "b".into(),
        };
        store.write_pulled(Some(&record)).unwrap();
        let state = store.load().unwrap();
        assert!(state.frozen);
        assert_eq!(state.pulled, Some(record));
        assert!(store.check(&state).unwrap().is_empty());

        store.set_frozen(false).unwrap();
        store.write_pulled(None).unwrap();
        let state = store.load().unwrap();
        assert!(!state.frozen && state.pulled.is_none());
    }

    #[test]
    fn test_work_names_skip_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::init(dir.path(), &ident()).unwrap();
        store.write_work("foo.spec", b"x").unwrap();
        assert_eq!(
            store.work_names().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["foo.spec"]
        );
    }

    #[test]
    fn test_file_name_validation() {
        assert!(is_valid_file_name("foo.spec"));
        assert!(is_valid_file_name("_service"));
        assert!(!is_valid_file_name("a/b"));
        assert!(!is_valid_file_name(".."));
        assert!(!is_valid_file_name(STORE_DIR));
        assert!(!is_valid_file_name(""));
    }
}
