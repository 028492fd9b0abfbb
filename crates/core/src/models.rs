//! Domain model types used throughout pkgsync.
//!
//! These types are the decoded shapes of server listings; the transport
//! produces them once and the engine never looks at wire data.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

// ---------------------------------------------------------------------------
// Revision listings
// ---------------------------------------------------------------------------

/// One file as listed by a specific revision of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub md5: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Set locally when the file exceeded the size limit and was not fetched.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl FileEntry {
    /// Build an entry describing `content`.
    pub fn for_content(name: impl Into<String>, content: &[u8], mtime: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            md5: md5_hex(content),
            size: content.len() as u64,
            mtime,
            skipped: false,
        }
    }
}

/// Describes a package whose sources are derived from another package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Linkinfo {
    /// Link target project.
    pub project: String,
    /// Link target package.
    pub package: String,
    /// Tree hash of the target revision the link was resolved against.
    pub tree_hash: String,
    /// Tree hash of the expanded (target + local changes) file set.
    #[serde(default)]
    pub expanded_hash: Option<String>,
    /// Tree hash of the raw link package; only present on expanded listings.
    #[serde(default)]
    pub unexpanded_hash: Option<String>,
    /// Expansion error reported by the server.
    #[serde(default)]
    pub error: Option<String>,
    /// Target revision pinned by the link, if any.
    #[serde(default)]
    pub revision: Option<String>,
    /// Target revision the link's local changes were last based on.
    #[serde(default)]
    pub base_revision: Option<String>,
    /// Last expanded tree hash that resolved without errors.
    #[serde(default)]
    pub last_working: Option<String>,
}

impl Linkinfo {
    /// A listing is expanded when it carries the unexpanded hash and the
    /// expansion succeeded.
    pub fn is_expanded(&self) -> bool {
        self.unexpanded_hash.is_some() && self.error.is_none()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Target revisions to try, in order, when the link cannot be expanded
    /// against the target's latest revision.
    pub fn known_good_targets(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.tree_hash.is_empty() {
            out.push(self.tree_hash.clone());
        }
        if let Some(base) = &self.base_revision {
            if !out.contains(base) {
                out.push(base.clone());
            }
        }
        out
    }
}

/// Server-side identity of one revision of a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMeta {
    /// Server ordinal, or the expanded tree hash for expanded link listings.
    pub revision: String,
    /// md5 over the sorted file list.
    pub tree_hash: String,
    #[serde(default)]
    pub linkinfo: Option<Linkinfo>,
}

impl RevisionMeta {
    /// Revision of a package that has never been committed.
    pub fn empty() -> Self {
        Self {
            revision: "0".into(),
            tree_hash: tree_hash(&[]),
            linkinfo: None,
        }
    }

    pub fn is_link(&self) -> bool {
        self.linkinfo.is_some()
    }

    pub fn is_expanded_link(&self) -> bool {
        self.linkinfo.as_ref().is_some_and(Linkinfo::is_expanded)
    }
}

/// One decoded revision listing: identity plus its file set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTree {
    pub meta: RevisionMeta,
    pub files: Vec<FileEntry>,
}

impl SourceTree {
    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }

    /// Whether `other` lists the same revision with the same file hashes.
    pub fn same_snapshot(&self, other: &SourceTree) -> bool {
        if self.meta.revision != other.meta.revision || self.meta.tree_hash != other.meta.tree_hash
        {
            return false;
        }
        self.files.len() == other.files.len()
            && self.files.iter().all(|f| {
                other
                    .file(&f.name)
                    .is_some_and(|o| o.md5 == f.md5 && o.size == f.size)
            })
    }
}

// ---------------------------------------------------------------------------
// File status
// ---------------------------------------------------------------------------

/// State of a single file in a package working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Deleted,
    Conflicted,
    Skipped,
    /// Scheduled for addition while a pristine copy already exists.
    ReAdded,
    Added,
    Modified,
    Unmodified,
    /// Scheduled for addition but gone from the working directory.
    MissingAdded,
    Missing,
    Unversioned,
}

impl FileStatus {
    /// Single-character status code used in listings.
    pub fn code(self) -> char {
        match self {
            Self::Deleted => 'D',
            Self::Conflicted => 'C',
            Self::Skipped => 'S',
            Self::ReAdded => 'R',
            Self::Added => 'A',
            Self::Modified => 'M',
            Self::Unmodified => ' ',
            Self::MissingAdded | Self::Missing => '!',
            Self::Unversioned => '?',
        }
    }

    /// Whether the file carries a local change a commit would transmit.
    pub fn is_local_change(self) -> bool {
        matches!(
            self,
            Self::Deleted | Self::ReAdded | Self::Added | Self::Modified
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deleted => write!(f, "deleted"),
            Self::Conflicted => write!(f, "conflicted"),
            Self::Skipped => write!(f, "skipped"),
            Self::ReAdded => write!(f, "re_added"),
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Unmodified => write!(f, "unmodified"),
            Self::MissingAdded => write!(f, "missing_added"),
            Self::Missing => write!(f, "missing"),
            Self::Unversioned => write!(f, "unversioned"),
        }
    }
}

// ---------------------------------------------------------------------------
// Project-level state
// ---------------------------------------------------------------------------

/// State of a package inside a project working copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Normal,
    Added,
    Deleted,
}

impl PackageState {
    pub fn code(self) -> char {
        match self {
            Self::Normal => ' ',
            Self::Added => 'A',
            Self::Deleted => 'D',
        }
    }
}

impl std::fmt::Display for PackageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Added => write!(f, "added"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Hex md5 of `content`.
pub fn md5_hex(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hex sha256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Tree hash of a file set: md5 over `"<md5>  <name>\n"` lines sorted by name.
pub fn tree_hash(files: &[FileEntry]) -> String {
    let mut sorted: Vec<&FileEntry> = files.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let listing: String = sorted
        .iter()
        .map(|f| format!("{}  {}\n", f.md5, f.name))
        .collect();
    md5_hex(listing.as_bytes())
}
