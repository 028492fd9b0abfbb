//! Build service transport.
//!
//! The engine talks to the server only through [`Transport`], whose methods
//! take and return decoded model types. [`ApiClient`] speaks HTTP;
//! [`MemoryServer`] keeps everything in process for tests.

pub mod client;
pub mod memory;
pub mod parser;

use crate::errors::ApiError;
use crate::models::SourceTree;

pub use client::ApiClient;
pub use memory::MemoryServer;

/// Which listing of a package to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionQuery {
    /// Revision ordinal or tree hash; `None` means latest.
    pub rev: Option<String>,
    /// Expand a source link into target + local changes.
    pub expand: bool,
    /// Target revision to expand the link against.
    pub linkrev: Option<String>,
    /// Expand against the last target revision that worked.
    pub last_working: bool,
}

impl RevisionQuery {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn at(rev: impl Into<String>) -> Self {
        Self {
            rev: Some(rev.into()),
            ..Self::default()
        }
    }

    pub fn expanded(mut self) -> Self {
        self.expand = true;
        self
    }

    pub fn with_linkrev(mut self, linkrev: Option<String>) -> Self {
        self.linkrev = linkrev;
        self
    }
}

/// One line of a commit proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub md5: String,
    /// Sent for files whose content changed locally.
    pub sha256: Option<String>,
}

/// Link handling requested with a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitFlags {
    /// Keep the link: the manifest describes the expanded file set.
    pub keeplink: bool,
    /// Rebase the link's local changes onto `linkrev`.
    pub repairlink: bool,
    pub linkrev: Option<String>,
}

/// Server answer to a commit proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitReply {
    /// The new revision was recorded.
    Committed(SourceTree),
    /// Content for these names must be uploaded first.
    Missing(Vec<String>),
}

/// Result of asking the server to expand a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResolution {
    /// Tree hash of the expanded file set.
    Expanded(String),
    /// Expansion failed with this reason.
    Broken(String),
}

/// Everything the engine needs from the build service.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn fetch_tree(
        &self,
        project: &str,
        package: &str,
        query: &RevisionQuery,
    ) -> Result<SourceTree, ApiError>;

    async fn fetch_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        revision: &str,
    ) -> Result<Vec<u8>, ApiError>;

    async fn propose_commit(
        &self,
        project: &str,
        package: &str,
        manifest: &[ManifestEntry],
        message: &str,
        flags: &CommitFlags,
    ) -> Result<CommitReply, ApiError>;

    async fn upload_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), ApiError>;

    async fn create_package(&self, project: &str, package: &str, title: &str)
        -> Result<(), ApiError>;

    async fn delete_package(&self, project: &str, package: &str) -> Result<(), ApiError>;

    async fn resolve_link(
        &self,
        project: &str,
        package: &str,
        linkrev: Option<&str>,
    ) -> Result<LinkResolution, ApiError>;

    async fn list_packages(&self, project: &str) -> Result<Vec<String>, ApiError>;
}
