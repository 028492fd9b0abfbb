//! Error types for the pkgsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    WorkingCopy(#[from] WcError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Working copy errors
// ---------------------------------------------------------------------------

/// Errors raised by working-copy operations (status, commit, update, links).
#[derive(Debug, Error)]
pub enum WcError {
    /// The store and the file list disagree; `check()` found violations or
    /// an interrupted update has not been resumed yet.
    #[error("working copy '{path}' is inconsistent: {}", .violations.join("; "))]
    Inconsistent {
        path: String,
        violations: Vec<String>,
    },

    /// The local revision is behind the server; update first.
    #[error("working copy '{path}' is out of date (local revision {local}, upstream {upstream}); run update first")]
    Outdated {
        path: String,
        local: String,
        upstream: String,
    },

    /// A file operation collides with a pending local state.
    #[error("file conflict on '{name}': {detail}")]
    FileConflict {
        name: String,
        detail: String,
    },

    /// The server cannot expand a source link, or the link is frozen.
    #[error("link expansion failed for '{package}': {detail}")]
    LinkExpand {
        package: String,
        detail: String,
    },

    /// The three-way merge tool reported an unexpected outcome.
    #[error("merge of '{name}' failed: {source}")]
    MergeTool {
        name: String,
        #[source]
        source: MergeError,
    },

    /// The server kept reporting missing content after the retry budget.
    #[error("server still reports missing files after {rounds} upload rounds: {}", .missing.join(", "))]
    Protocol {
        rounds: usize,
        missing: Vec<String>,
    },

    /// A named file is neither tracked, pending, nor present on disk.
    #[error("'{0}' is not under version control")]
    NotFound(String),

    /// The directory has no store.
    #[error("'{0}' is not a working copy")]
    NotAWorkingCopy(String),

    /// The operation does not apply to this working copy in its current state.
    #[error("{0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("working copy I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WcError {
    /// Build a `FileConflict` for `name`.
    pub fn conflict(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::FileConflict {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// `true` for errors the user recovers from by updating or resolving.
    pub fn is_user_recoverable(&self) -> bool {
        matches!(self, Self::Outdated { .. } | Self::FileConflict { .. })
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from the build-service transport.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("API error (HTTP {status}): {body}")]
    Status {
        status: u16,
        body: String,
    },

    /// The requested project, package, file, or revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A listing could not be decoded.
    #[error("failed to parse server response: {0}")]
    Parse(String),

    /// The transport is unreachable (used by the in-memory server to inject
    /// failures).
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from a [`ThreeWayMerge`](crate::conflict::ThreeWayMerge) backend.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The external merge tool exited with a status that is neither "clean"
    /// nor "conflicts".
    #[error("merge tool failed (exit {exit_code}): {stderr}")]
    ToolFailed {
        exit_code: i32,
        stderr: String,
    },

    #[error("merge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
