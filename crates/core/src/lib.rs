//! pkgsync core library.
//!
//! This crate provides the working-copy synchronization engine for a package
//! build service: per-file status tracking, the commit and update protocols,
//! three-way merging, source link handling, crash-safe local storage, and the
//! transport to the build service.

pub mod api;
pub mod config;
pub mod conflict;
pub mod context;
pub mod errors;
pub mod models;
pub mod package;
pub mod project;
pub mod status;
pub mod store;
pub mod transaction;

// Re-exports for convenience.
pub use api::{ApiClient, MemoryServer, Transport};
pub use config::AppConfig;
pub use context::{Context, WcOptions};
pub use errors::{CoreError, WcError};
pub use models::{FileStatus, PackageState};
pub use package::PackageWc;
pub use project::ProjectWc;
