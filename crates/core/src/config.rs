//! TOML-based configuration for pkgsync.
//!
//! The API password is never stored in the file; `password_env` names an
//! environment variable that is resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::MergeTool;
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Build service API settings.
    pub api: ApiConfig,

    /// Working copy behaviour.
    #[serde(default)]
    pub workingcopy: WorkingCopyConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Build service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API base URL (e.g. `https://api.example.org`).
    pub url: String,

    /// Account name used for HTTP basic authentication and commit records.
    pub username: String,

    /// Environment variable holding the account password.
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_password_env() -> String {
    "PKGSYNC_PASSWORD".into()
}
fn default_timeout() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Working copy
// ---------------------------------------------------------------------------

/// Working copy behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingCopyConfig {
    /// Glob patterns never reported as unversioned.
    #[serde(default = "default_exclude_glob")]
    pub exclude_glob: Vec<String>,

    /// Files larger than this many bytes are not downloaded (0 = no limit).
    #[serde(default)]
    pub size_limit: u64,

    /// Three-way merge backend.
    #[serde(default)]
    pub merge_tool: MergeTool,
}

fn default_exclude_glob() -> Vec<String> {
    [".pkgsync", "*.orig", "*.rej", ".*.swp", ".git", ".svn", "*~"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for WorkingCopyConfig {
    fn default() -> Self {
        Self {
            exclude_glob: default_exclude_glob(),
            size_limit: 0,
            merge_tool: MergeTool::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Default config location: `<config dir>/pkgsync/config.toml`.
    pub fn default_path(config_dir: &Path) -> PathBuf {
        config_dir.join("pkgsync").join("config.toml")
    }

    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `api.password_env`. A missing variable only logs a warning;
    /// anonymous access is valid for read-only operations.
    pub fn resolve_env_vars(&mut self) {
        self.api.password = match std::env::var(&self.api.password_env) {
            Ok(val) if !val.is_empty() => {
                debug!(env_name = %self.api.password_env, "resolved api password");
                Some(val)
            }
            Ok(_) => {
                warn!(env_name = %self.api.password_env, "password env var is set but empty");
                None
            }
            Err(_) => {
                warn!(env_name = %self.api.password_env, "password env var not set");
                None
            }
        };
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.url".into(),
                detail: "API URL must not be empty".into(),
            });
        }
        if !self.api.url.starts_with("http://") && !self.api.url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "api.url".into(),
                detail: "API URL must start with http:// or https://".into(),
            });
        }
        if self.api.username.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.username".into(),
                detail: "username must not be empty".into(),
            });
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars();
        config.validate()?;
        Ok(config)
    }
}
