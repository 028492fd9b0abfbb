//! Operation context passed explicitly to every engine call.

use crate::config::{AppConfig, WorkingCopyConfig};
use crate::conflict::MergeTool;

/// Working copy behaviour knobs.
#[derive(Debug, Clone)]
pub struct WcOptions {
    pub exclude_glob: Vec<String>,
    /// Files above this many bytes are registered as skipped, not fetched.
    pub size_limit: Option<u64>,
    pub merge_tool: MergeTool,
}

impl Default for WcOptions {
    fn default() -> Self {
        Self::from_config(&WorkingCopyConfig::default())
    }
}

impl WcOptions {
    pub fn from_config(cfg: &WorkingCopyConfig) -> Self {
        Self {
            exclude_glob: cfg.exclude_glob.clone(),
            size_limit: (cfg.size_limit > 0).then_some(cfg.size_limit),
            merge_tool: cfg.merge_tool,
        }
    }

    /// Whether an unversioned `name` should be hidden from listings.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude_glob
            .iter()
            .any(|pattern| glob_match::glob_match(pattern, name))
    }

    pub fn exceeds_size_limit(&self, size: u64) -> bool {
        self.size_limit.is_some_and(|limit| size > limit)
    }
}

/// Transport, identity and options for one run.
#[derive(Debug)]
pub struct Context<T> {
    pub transport: T,
    pub user: String,
    pub options: WcOptions,
}

impl<T> Context<T> {
    pub fn new(transport: T, user: impl Into<String>) -> Self {
        Self {
            transport,
            user: user.into(),
            options: WcOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WcOptions) -> Self {
        self.options = options;
        self
    }

    /// Build a context from a loaded configuration.
    pub fn from_config(transport: T, config: &AppConfig) -> Self {
        Self {
            transport,
            user: config.api.username.clone(),
            options: WcOptions::from_config(&config.workingcopy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_excludes() {
        let opts = WcOptions::default();
        assert!(opts.is_excluded("foo.spec.orig"));
        assert!(opts.is_excluded(".foo.spec.swp"));
        assert!(opts.is_excluded("notes~"));
        assert!(!opts.is_excluded("foo.spec"));
    }

    #[test]
    fn test_size_limit() {
        let opts = WcOptions {
            size_limit: Some(10),
            ..WcOptions::default()
        };
        assert!(opts.exceeds_size_limit(11));
        assert!(!opts.exceeds_size_limit(10));
        assert!(!WcOptions::default().exceeds_size_limit(u64::MAX));
    }

    #[test]
    fn test_zero_size_limit_means_unlimited() {
        let mut cfg = WorkingCopyConfig::default();
        assert_eq!(WcOptions::from_config(&cfg).size_limit, None);
        cfg.size_limit = 4096;
        assert_eq!(WcOptions::from_config(&cfg).size_limit, Some(4096));
    }
}
