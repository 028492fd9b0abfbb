//! Three-way merging of file contents.
//!
//! The update engine and link pulls only see the [`ThreeWayMerge`]
//! capability; which backend runs is a configuration choice
//! ([`MergeTool`]).

pub mod merger;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::MergeError;

pub use merger::{Diff3Merger, NativeMerger};

/// How many leading bytes are scanned for a NUL when detecting binaries.
const BINARY_SNIFF_LEN: usize = 8000;

/// Outcome of merging `mine` and `yours` against their common ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Merged without overlapping edits.
    Clean(Vec<u8>),
    /// Merged text containing conflict markers.
    Conflict(Vec<u8>),
    /// At least one input is binary; no textual merge was attempted.
    Binary,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean(_))
    }
}

/// A three-way merge backend.
pub trait ThreeWayMerge {
    /// Merge text inputs. Called only after the trivial cases are ruled out.
    fn merge_text(&self, mine: &[u8], older: &[u8], yours: &[u8])
        -> Result<MergeResult, MergeError>;

    /// Merge `mine` and `yours`, both derived from `older`.
    fn merge(&self, mine: &[u8], older: &[u8], yours: &[u8]) -> Result<MergeResult, MergeError> {
        if mine == older {
            debug!("mine == older, taking yours");
            return Ok(MergeResult::Clean(yours.to_vec()));
        }
        if yours == older || mine == yours {
            debug!("no upstream change to apply, keeping mine");
            return Ok(MergeResult::Clean(mine.to_vec()));
        }
        if is_binary(mine) || is_binary(older) || is_binary(yours) {
            debug!("binary input, skipping textual merge");
            return Ok(MergeResult::Binary);
        }
        self.merge_text(mine, older, yours)
    }
}

/// Selects a [`ThreeWayMerge`] backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeTool {
    /// In-process line merge.
    #[default]
    Native,
    /// External `diff3 -m -E`.
    Diff3,
}

impl MergeTool {
    pub fn merger(self) -> Box<dyn ThreeWayMerge> {
        match self {
            Self::Native => Box::new(NativeMerger),
            Self::Diff3 => Box::new(Diff3Merger::default()),
        }
    }
}

/// A file is binary when a NUL byte appears in its first 8000 bytes.
pub fn is_binary(content: &[u8]) -> bool {
    content.iter().take(BINARY_SNIFF_LEN).any(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_detection_window() {
        assert!(!is_binary(b"plain text\n"));
        assert!(is_binary(b"\x7fELF\x00\x01"));

        let mut late_nul = vec![b'a'; BINARY_SNIFF_LEN];
        late_nul.push(0);
        assert!(!is_binary(&late_nul));
    }

    #[test]
    fn test_fast_paths_skip_backend() {
        struct Unreachable;
        impl ThreeWayMerge for Unreachable {
            fn merge_text(&self, _: &[u8], _: &[u8], _: &[u8]) -> Result<MergeResult, MergeError> {
                panic!("backend must not run for trivial merges");
            }
        }

        let m = Unreachable;
        assert_eq!(
            m.merge(b"a\n", b"a\n", b"b\n").unwrap(),
            MergeResult::Clean(b"b\n".to_vec())
        );
        assert_eq!(
            m.merge(b"x\n", b"a\n", b"a\n").unwrap(),
            MergeResult::Clean(b"x\n".to_vec())
        );
        assert_eq!(
            m.merge(b"x\n", b"a\n", b"x\n").unwrap(),
            MergeResult::Clean(b"x\n".to_vec())
        );
    }

    #[test]
    fn test_binary_inputs_are_not_merged() {
        let m = NativeMerger;
        let result = m.merge(b"mine\x00", b"old\x00", b"new\x00").unwrap();
        assert_eq!(result, MergeResult::Binary);
    }

    #[test]
    fn test_merge_tool_from_config_string() {
        #[derive(Deserialize)]
        struct W {
            tool: MergeTool,
        }
        let w: W = toml::from_str("tool = \"diff3\"").unwrap();
        assert_eq!(w.tool, MergeTool::Diff3);
    }
}
