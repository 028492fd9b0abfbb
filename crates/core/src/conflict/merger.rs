//! Three-way merge backends.
//!
//! [`NativeMerger`] runs the line merge in-process with `diffy`;
//! [`Diff3Merger`] shells out to `diff3 -m -E`. Both emit
//! `<<<<<<<` / `=======` / `>>>>>>>` markers on conflict.

use std::io::Write;
use std::process::Command;

use tracing::{debug, info};

use super::{MergeResult, ThreeWayMerge};
use crate::errors::MergeError;

/// In-process line-based merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMerger;

impl ThreeWayMerge for NativeMerger {
    fn merge_text(
        &self,
        mine: &[u8],
        older: &[u8],
        yours: &[u8],
    ) -> Result<MergeResult, MergeError> {
        info!("performing three-way merge");
        match diffy::merge_bytes(older, mine, yours) {
            Ok(merged) => {
                debug!("clean merge");
                Ok(MergeResult::Clean(merged))
            }
            Err(conflicted) => {
                debug!("overlapping edits, conflict markers inserted");
                Ok(MergeResult::Conflict(conflicted))
            }
        }
    }
}

/// External `diff3` merge.
#[derive(Debug, Clone)]
pub struct Diff3Merger {
    program: String,
}

impl Default for Diff3Merger {
    fn default() -> Self {
        Self {
            program: "diff3".into(),
        }
    }
}

impl Diff3Merger {
    /// Use a specific `diff3` binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ThreeWayMerge for Diff3Merger {
    fn merge_text(
        &self,
        mine: &[u8],
        older: &[u8],
        yours: &[u8],
    ) -> Result<MergeResult, MergeError> {
        let mine_file = spill(mine)?;
        let older_file = spill(older)?;
        let yours_file = spill(yours)?;

        info!(program = %self.program, "running external three-way merge");
        let output = Command::new(&self.program)
            .arg("-m")
            .arg("-E")
            .arg(mine_file.path())
            .arg(older_file.path())
            .arg(yours_file.path())
            .output()?;

        // diff3: 0 = no conflicts, 1 = conflicts, 2 = trouble
        match output.status.code() {
            Some(0) => Ok(MergeResult::Clean(output.stdout)),
            Some(1) => Ok(MergeResult::Conflict(output.stdout)),
            code => Err(MergeError::ToolFailed {
                exit_code: code.unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

fn spill(content: &[u8]) -> Result<tempfile::NamedTempFile, MergeError> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(content)?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff3_available() -> bool {
        Command::new("diff3").arg("--version").output().is_ok()
    }

    #[test]
    fn test_only_mine_changed() {
        let older = b"line1\nline2\nline3\n";
        let mine = b"line1\nmodified\nline3\n";
        let result = NativeMerger.merge(mine, older, older).unwrap();
        assert_eq!(result, MergeResult::Clean(mine.to_vec()));
    }

    #[test]
    fn test_non_overlapping_changes() {
        let older = b"aaa\nbbb\nccc\nddd\neee\n";
        let mine = b"AAA\nbbb\nccc\nddd\neee\n";
        let yours = b"aaa\nbbb\nccc\nddd\nEEE\n";
        let result = NativeMerger.merge(mine, older, yours).unwrap();
        assert_eq!(
            result,
            MergeResult::Clean(b"AAA\nbbb\nccc\nddd\nEEE\n".to_vec())
        );
    }

    #[test]
    fn test_conflicting_changes() {
        let older = b"line1\noriginal\nline3\n";
        let mine = b"line1\nmine_version\nline3\n";
        let yours = b"line1\nyours_version\nline3\n";
        let result = NativeMerger.merge(mine, older, yours).unwrap();
        let MergeResult::Conflict(text) = result else {
            panic!("expected conflict, got {result:?}");
        };
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("<<<<<<<"));
        assert!(text.contains("======="));
        assert!(text.contains(">>>>>>>"));
        assert!(text.contains("mine_version"));
        assert!(text.contains("yours_version"));
    }

    #[test]
    fn test_same_change_both_sides() {
        let result = NativeMerger.merge(b"new\n", b"old\n", b"new\n").unwrap();
        assert!(result.is_clean());
    }

    #[test]
    fn test_diff3_clean_and_conflict() {
        if !diff3_available() {
            return;
        }
        let m = Diff3Merger::default();
        let older = b"aaa\nbbb\nccc\nddd\neee\n";
        let clean = m
            .merge(b"AAA\nbbb\nccc\nddd\neee\n", older, b"aaa\nbbb\nccc\nddd\nEEE\n")
            .unwrap();
        assert_eq!(
            clean,
            MergeResult::Clean(b"AAA\nbbb\nccc\nddd\nEEE\n".to_vec())
        );

        let conflict = m
            .merge(b"aaa\nXXX\nccc\n", b"aaa\nbbb\nccc\n", b"aaa\nYYY\nccc\n")
            .unwrap();
        assert!(matches!(conflict, MergeResult::Conflict(_)));
    }

    #[test]
    fn test_diff3_missing_program_is_io_error() {
        let m = Diff3Merger::with_program("/nonexistent/diff3");
        let err = m.merge(b"a\n", b"b\n", b"c\n").unwrap_err();
        assert!(matches!(err, MergeError::Io(_)));
    }
}
