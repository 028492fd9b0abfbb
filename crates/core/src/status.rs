//! File status classification.
//!
//! [`classify`] is a pure decision table over the facts recorded for one
//! file. Rows are checked top to bottom and the first match wins; a fact
//! combination no row covers means the store and the working directory
//! disagree, which is reported as [`WcError::Inconsistent`].

use crate::errors::WcError;
use crate::models::FileStatus;

/// Everything the engine knows about one file name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFacts {
    pub in_working_dir: bool,
    pub in_store: bool,
    /// Listed in the package's FileEntry table.
    pub known: bool,
    pub to_be_added: bool,
    pub to_be_deleted: bool,
    pub in_conflict: bool,
    pub skipped: bool,
    /// Working file hash differs from the recorded hash. Only consulted for
    /// files that are known and present in both places.
    pub content_changed: bool,
}

/// Classify one file. `name` is only used for the error message.
pub fn classify(name: &str, f: &StatusFacts) -> Result<FileStatus, WcError> {
    let status = if f.to_be_deleted {
        FileStatus::Deleted
    } else if f.in_conflict {
        FileStatus::Conflicted
    } else if f.skipped {
        FileStatus::Skipped
    } else if f.to_be_added && f.in_working_dir && f.in_store {
        FileStatus::ReAdded
    } else if f.to_be_added && f.in_working_dir {
        FileStatus::Added
    } else if f.known && f.in_working_dir && f.in_store {
        if f.content_changed {
            FileStatus::Modified
        } else {
            FileStatus::Unmodified
        }
    } else if f.to_be_added {
        FileStatus::MissingAdded
    } else if f.known && !f.in_working_dir {
        FileStatus::Missing
    } else if f.in_working_dir && !f.known && !f.in_store {
        FileStatus::Unversioned
    } else {
        return Err(WcError::Inconsistent {
            path: name.to_string(),
            violations: vec![format!("unclassifiable file state {f:?}")],
        });
    };
    Ok(status)
}

/// Whether classifying these facts needs the working file's hash.
pub fn needs_content_check(f: &StatusFacts) -> bool {
    !f.to_be_deleted
        && !f.in_conflict
        && !f.skipped
        && !f.to_be_added
        && f.known
        && f.in_working_dir
        && f.in_store
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(bits: u8) -> StatusFacts {
        StatusFacts {
            in_working_dir: bits & 1 != 0,
            in_store: bits & 2 != 0,
            known: bits & 4 != 0,
            to_be_added: bits & 8 != 0,
            to_be_deleted: bits & 16 != 0,
            in_conflict: bits & 32 != 0,
            skipped: bits & 64 != 0,
            content_changed: bits & 128 != 0,
        }
    }

    /// Independent restatement of the table used to cross-check `classify`.
    fn expected(f: &StatusFacts) -> Option<FileStatus> {
        let rows: [(bool, FileStatus); 10] = [
            (f.to_be_deleted, FileStatus::Deleted),
            (f.in_conflict, FileStatus::Conflicted),
            (f.skipped, FileStatus::Skipped),
            (f.to_be_added && f.in_working_dir && f.in_store, FileStatus::ReAdded),
            (f.to_be_added && f.in_working_dir, FileStatus::Added),
            (
                f.known && f.in_working_dir && f.in_store && f.content_changed,
                FileStatus::Modified,
            ),
            (f.known && f.in_working_dir && f.in_store, FileStatus::Unmodified),
            (f.to_be_added && !f.in_working_dir, FileStatus::MissingAdded),
            (f.known && !f.in_working_dir, FileStatus::Missing),
            (
                f.in_working_dir && !f.known && !f.in_store,
                FileStatus::Unversioned,
            ),
        ];
        rows.iter().find(|(hit, _)| *hit).map(|(_, s)| *s)
    }

    #[test]
    fn test_every_fact_combination_has_one_outcome() {
        for bits in 0..=u8::MAX {
            let f = facts(bits);
            match (classify("f", &f), expected(&f)) {
                (Ok(got), Some(want)) => assert_eq!(got, want, "facts {f:?}"),
                (Err(WcError::Inconsistent { .. }), None) => {}
                (got, want) => panic!("facts {f:?}: got {got:?}, want {want:?}"),
            }
        }
    }

    #[test]
    fn test_pending_sets_take_precedence() {
        let f = StatusFacts {
            in_working_dir: true,
            in_store: true,
            known: true,
            to_be_deleted: true,
            in_conflict: true,
            ..Default::default()
        };
        assert_eq!(classify("f", &f).unwrap(), FileStatus::Deleted);
    }

    #[test]
    fn test_readded_vs_added() {
        let mut f = StatusFacts {
            in_working_dir: true,
            to_be_added: true,
            ..Default::default()
        };
        assert_eq!(classify("f", &f).unwrap(), FileStatus::Added);
        f.in_store = true;
        assert_eq!(classify("f", &f).unwrap(), FileStatus::ReAdded);
    }

    #[test]
    fn test_known_without_pristine_is_inconsistent() {
        let f = StatusFacts {
            in_working_dir: true,
            known: true,
            ..Default::default()
        };
        assert!(matches!(
            classify("f", &f),
            Err(WcError::Inconsistent { .. })
        ));
    }

    #[test]
    fn test_nothing_anywhere_is_inconsistent() {
        assert!(classify("f", &StatusFacts::default()).is_err());
    }

    #[test]
    fn test_content_check_only_for_tracked_files() {
        let tracked = StatusFacts {
            in_working_dir: true,
            in_store: true,
            known: true,
            ..Default::default()
        };
        assert!(needs_content_check(&tracked));
        let added = StatusFacts {
            to_be_added: true,
            ..tracked
        };
        assert!(!needs_content_check(&added));
    }
}
