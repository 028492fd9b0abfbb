//! Terminal styling for command output.

use console::Style;

use pkgsync_core::package::FileAction;
use pkgsync_core::FileStatus;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold).
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Status code column of `status` output.
pub fn status_code(status: FileStatus) -> String {
    let style = match status {
        FileStatus::Conflicted | FileStatus::Missing | FileStatus::MissingAdded => {
            Style::new().red().bold()
        }
        FileStatus::Added | FileStatus::ReAdded => Style::new().green(),
        FileStatus::Deleted => Style::new().red(),
        FileStatus::Modified => Style::new().yellow(),
        FileStatus::Skipped | FileStatus::Unversioned => Style::new().dim(),
        FileStatus::Unmodified => Style::new(),
    };
    style.apply_to(status.code()).to_string()
}

/// Action code column of `update` and `pull` output.
pub fn action_code(action: FileAction) -> String {
    let style = match action {
        FileAction::Conflicted => Style::new().red().bold(),
        FileAction::Added | FileAction::Restored => Style::new().green(),
        FileAction::Deleted => Style::new().red(),
        FileAction::Merged => Style::new().cyan(),
        FileAction::Updated => Style::new(),
        FileAction::Skipped | FileAction::Kept => Style::new().dim(),
    };
    style.apply_to(action.code()).to_string()
}
