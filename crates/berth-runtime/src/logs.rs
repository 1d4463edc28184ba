//! Per-app log files inside a container directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

/// Returns the log file path for an app.
#[must_use]
pub fn log_path(directory: &Path, app: &str) -> PathBuf {
    directory.join("logs").join(format!("{app}.log"))
}

/// Opens an app's log for appending, creating the log directory if needed.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn open_app_log(directory: &Path, app: &str) -> Result<File> {
    let path = log_path(directory, app);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BerthError::io(path, e))
}

/// Reads an app's log. Returns an empty string if nothing was logged yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(directory: &Path, app: &str) -> Result<String> {
    let path = log_path(directory, app);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(BerthError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn log_path_is_constructed_correctly() {
        let p = log_path(Path::new("/var/lib/berth/containers/c1"), "web");
        assert_eq!(p, PathBuf::from("/var/lib/berth/containers/c1/logs/web.log"));
    }

    #[test]
    fn read_logs_missing_file_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let content = read_logs(dir.path(), "nonexistent").expect("should succeed");
        assert!(content.is_empty());
    }

    #[test]
    fn open_appends_across_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        writeln!(open_app_log(dir.path(), "web").expect("open 1"), "line one").expect("write");
        writeln!(open_app_log(dir.path(), "web").expect("open 2"), "line two").expect("write");

        let content = read_logs(dir.path(), "web").expect("read");
        assert_eq!(content, "line one\nline two\n");
    }

    #[test]
    fn separate_apps_have_separate_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        writeln!(open_app_log(dir.path(), "a").expect("open a"), "from a").expect("write");
        writeln!(open_app_log(dir.path(), "b").expect("open b"), "from b").expect("write");

        assert!(!read_logs(dir.path(), "a").expect("read a").contains("from b"));
        assert!(!read_logs(dir.path(), "b").expect("read b").contains("from a"));
    }
}
