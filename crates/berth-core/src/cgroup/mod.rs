//! Cgroups v2 hierarchy management.
//!
//! A manager owns one parent cgroup directly under the unified hierarchy
//! (normally `/sys/fs/cgroup`); every container gets a child scope named by
//! its UUID that lives from bootstrap until teardown.

use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};

/// Verifies that a cgroup v2 hierarchy is mounted at `root`.
///
/// # Errors
///
/// Returns [`BerthError::ResourceUnavailable`] if `cgroup.controllers` is
/// missing, which means the unified hierarchy is not mounted there.
pub fn check_cgroups(root: &Path) -> Result<()> {
    let controllers = root.join("cgroup.controllers");
    std::fs::metadata(&controllers).map_err(|e| BerthError::ResourceUnavailable {
        resource: format!("cgroup v2 hierarchy at {}", root.display()),
        source: e,
    })?;
    tracing::debug!(root = %root.display(), "cgroup v2 hierarchy present");
    Ok(())
}

/// Handle to a single cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Opens (creating if needed) the cgroup `name` under `root`.
    ///
    /// The cgroup must be writable, otherwise no container could ever be
    /// placed in it.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ResourceUnavailable`] if the directory cannot be
    /// created or is not writable.
    pub fn new(root: &Path, name: &str) -> Result<Self> {
        let path = root.join(name);
        std::fs::create_dir_all(&path).map_err(|e| unavailable(&path, e))?;
        nix::unistd::access(&path, nix::unistd::AccessFlags::W_OK)
            .map_err(|e| unavailable(&path, e.into()))?;
        tracing::info!(path = %path.display(), "cgroup ready");
        Ok(Self { path })
    }

    /// Creates the child scope `name` under this cgroup.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ResourceUnavailable`] if the directory cannot be
    /// created.
    pub fn child(&self, name: &str) -> Result<Self> {
        let path = self.path.join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(unavailable(&path, e)),
        }
        tracing::debug!(path = %path.display(), "child cgroup created");
        Ok(Self { path })
    }

    /// Returns the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string())
            .map_err(|e| BerthError::io(procs_path, e))?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup. A cgroup that is already gone is not an error.
    ///
    /// The kernel refuses to remove a cgroup that still has member
    /// processes, so this must be called after the process tree is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BerthError::io(&self.path, e)),
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

fn unavailable(path: &Path, source: std::io::Error) -> BerthError {
    BerthError::ResourceUnavailable {
        resource: format!("cgroup {}", path.display()),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_cgroups_requires_controllers_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            check_cgroups(dir.path()),
            Err(BerthError::ResourceUnavailable { .. })
        ));

        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory io").expect("write");
        check_cgroups(dir.path()).expect("hierarchy should be detected");
    }

    #[test]
    fn parent_and_child_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = Cgroup::new(dir.path(), "berth").expect("parent");
        let child = parent.child("c1").expect("child");
        assert!(child.path().is_dir());
        assert!(child.path().starts_with(parent.path()));

        // Creating the same child twice is fine.
        let again = parent.child("c1").expect("child again");
        assert_eq!(again, child);
    }

    #[test]
    fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = Cgroup::new(dir.path(), "berth").expect("parent");
        let child = parent.child("c2").expect("child");
        child.destroy().expect("destroy");
        assert!(!child.path().exists());
        child.destroy().expect("second destroy");
    }
}
