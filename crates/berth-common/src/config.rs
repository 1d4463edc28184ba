//! Configuration model for the container manager.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BerthError, Result};

/// Settings used by the container manager and the containers it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Name of the parent cgroup every container is placed under.
    pub parent_cgroup_name: String,
    /// Mount point of the cgroup v2 hierarchy.
    pub cgroup_root: PathBuf,
    /// Directory holding one subdirectory per container.
    pub container_directory: PathBuf,
    /// Directory holding named volumes.
    pub volume_directory: PathBuf,
    /// Root for `empty` volume scratch directories.
    pub empty_volume_directory: PathBuf,
    /// Base directory `host` volume sources must stay within.
    pub host_volume_directory: PathBuf,
    /// Namespaces every app isolator must request.
    pub required_namespaces: Vec<String>,
    /// Path of the `berth-stager` binary.
    pub stager_binary: PathBuf,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            parent_cgroup_name: constants::DEFAULT_PARENT_CGROUP.into(),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            container_directory: PathBuf::from(constants::DEFAULT_CONTAINER_DIR),
            volume_directory: PathBuf::from(constants::DEFAULT_VOLUME_DIR),
            empty_volume_directory: PathBuf::from(constants::DEFAULT_EMPTY_VOLUME_DIR),
            host_volume_directory: PathBuf::from(constants::DEFAULT_HOST_VOLUME_DIR),
            required_namespaces: Vec::new(),
            stager_binary: PathBuf::from(constants::DEFAULT_STAGER_BINARY),
        }
    }
}

impl ManagerOptions {
    /// Loads options from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
        let options: Self = serde_json::from_str(&content)?;
        if options.parent_cgroup_name.is_empty() {
            return Err(BerthError::Config {
                message: "parent_cgroup_name must not be empty".into(),
            });
        }
        Ok(options)
    }

    /// Returns options with every directory rooted under `base`.
    ///
    /// Used for tests and unprivileged development hosts.
    #[must_use]
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            cgroup_root: base.join("cgroup"),
            container_directory: base.join("containers"),
            volume_directory: base.join("volumes"),
            empty_volume_directory: base.join("empty-volumes"),
            host_volume_directory: base.join("host-volumes"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("berth.json");
        std::fs::write(&path, r#"{"required_namespaces": ["pid", "mount"]}"#).expect("write");

        let options = ManagerOptions::load(&path).expect("load");
        assert_eq!(options.required_namespaces, vec!["pid", "mount"]);
        assert_eq!(options.parent_cgroup_name, constants::DEFAULT_PARENT_CGROUP);
        assert_eq!(options.cgroup_root, PathBuf::from(constants::CGROUP_V2_PATH));
    }

    #[test]
    fn load_rejects_empty_parent_cgroup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("berth.json");
        std::fs::write(&path, r#"{"parent_cgroup_name": ""}"#).expect("write");
        assert!(matches!(
            ManagerOptions::load(&path),
            Err(BerthError::Config { .. })
        ));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = ManagerOptions::load(Path::new("/nonexistent/berth.json")).unwrap_err();
        assert!(matches!(err, BerthError::Io { .. }));
    }
}
