//! The `empty` volume driver: a fresh scratch directory per container.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use berth_common::constants::DEFAULT_VOLUME_MODE;
use berth_common::error::{BerthError, Result};
use berth_common::manifest::PodManifest;
use berth_common::types::ContainerId;
use berth_core::filesystem::MountDescriptor;

use super::{VolumeDriver, mount_destination, parse_file_mode};

/// Kind handled by [`EmptyVolumeDriver`].
pub const KIND: &str = "empty";

/// Creates `<root>/<uuid>/<volume>` directories and binds them into the
/// container.
#[derive(Debug, Clone)]
pub struct EmptyVolumeDriver {
    root: PathBuf,
}

impl EmptyVolumeDriver {
    /// Creates the driver, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ResourceUnavailable`] if `root` cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| BerthError::ResourceUnavailable {
            resource: format!("empty volume root {}", root.display()),
            source: e,
        })?;
        Ok(Self { root })
    }

    fn container_root(&self, uuid: &ContainerId) -> PathBuf {
        self.root.join(uuid.as_str())
    }
}

impl VolumeDriver for EmptyVolumeDriver {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self, pod: &PodManifest) -> Result<()> {
        for volume in pod.volumes_of_kind(KIND) {
            if let Some(mode) = volume.mode.as_deref().filter(|m| !m.is_empty()) {
                let _ = parse_file_mode(mode)?;
            }
        }
        Ok(())
    }

    fn provision(&self, uuid: &ContainerId, pod: &PodManifest) -> Result<Vec<MountDescriptor>> {
        let mut mounts = Vec::new();
        for volume in pod.volumes_of_kind(KIND) {
            let mode = match volume.mode.as_deref() {
                Some(m) if !m.is_empty() => parse_file_mode(m)?,
                _ => DEFAULT_VOLUME_MODE,
            };

            let path = self.container_root(uuid).join(&volume.name);
            std::fs::create_dir_all(&path).map_err(|e| unavailable(&path, e))?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| BerthError::io(&path, e))?;
            set_owner(&path, volume.uid.unwrap_or(0), volume.gid.unwrap_or(0))?;

            tracing::debug!(id = %uuid, volume = %volume.name, path = %path.display(), mode, "empty volume created");
            mounts.push(MountDescriptor::bind(
                path,
                mount_destination(&volume.name),
                volume.is_read_only(),
            ));
        }
        Ok(mounts)
    }

    fn deprovision(&self, uuid: &ContainerId, _pod: &PodManifest) -> Result<()> {
        let path = self.container_root(uuid);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                tracing::debug!(id = %uuid, path = %path.display(), "empty volumes removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BerthError::io(path, e)),
        }
    }
}

/// Changes ownership unless it already matches.
fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| BerthError::io(path, e))?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(());
    }
    std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|e| BerthError::io(path, e))
}

fn unavailable(path: &Path, source: std::io::Error) -> BerthError {
    BerthError::ResourceUnavailable {
        resource: format!("volume directory {}", path.display()),
        source,
    }
}
