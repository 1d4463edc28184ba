//! Bind mounts for container filesystem assembly.

use std::path::{Component, Path, PathBuf};

use berth_common::error::{BerthError, Result};
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

/// Flags carried by a [`MountDescriptor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountFlags {
    /// Bind the source onto the destination.
    pub bind: bool,
    /// Also bind submounts of the source.
    pub recursive: bool,
    /// Make the mount read-only.
    pub read_only: bool,
}

impl MountFlags {
    /// Flags for the initial `mount(2)` call.
    #[must_use]
    pub fn ms_flags(self) -> MsFlags {
        let mut flags = MsFlags::empty();
        if self.bind {
            flags |= MsFlags::MS_BIND;
        }
        if self.recursive {
            flags |= MsFlags::MS_REC;
        }
        flags
    }
}

/// A host path to be mounted at a destination inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Source path on the host.
    pub source: PathBuf,
    /// Absolute destination path inside the container.
    pub destination: PathBuf,
    /// Backing device type. Always `bind` for volumes.
    pub device: String,
    /// Mount flags.
    pub flags: MountFlags,
}

impl MountDescriptor {
    /// Creates a bind mount descriptor.
    pub fn bind(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        read_only: bool,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            device: "bind".into(),
            flags: MountFlags {
                bind: true,
                recursive: false,
                read_only,
            },
        }
    }

    /// Returns the mount target on the host for a container rooted at `rootfs`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::PathEscape`] if the destination contains `..`
    /// components.
    pub fn target_in(&self, rootfs: &Path) -> Result<PathBuf> {
        let mut target = rootfs.to_path_buf();
        for component in self.destination.components() {
            match component {
                Component::Normal(part) => target.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(BerthError::PathEscape {
                        source_path: self.destination.display().to_string(),
                    });
                }
            }
        }
        Ok(target)
    }
}

/// Marks every mount in the calling mount namespace as private, so that
/// mounts made afterwards do not propagate back to the host.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn make_private_root() -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| mount_error("/", e))?;
    tracing::debug!("root mount propagation set to private");
    Ok(())
}

/// Applies a mount descriptor inside `rootfs`.
///
/// Creates the target directory if needed. Read-only bind mounts need a
/// second remount, since `MS_RDONLY` is ignored on the initial bind.
///
/// # Errors
///
/// Returns an error if the target cannot be created or a `mount(2)` call fails.
pub fn apply(rootfs: &Path, descriptor: &MountDescriptor) -> Result<()> {
    let target = descriptor.target_in(rootfs)?;
    std::fs::create_dir_all(&target).map_err(|e| BerthError::io(&target, e))?;

    let device = (descriptor.device != "bind").then_some(descriptor.device.as_str());
    nix::mount::mount(
        Some(descriptor.source.as_path()),
        &target,
        device,
        descriptor.flags.ms_flags(),
        None::<&str>,
    )
    .map_err(|e| mount_error(&target, e))?;

    if descriptor.flags.read_only {
        nix::mount::mount(
            None::<&str>,
            &target,
            None::<&str>,
            descriptor.flags.ms_flags() | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| mount_error(&target, e))?;
    }

    tracing::debug!(
        source = %descriptor.source.display(),
        target = %target.display(),
        read_only = descriptor.flags.read_only,
        "bind mount applied"
    );
    Ok(())
}

fn mount_error(target: impl AsRef<Path>, errno: nix::errno::Errno) -> BerthError {
    BerthError::io(target.as_ref(), errno.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_descriptor_sets_flags() {
        let m = MountDescriptor::bind("/srv/data", "/volumes/data", true);
        assert_eq!(m.device, "bind");
        assert!(m.flags.bind);
        assert!(m.flags.read_only);
        assert_eq!(m.flags.ms_flags(), MsFlags::MS_BIND);
    }

    #[test]
    fn target_in_joins_below_rootfs() {
        let m = MountDescriptor::bind("/srv/data", "/volumes/data", false);
        let target = m.target_in(Path::new("/containers/c1/rootfs")).expect("target");
        assert_eq!(target, PathBuf::from("/containers/c1/rootfs/volumes/data"));
    }

    #[test]
    fn target_in_rejects_parent_components() {
        let m = MountDescriptor::bind("/srv/data", "/volumes/../../etc", false);
        assert!(matches!(
            m.target_in(Path::new("/containers/c1/rootfs")),
            Err(BerthError::PathEscape { .. })
        ));
    }
}
