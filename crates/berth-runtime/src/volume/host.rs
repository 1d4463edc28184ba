//! The `host` volume driver: binds a directory below a fixed base path.

use std::path::{Component, Path, PathBuf};

use berth_common::error::{BerthError, Result};
use berth_common::manifest::PodManifest;
use berth_common::types::ContainerId;
use berth_core::filesystem::MountDescriptor;

use super::{VolumeDriver, mount_destination};

/// Kind handled by [`HostVolumeDriver`].
pub const KIND: &str = "host";

/// Binds `<base>/<source>` into the container. Creates nothing.
#[derive(Debug, Clone)]
pub struct HostVolumeDriver {
    base: PathBuf,
}

impl HostVolumeDriver {
    /// Creates the driver, creating `base` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ResourceUnavailable`] if `base` cannot be created.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|e| BerthError::ResourceUnavailable {
            resource: format!("host volume base {}", base.display()),
            source: e,
        })?;
        Ok(Self {
            base: normalize(&base),
        })
    }
}

impl VolumeDriver for HostVolumeDriver {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self, pod: &PodManifest) -> Result<()> {
        for volume in pod.volumes_of_kind(KIND) {
            let _ = resolve(&self.base, volume.source.as_deref().unwrap_or_default())?;
        }
        Ok(())
    }

    fn provision(&self, uuid: &ContainerId, pod: &PodManifest) -> Result<Vec<MountDescriptor>> {
        pod.volumes_of_kind(KIND)
            .map(|volume| {
                let source = resolve(&self.base, volume.source.as_deref().unwrap_or_default())?;
                tracing::debug!(id = %uuid, volume = %volume.name, source = %source.display(), "host volume resolved");
                Ok(MountDescriptor::bind(
                    source,
                    mount_destination(&volume.name),
                    volume.is_read_only(),
                ))
            })
            .collect()
    }

    fn deprovision(&self, _uuid: &ContainerId, _pod: &PodManifest) -> Result<()> {
        Ok(())
    }
}

/// Resolves `source` against `base`.
///
/// The source is appended to the base and the result is normalized
/// lexically. It must be `base` itself or lie below it.
///
/// # Errors
///
/// Returns [`BerthError::PathEscape`] if the result lies outside `base`.
pub fn resolve(base: &Path, source: &str) -> Result<PathBuf> {
    let mut joined = base.as_os_str().to_owned();
    joined.push("/");
    joined.push(source);
    let resolved = normalize(Path::new(&joined));

    if resolved.starts_with(base) {
        Ok(resolved)
    } else {
        Err(BerthError::PathEscape {
            source_path: source.into(),
        })
    }
}

/// Lexically removes `.` and `..` components. `..` at the root stays at
/// the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use berth_common::manifest::Volume;

    use super::*;

    fn base() -> &'static Path {
        Path::new("/example")
    }

    #[test]
    fn resolve_keeps_paths_inside_base() {
        let cases = [
            ("a/b", "/example/a/b"),
            ("/a/b", "/example/a/b"),
            ("/a/b/../c", "/example/a/c"),
            ("a//b/./c", "/example/a/b/c"),
            ("", "/example"),
            ("/", "/example"),
            ("a/..", "/example"),
        ];
        for (source, expected) in cases {
            assert_eq!(
                resolve(base(), source).expect(source),
                PathBuf::from(expected),
                "{source:?}"
            );
        }
    }

    #[test]
    fn resolve_rejects_escapes() {
        for source in ["../a/b", "/../a/b", "/a/../../c", "..", "a/../../example-other"] {
            assert!(
                matches!(resolve(base(), source), Err(BerthError::PathEscape { .. })),
                "{source:?}"
            );
        }
    }

    #[test]
    fn resolve_rejects_sibling_with_common_prefix() {
        assert!(resolve(base(), "../examplefoo").is_err());
    }

    #[test]
    fn provision_binds_resolved_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = HostVolumeDriver::new(dir.path()).expect("driver");
        let pod = PodManifest {
            apps: Vec::new(),
            volumes: vec![Volume {
                name: "config".into(),
                kind: KIND.into(),
                source: Some("etc/app".into()),
                read_only: Some(true),
                ..Volume::default()
            }],
        };

        let mounts = driver.provision(&ContainerId::new("c1"), &pod).expect("provision");
        assert_eq!(mounts[0].source, dir.path().join("etc/app"));
        assert_eq!(mounts[0].destination, PathBuf::from("/volumes/config"));
        assert!(mounts[0].flags.read_only);
        assert!(!dir.path().join("etc").exists());
    }

    #[test]
    fn validate_reports_escaping_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = HostVolumeDriver::new(dir.path()).expect("driver");
        let pod = PodManifest {
            apps: Vec::new(),
            volumes: vec![Volume {
                name: "etc".into(),
                kind: KIND.into(),
                source: Some("../../etc".into()),
                ..Volume::default()
            }],
        };
        let err = driver.validate(&pod).expect_err("must escape");
        assert_eq!(
            err.to_string(),
            "the provided source path is escaping the base volume path: ../../etc"
        );
    }
}
