//! Volume drivers.
//!
//! A driver turns the pod volumes of its kind into bind mounts. The
//! [`VolumeRegistry`] dispatches by the volume's `kind` field, so new kinds
//! can be registered without touching the manager.

pub mod empty;
pub mod host;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use berth_common::config::ManagerOptions;
use berth_common::constants::VOLUME_MOUNT_ROOT;
use berth_common::error::{BerthError, Result};
use berth_common::manifest::PodManifest;
use berth_common::types::{ContainerId, is_valid_name};
use berth_core::filesystem::MountDescriptor;

pub use empty::EmptyVolumeDriver;
pub use host::HostVolumeDriver;

/// A provisioning strategy for one volume kind.
pub trait VolumeDriver: Send + Sync {
    /// Volume kind handled by this driver, matching [`Volume::kind`].
    ///
    /// [`Volume::kind`]: berth_common::manifest::Volume::kind
    fn kind(&self) -> &str;

    /// Checks this driver's volumes on `pod`, reporting the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid volume.
    fn validate(&self, pod: &PodManifest) -> Result<()>;

    /// Produces a mount for every volume of this driver's kind.
    ///
    /// # Errors
    ///
    /// Returns an error if a volume cannot be provisioned.
    fn provision(&self, uuid: &ContainerId, pod: &PodManifest) -> Result<Vec<MountDescriptor>>;

    /// Releases host resources created by [`VolumeDriver::provision`].
    /// Succeeds when nothing was provisioned.
    ///
    /// # Errors
    ///
    /// Returns an error if provisioned resources cannot be removed.
    fn deprovision(&self, uuid: &ContainerId, pod: &PodManifest) -> Result<()>;
}

/// Drivers keyed by volume kind.
#[derive(Clone, Default)]
pub struct VolumeRegistry {
    drivers: BTreeMap<String, Arc<dyn VolumeDriver>>,
}

impl std::fmt::Debug for VolumeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.drivers.keys()).finish()
    }
}

impl VolumeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `empty` and `host` drivers rooted at the
    /// directories from `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if a driver's root directory cannot be created.
    pub fn with_defaults(options: &ManagerOptions) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(EmptyVolumeDriver::new(
            &options.empty_volume_directory,
        )?));
        registry.register(Arc::new(HostVolumeDriver::new(
            &options.host_volume_directory,
        )?));
        Ok(registry)
    }

    /// Registers `driver`, replacing any driver of the same kind.
    pub fn register(&mut self, driver: Arc<dyn VolumeDriver>) {
        let kind = driver.kind().to_owned();
        if self.drivers.insert(kind.clone(), driver).is_some() {
            tracing::debug!(kind, "replaced volume driver");
        }
    }

    /// Returns the driver for `kind`.
    #[must_use]
    pub fn driver(&self, kind: &str) -> Option<&Arc<dyn VolumeDriver>> {
        self.drivers.get(kind)
    }

    /// Validates every volume on `pod`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidName`] for a malformed volume name,
    /// [`BerthError::InvalidManifest`] for a duplicate name or a kind no
    /// driver handles, or the driver's own validation error.
    pub fn validate(&self, pod: &PodManifest) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for volume in &pod.volumes {
            if !is_valid_name(&volume.name) {
                return Err(BerthError::InvalidName {
                    name: volume.name.clone(),
                });
            }
            if !seen.insert(volume.name.as_str()) {
                return Err(BerthError::InvalidManifest {
                    message: format!("volume {:?} is declared more than once", volume.name),
                });
            }
            if !self.drivers.contains_key(&volume.kind) {
                return Err(BerthError::InvalidManifest {
                    message: format!(
                        "volume {:?} has unsupported kind {:?}",
                        volume.name, volume.kind
                    ),
                });
            }
        }
        self.drivers.values().try_for_each(|d| d.validate(pod))
    }

    /// Provisions every volume on `pod`.
    ///
    /// If a driver fails, the drivers that already ran are deprovisioned
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first driver error.
    pub fn provision(&self, uuid: &ContainerId, pod: &PodManifest) -> Result<Vec<MountDescriptor>> {
        let mut mounts = Vec::new();
        let mut done: Vec<&Arc<dyn VolumeDriver>> = Vec::new();
        for driver in self.drivers.values() {
            done.push(driver);
            match driver.provision(uuid, pod) {
                Ok(m) => mounts.extend(m),
                Err(e) => {
                    for driver in done {
                        if let Err(cleanup) = driver.deprovision(uuid, pod) {
                            tracing::warn!(id = %uuid, kind = driver.kind(), error = %cleanup, "volume rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!(id = %uuid, count = mounts.len(), "volumes provisioned");
        Ok(mounts)
    }

    /// Deprovisions every volume on `pod`. Failures are logged, not returned.
    pub fn deprovision(&self, uuid: &ContainerId, pod: &PodManifest) {
        for driver in self.drivers.values() {
            if let Err(e) = driver.deprovision(uuid, pod) {
                tracing::warn!(id = %uuid, kind = driver.kind(), error = %e, "volume deprovision failed");
            }
        }
    }
}

/// Destination of the volume `name` inside the container.
#[must_use]
pub fn mount_destination(name: &str) -> PathBuf {
    PathBuf::from(VOLUME_MOUNT_ROOT).join(name)
}

/// Parses an octal permission string such as `"0750"`.
///
/// # Errors
///
/// Returns [`BerthError::InvalidManifest`] if `mode` is not octal or has bits
/// outside `0o7777`.
pub fn parse_file_mode(mode: &str) -> Result<u32> {
    u32::from_str_radix(mode, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| BerthError::InvalidManifest {
            message: format!("failed to parse mode {mode:?}"),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use berth_common::manifest::Volume;

    use super::*;

    #[test]
    fn parse_file_mode_accepts_octal() {
        assert_eq!(parse_file_mode("0750").expect("mode"), 0o750);
        assert_eq!(parse_file_mode("755").expect("mode"), 0o755);
        assert_eq!(parse_file_mode("1777").expect("mode"), 0o1777);
    }

    #[test]
    fn parse_file_mode_rejects_garbage() {
        for bad in ["", "rwx", "0789", "77777", "-1"] {
            assert!(
                matches!(parse_file_mode(bad), Err(BerthError::InvalidManifest { .. })),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn mount_destination_is_under_volume_root() {
        assert_eq!(mount_destination("data"), PathBuf::from("/volumes/data"));
    }

    /// Records calls; fails provisioning when `fail` is set.
    struct Recording {
        kind: &'static str,
        fail: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recording {
        fn new(kind: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl VolumeDriver for Recording {
        fn kind(&self) -> &str {
            self.kind
        }

        fn validate(&self, _pod: &PodManifest) -> Result<()> {
            self.calls.lock().expect("lock").push("validate");
            Ok(())
        }

        fn provision(&self, _uuid: &ContainerId, _pod: &PodManifest) -> Result<Vec<MountDescriptor>> {
            self.calls.lock().expect("lock").push("provision");
            if self.fail {
                return Err(BerthError::Internal {
                    message: "boom".into(),
                });
            }
            Ok(vec![MountDescriptor::bind("/src", "/volumes/x", false)])
        }

        fn deprovision(&self, _uuid: &ContainerId, _pod: &PodManifest) -> Result<()> {
            self.calls.lock().expect("lock").push("deprovision");
            Ok(())
        }
    }

    fn pod_with(volumes: &[(&str, &str)]) -> PodManifest {
        PodManifest {
            apps: Vec::new(),
            volumes: volumes
                .iter()
                .map(|(name, kind)| Volume {
                    name: (*name).into(),
                    kind: (*kind).into(),
                    ..Volume::default()
                })
                .collect(),
        }
    }

    #[test]
    fn validate_rejects_unknown_kind_and_bad_names() {
        let mut registry = VolumeRegistry::new();
        registry.register(Recording::new("alpha", false));

        registry
            .validate(&pod_with(&[("data", "alpha")]))
            .expect("known kind");
        assert!(matches!(
            registry.validate(&pod_with(&[("data", "nfs")])),
            Err(BerthError::InvalidManifest { .. })
        ));
        assert!(matches!(
            registry.validate(&pod_with(&[("Data_1", "alpha")])),
            Err(BerthError::InvalidName { .. })
        ));
        assert!(matches!(
            registry.validate(&pod_with(&[("data", "alpha"), ("data", "alpha")])),
            Err(BerthError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn failed_provision_rolls_back_earlier_drivers() {
        let alpha = Recording::new("alpha", false);
        let beta = Recording::new("beta", true);
        let mut registry = VolumeRegistry::new();
        registry.register(alpha.clone());
        registry.register(beta.clone());

        let uuid = ContainerId::new("c1");
        let err = registry.provision(&uuid, &PodManifest::default());
        assert!(err.is_err());
        assert_eq!(alpha.calls(), vec!["provision", "deprovision"]);
        assert_eq!(beta.calls(), vec!["provision", "deprovision"]);
    }

    #[test]
    fn provision_collects_mounts_from_every_driver() {
        let mut registry = VolumeRegistry::new();
        registry.register(Recording::new("alpha", false));
        registry.register(Recording::new("beta", false));
        let mounts = registry
            .provision(&ContainerId::new("c1"), &PodManifest::default())
            .expect("provision");
        assert_eq!(mounts.len(), 2);
    }
}
