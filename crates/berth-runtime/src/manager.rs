//! The container manager: validation, creation and the live-container
//! registry.
//!
//! The registry is only reachable through [`Manager`] methods. Lock order
//! is registry first, then a container's own state lock.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use berth_common::config::ManagerOptions;
use berth_common::error::{BerthError, Result};
use berth_common::manifest::{ImageManifest, PodManifest, RuntimeApp, RuntimeImage, Volume};
use berth_common::types::{ContainerId, is_valid_name, name_from_identifier};
use berth_core::cgroup::{Cgroup, check_cgroups};

use crate::container::Container;
use crate::launch::{ProcessLauncher, StagerLauncher};
use crate::volume::VolumeRegistry;

/// Owns every live container on the host.
pub struct Manager {
    options: ManagerOptions,
    cgroup: Cgroup,
    volumes: VolumeRegistry,
    launcher: Arc<dyn StagerLauncher>,
    containers: RwLock<HashMap<ContainerId, Arc<Container>>>,
    volume_lock: Mutex<()>,
    me: Weak<Self>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("cgroup", &self.cgroup)
            .field("volumes", &self.volumes)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Creates a manager with the default volume drivers, launching
    /// `options.stager_binary` for each container.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ResourceUnavailable`] if cgroup v2 is missing,
    /// the parent cgroup is not writable, or a directory cannot be created.
    pub fn new(options: ManagerOptions) -> Result<Arc<Self>> {
        let volumes = VolumeRegistry::with_defaults(&options)?;
        let launcher = Arc::new(ProcessLauncher::new(&options.stager_binary));
        Self::with_parts(options, volumes, launcher)
    }

    /// Creates a manager with the given volume drivers and stager launcher.
    ///
    /// # Errors
    ///
    /// Same as [`Manager::new`].
    pub fn with_parts(
        options: ManagerOptions,
        volumes: VolumeRegistry,
        launcher: Arc<dyn StagerLauncher>,
    ) -> Result<Arc<Self>> {
        check_cgroups(&options.cgroup_root)?;
        let cgroup = Cgroup::new(&options.cgroup_root, &options.parent_cgroup_name)?;
        for dir in [&options.container_directory, &options.volume_directory] {
            std::fs::create_dir_all(dir).map_err(|e| BerthError::ResourceUnavailable {
                resource: format!("directory {}", dir.display()),
                source: e,
            })?;
        }
        tracing::info!(
            cgroup = %cgroup.path().display(),
            containers = %options.container_directory.display(),
            volume_kinds = ?volumes,
            "manager ready"
        );
        Ok(Arc::new_cyclic(|me| Self {
            options,
            cgroup,
            volumes,
            launcher,
            containers: RwLock::new(HashMap::new()),
            volume_lock: Mutex::new(()),
            me: me.clone(),
        }))
    }

    /// Manager settings.
    #[must_use]
    pub const fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Checks that `manifest` can be run on this host.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidManifest`] if the image has no exec,
    /// [`BerthError::PolicyViolation`] if its namespace isolator omits a
    /// namespace the host requires, [`BerthError::Internal`] if the host
    /// requires a namespace that does not exist, or
    /// [`BerthError::InvalidName`] for a malformed mount point name.
    pub fn validate(&self, manifest: &ImageManifest) -> Result<()> {
        let app = manifest
            .app
            .as_ref()
            .filter(|a| !a.exec.is_empty())
            .ok_or_else(|| BerthError::InvalidManifest {
                message: format!("image {:?} declares no exec", manifest.name),
            })?;

        if let Some(isolator) = app.namespaces()? {
            for required in &self.options.required_namespaces {
                match isolator.requests(required) {
                    Some(true) => {}
                    Some(false) => {
                        return Err(BerthError::PolicyViolation {
                            message: format!("namespace {required:?} is required by host policy"),
                        });
                    }
                    None => {
                        return Err(BerthError::Internal {
                            message: format!("unknown namespace {required:?} in required namespaces"),
                        });
                    }
                }
            }
        }

        if let Some(point) = app.mount_points.iter().find(|p| !is_valid_name(&p.name)) {
            return Err(BerthError::InvalidName {
                name: point.name.clone(),
            });
        }
        Ok(())
    }

    /// Registers a container for `manifest` and starts its bootstrap in the
    /// background. Returns as soon as the container is registered.
    ///
    /// An empty `id` is replaced by a generated UUID; an empty `name` is
    /// derived from the image name.
    ///
    /// # Errors
    ///
    /// Returns a validation error, [`BerthError::InvalidName`] for a
    /// malformed id or name, or [`BerthError::Config`] if the id is taken.
    pub fn create(
        &self,
        id: &str,
        name: &str,
        manifest: ImageManifest,
        image: Box<dyn Read + Send>,
    ) -> Result<Arc<Container>> {
        self.create_with_volumes(id, name, manifest, Vec::new(), image)
    }

    /// Like [`Manager::create`], declaring `volumes` on the pod.
    ///
    /// # Errors
    ///
    /// Same as [`Manager::create`], plus volume validation errors.
    pub fn create_with_volumes(
        &self,
        id: &str,
        name: &str,
        manifest: ImageManifest,
        volumes: Vec<Volume>,
        image: Box<dyn Read + Send>,
    ) -> Result<Arc<Container>> {
        self.validate(&manifest)?;

        let uuid = if id.is_empty() {
            ContainerId::generate()
        } else if is_valid_name(id) {
            ContainerId::new(id)
        } else {
            return Err(BerthError::InvalidName { name: id.into() });
        };
        let name = if name.is_empty() {
            name_from_identifier(&manifest.name)?
        } else if is_valid_name(name) {
            name.to_owned()
        } else {
            return Err(BerthError::InvalidName { name: name.into() });
        };

        let app = manifest.app.clone().ok_or_else(|| BerthError::InvalidManifest {
            message: format!("image {:?} declares no app", manifest.name),
        })?;
        let pod = PodManifest {
            apps: vec![RuntimeApp {
                name: name.clone(),
                app,
                image: RuntimeImage {
                    name: manifest.name.clone(),
                    labels: manifest.labels.clone(),
                },
            }],
            volumes,
        };
        self.volumes.validate(&pod)?;

        let directory = self.options.container_directory.join(uuid.as_str());
        let container = Arc::new(Container::new(
            self.me.clone(),
            uuid.clone(),
            name,
            manifest,
            pod,
            directory,
        ));
        {
            let mut registry = self.write_registry();
            if registry.contains_key(&uuid) {
                return Err(BerthError::Config {
                    message: format!("container {uuid} already exists"),
                });
            }
            let _ = registry.insert(uuid.clone(), Arc::clone(&container));
        }

        if let Err(e) = container.start(image) {
            self.remove(&container);
            return Err(e);
        }
        tracing::info!(id = %uuid, name = container.name(), "container created");
        Ok(container)
    }

    /// Snapshot of every live container.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.read_registry().values().cloned().collect()
    }

    /// Looks up a live container.
    #[must_use]
    pub fn container(&self, uuid: &ContainerId) -> Option<Arc<Container>> {
        self.read_registry().get(uuid).cloned()
    }

    /// Returns the directory backing the named volume `name`, creating it
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidName`] for a malformed name, or
    /// [`BerthError::ResourceUnavailable`] if the directory cannot be
    /// created.
    pub fn volume_path(&self, name: &str) -> Result<PathBuf> {
        if !is_valid_name(name) {
            return Err(BerthError::InvalidName { name: name.into() });
        }
        let path = self.options.volume_directory.join(name);
        let _guard = self.volume_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::DirBuilder::new().mode(0o755).create(&path) {
            Ok(()) => {
                tracing::debug!(volume = name, path = %path.display(), "volume directory created");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(path),
            Err(e) => Err(BerthError::ResourceUnavailable {
                resource: format!("volume {name}"),
                source: e,
            }),
        }
    }

    /// Drops `container` from the registry if it is still the registered
    /// entry for its UUID.
    pub(crate) fn remove(&self, container: &Container) {
        let mut registry = self.write_registry();
        container.with_state_locked(|state| {
            let registered = registry
                .get(container.uuid())
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), container));
            if registered {
                let _ = registry.remove(container.uuid());
                tracing::debug!(id = %container.uuid(), %state, "container removed from registry");
            }
        });
    }

    pub(crate) const fn cgroup(&self) -> &Cgroup {
        &self.cgroup
    }

    pub(crate) const fn volumes(&self) -> &VolumeRegistry {
        &self.volumes
    }

    pub(crate) fn launcher(&self) -> &dyn StagerLauncher {
        self.launcher.as_ref()
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ContainerId, Arc<Container>>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ContainerId, Arc<Container>>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
