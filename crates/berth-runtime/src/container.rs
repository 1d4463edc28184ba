//! A container: its state machine, host-side start sequence and supervision.
//!
//! State changes happen under the container's own lock and are published
//! through a condition variable, so [`Container::wait_for`] never polls.
//! Code that needs both the manager's registry and a container's state
//! takes the registry first.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use berth_common::error::{BerthError, Result};
use berth_common::manifest::{ImageManifest, PodManifest};
use berth_common::types::{ContainerId, ContainerState};
use berth_core::cgroup::Cgroup;
use berth_core::filesystem::MountDescriptor;
use berth_core::namespace::NamespaceSet;
use chrono::{DateTime, Utc};

use crate::launch::{LAUNCH_STEP, StagerHandle};
use crate::manager::Manager;
use crate::stager::StagerConfig;

/// Directory name of the root filesystem inside an unpacked image.
pub const ROOTFS_DIR: &str = "rootfs";

/// Result of [`Container::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// One of the target states was reached.
    Reached(ContainerState),
    /// The timeout elapsed first; carries the state at that moment.
    TimedOut(ContainerState),
    /// The container ended in a terminal state outside the targets.
    Unreachable(ContainerState),
}

#[derive(Default)]
struct Inner {
    state: ContainerState,
    exit_code: Option<i32>,
    failure: Option<Arc<BerthError>>,
    handle: Option<Arc<dyn StagerHandle>>,
    stop_requested: bool,
    cgroup: Option<Cgroup>,
    volumes_provisioned: bool,
    torn_down: bool,
}

/// A container created by a [`Manager`].
pub struct Container {
    manager: Weak<Manager>,
    uuid: ContainerId,
    name: String,
    image: ImageManifest,
    pod: PodManifest,
    directory: PathBuf,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Container {
    pub(crate) fn new(
        manager: Weak<Manager>,
        uuid: ContainerId,
        name: String,
        image: ImageManifest,
        pod: PodManifest,
        directory: PathBuf,
    ) -> Self {
        Self {
            manager,
            uuid,
            name,
            image,
            pod,
            directory,
            created_at: Utc::now(),
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
        }
    }

    /// Container identifier.
    #[must_use]
    pub const fn uuid(&self) -> &ContainerId {
        &self.uuid
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The image manifest the container was created from.
    #[must_use]
    pub const fn image_manifest(&self) -> &ImageManifest {
        &self.image
    }

    /// The pod manifest derived at creation.
    #[must_use]
    pub const fn pod_manifest(&self) -> &PodManifest {
        &self.pod
    }

    /// Directory holding the unpacked image and stager files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.lock().state
    }

    /// Exit code of the stager, once it has exited.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Why the container failed, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<Arc<BerthError>> {
        self.lock().failure.clone()
    }

    /// Blocks until the container is in one of `targets`, it becomes
    /// terminal, or `timeout` elapses.
    pub fn wait_for(&self, targets: &[ContainerState], timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        loop {
            if targets.contains(&inner.state) {
                return WaitOutcome::Reached(inner.state);
            }
            if inner.state.is_terminal() {
                return WaitOutcome::Unreachable(inner.state);
            }
            inner = match deadline {
                None => self
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return WaitOutcome::TimedOut(inner.state);
                    }
                    self.changed
                        .wait_timeout(inner, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Blocks until the container reaches a terminal state and returns it.
    pub fn wait(&self) -> ContainerState {
        match self.wait_for(
            &[
                ContainerState::Stopped,
                ContainerState::Exited,
                ContainerState::Failed,
            ],
            None,
        ) {
            WaitOutcome::Reached(state)
            | WaitOutcome::TimedOut(state)
            | WaitOutcome::Unreachable(state) => state,
        }
    }

    /// Asks a running container to stop. Stopping an already stopping or
    /// finished container does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Config`] while the container is still starting,
    /// or an error if the stager cannot be signalled.
    pub fn stop(&self) -> Result<()> {
        let handle = {
            let mut inner = self.lock();
            match inner.state {
                ContainerState::Running => {
                    inner.stop_requested = true;
                    self.transition(&mut inner, ContainerState::Stopping);
                    inner.handle.clone()
                }
                ContainerState::New | ContainerState::Starting => {
                    return Err(BerthError::Config {
                        message: format!("container {} is still starting", self.uuid),
                    });
                }
                _ => return Ok(()),
            }
        };
        if let Some(handle) = handle {
            handle.terminate()?;
        }
        tracing::info!(id = %self.uuid, "stop requested");
        Ok(())
    }

    /// Stops the container, waits for it to finish, releases its resources
    /// and removes its directory and registry entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the stager cannot be signalled or the directory
    /// cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        loop {
            match self.stop() {
                Ok(()) => break,
                Err(BerthError::Config { .. }) => {
                    let _ = self.wait_for(&[ContainerState::Running], None);
                }
                Err(e) => return Err(e),
            }
        }
        let state = self.wait();
        self.teardown();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self);
        }
        match std::fs::remove_dir_all(&self.directory) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BerthError::io(&self.directory, e)),
        }
        tracing::info!(id = %self.uuid, %state, "container destroyed");
        Ok(())
    }

    /// Starts the bootstrap on a background thread.
    pub(crate) fn start(self: &Arc<Self>, image: Box<dyn Read + Send>) -> Result<()> {
        let container = Arc::clone(self);
        let _ = std::thread::Builder::new()
            .name(format!("berth-{}", self.uuid))
            .spawn(move || container.run(image))
            .map_err(|e| BerthError::ResourceUnavailable {
                resource: "bootstrap thread".into(),
                source: e,
            })?;
        Ok(())
    }

    /// Runs `f` with the state lock held.
    pub(crate) fn with_state_locked<T>(&self, f: impl FnOnce(ContainerState) -> T) -> T {
        f(self.lock().state)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, next: ContainerState) -> bool {
        if !inner.state.can_transition_to(next) {
            tracing::warn!(id = %self.uuid, from = %inner.state, to = %next, "illegal state transition ignored");
            return false;
        }
        tracing::debug!(id = %self.uuid, from = %inner.state, to = %next, "state transition");
        inner.state = next;
        self.changed.notify_all();
        true
    }

    fn manager(&self) -> Result<Arc<Manager>> {
        self.manager.upgrade().ok_or_else(|| BerthError::Internal {
            message: format!("manager of container {} is gone", self.uuid),
        })
    }

    fn run(self: Arc<Self>, image: Box<dyn Read + Send>) {
        match self.bootstrap(image) {
            Ok(handle) => self.supervise(&handle),
            Err(error) => self.fail(error),
        }
    }

    fn bootstrap(&self, image: Box<dyn Read + Send>) -> Result<Arc<dyn StagerHandle>> {
        {
            let mut inner = self.lock();
            if !self.transition(&mut inner, ContainerState::Starting) {
                return Err(BerthError::Internal {
                    message: format!("container {} started twice", self.uuid),
                });
            }
        }
        let manager = self.manager()?;

        let cgroup = manager.cgroup().child(self.uuid.as_str())?;
        self.lock().cgroup = Some(cgroup.clone());

        berth_image::layer::unpack(image, &self.directory)?;
        let rootfs = self.directory.join(ROOTFS_DIR);
        if !rootfs.is_dir() {
            return Err(BerthError::InvalidManifest {
                message: format!("image {} has no {ROOTFS_DIR} directory", self.image.name),
            });
        }

        let mut mounts = manager.volumes().provision(&self.uuid, &self.pod)?;
        self.lock().volumes_provisioned = true;
        for app in &self.pod.apps {
            for point in &app.app.mount_points {
                let source = manager.volume_path(&point.name)?;
                mounts.push(MountDescriptor::bind(source, &point.path, point.read_only));
            }
        }

        StagerConfig {
            uuid: self.uuid.clone(),
            rootfs,
            pod: self.pod.clone(),
            mounts,
            namespaces: self.namespaces()?,
            hostname: Some(self.name.clone()),
            primitive_root: self.directory.join("primitive"),
        }
        .write(&self.directory)?;

        let handle: Arc<dyn StagerHandle> =
            Arc::from(manager.launcher().launch(&self.directory, &cgroup)?);
        self.lock().handle = Some(Arc::clone(&handle));
        handle.wait_ready()?;
        Ok(handle)
    }

    /// Namespaces requested by the pod's apps, or the default set when no
    /// app declares any.
    fn namespaces(&self) -> Result<NamespaceSet> {
        let mut kinds = Vec::new();
        let mut declared = false;
        for app in &self.pod.apps {
            if let Some(isolator) = app.app.namespaces()? {
                declared = true;
                kinds.extend_from_slice(NamespaceSet::from_isolator(&isolator).kinds());
            }
        }
        Ok(if declared {
            NamespaceSet::from_kinds(kinds)
        } else {
            NamespaceSet::default()
        })
    }

    fn supervise(&self, handle: &Arc<dyn StagerHandle>) {
        {
            let mut inner = self.lock();
            let _ = self.transition(&mut inner, ContainerState::Running);
        }
        tracing::info!(id = %self.uuid, pid = handle.pid(), "container running");

        let code = handle.wait();
        if let Err(e) = &code {
            tracing::warn!(id = %self.uuid, error = %e, "failed to wait for stager");
        }
        self.teardown();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self);
        }

        let mut inner = self.lock();
        inner.exit_code = code.ok();
        inner.handle = None;
        let next = if inner.state == ContainerState::Stopping {
            ContainerState::Stopped
        } else {
            ContainerState::Exited
        };
        let _ = self.transition(&mut inner, next);
        tracing::info!(id = %self.uuid, state = %next, exit_code = ?inner.exit_code, "container finished");
    }

    fn fail(&self, error: BerthError) {
        tracing::error!(id = %self.uuid, error = %error, "container bootstrap failed");
        // Only a stager that reported a failed step exits on its own.
        let reported = matches!(
            &error,
            BerthError::BootstrapStepFailed { step, .. } if step != LAUNCH_STEP
        );
        let handle = self.lock().handle.take();
        if let Some(handle) = handle {
            if !reported {
                if let Err(e) = handle.kill() {
                    tracing::warn!(id = %self.uuid, error = %e, "failed to kill stager");
                }
            }
            if let Err(e) = handle.wait() {
                tracing::warn!(id = %self.uuid, error = %e, "failed to reap stager");
            }
        }
        self.teardown();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self);
        }

        let mut inner = self.lock();
        inner.failure = Some(Arc::new(error));
        let _ = self.transition(&mut inner, ContainerState::Failed);
    }

    /// Releases volumes and the child cgroup. Runs at most once; failures
    /// are logged.
    fn teardown(&self) {
        let (cgroup, provisioned) = {
            let mut inner = self.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            (inner.cgroup.take(), inner.volumes_provisioned)
        };

        if provisioned {
            match self.manager.upgrade() {
                Some(manager) => manager.volumes().deprovision(&self.uuid, &self.pod),
                None => tracing::warn!(id = %self.uuid, "manager gone, volumes left in place"),
            }
        }
        if let Some(cgroup) = cgroup {
            if let Err(e) = cgroup.destroy() {
                tracing::warn!(id = %self.uuid, error = %e, "failed to remove cgroup");
            }
        }
        tracing::debug!(id = %self.uuid, "container resources released");
    }
}
