//! The stager: bootstraps a container from its directory and supervises
//! its apps.
//!
//! The host writes `stager.json` into the container directory and starts
//! `berth-stager stager <dir>`. The stager runs the bootstrap steps, reports
//! readiness on descriptor 3, then waits for its apps to exit or for a
//! shutdown signal.

use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use berth_common::constants::{READY_FD, STAGER_CONFIG_FILE, STAGER_STATE_FILE};
use berth_common::error::{BerthError, Result};
use berth_common::manifest::PodManifest;
use berth_common::types::ContainerId;
use berth_core::filesystem::MountDescriptor;
use berth_core::namespace::NamespaceSet;
use berth_core::primitive::{ContainerConfig, Factory, LinuxFactory, PrimitiveContainer};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use super::{Bootstrap, run};
use crate::launch::Readiness;
use crate::logs;
use crate::run::app_process;
use crate::state::{AppState, StagerPhase, StagerState, save_state};

/// How long apps get to exit after a shutdown request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the stager needs, written by the host before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagerConfig {
    /// Container identifier, also the primitive context id.
    pub uuid: ContainerId,
    /// Unpacked root filesystem.
    pub rootfs: PathBuf,
    /// The pod to run.
    pub pod: PodManifest,
    /// Volume and mount point binds.
    pub mounts: Vec<MountDescriptor>,
    /// Namespaces created for the pod.
    pub namespaces: NamespaceSet,
    /// Hostname inside a UTS namespace.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Root directory of the primitive factory.
    pub primitive_root: PathBuf,
}

impl StagerConfig {
    /// Reads `stager.json` from `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(directory: &Path) -> Result<Self> {
        let path = directory.join(STAGER_CONFIG_FILE);
        let content = std::fs::read(&path).map_err(|e| BerthError::io(&path, e))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Writes `stager.json` into `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, directory: &Path) -> Result<()> {
        let path = directory.join(STAGER_CONFIG_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?).map_err(|e| BerthError::io(path, e))
    }
}

/// Notifications received while supervising.
#[derive(Debug)]
enum Event {
    Shutdown,
    Exited { app: String, code: i32 },
}

/// The real bootstrap context.
pub struct StagerSetup {
    directory: PathBuf,
    ready: Option<File>,
    handle_signals: bool,
    events: (Sender<Event>, Receiver<Event>),
    config: Option<StagerConfig>,
    state: Option<StagerState>,
    factory: Option<Box<dyn Factory>>,
    container: Option<Box<dyn PrimitiveContainer>>,
}

impl std::fmt::Debug for StagerSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagerSetup")
            .field("directory", &self.directory)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl StagerSetup {
    /// Creates a context for `directory`, reporting readiness on `ready`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, ready: Option<File>) -> Self {
        Self {
            directory: directory.into(),
            ready,
            handle_signals: true,
            events: mpsc::channel(),
            config: None,
            state: None,
            factory: None,
            container: None,
        }
    }

    /// Uses `factory` instead of creating a [`LinuxFactory`].
    #[must_use]
    pub fn with_factory(mut self, factory: Box<dyn Factory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Leaves process signal handlers untouched.
    #[must_use]
    pub const fn without_signal_handling(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Last persisted phase, if any state was written.
    #[must_use]
    pub fn phase(&self) -> Option<StagerPhase> {
        self.state.as_ref().map(|s| s.phase)
    }

    fn config(&self) -> Result<&StagerConfig> {
        self.config.as_ref().ok_or_else(|| out_of_order("stager configuration"))
    }

    fn state_mut(&mut self) -> Result<&mut StagerState> {
        self.state.as_mut().ok_or_else(|| out_of_order("stager state"))
    }

    fn save(&mut self) -> Result<()> {
        let path = self.directory.join(STAGER_STATE_FILE);
        save_state(&path, self.state_mut()?)
    }

    fn set_phase(&mut self, phase: StagerPhase) -> Result<()> {
        self.state_mut()?.phase = phase;
        self.save()
    }

    /// Waits for every app to exit, or for a shutdown signal, then stops
    /// the container. Returns the first non-zero app exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    pub fn supervise(&mut self) -> Result<i32> {
        let mut deadline: Option<Instant> = None;
        while self.has_live_apps() {
            let event = match deadline {
                None => self.events.1.recv().ok(),
                Some(at) => match self
                    .events
                    .1
                    .recv_timeout(at.saturating_duration_since(Instant::now()))
                {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
                },
            };
            match event {
                Some(Event::Exited { app, code }) => {
                    tracing::info!(app, code, "app exited");
                    if let Some(tracked) = self.state_mut()?.apps.get_mut(&app) {
                        tracked.exit_code = Some(code);
                    }
                    self.save()?;
                }
                Some(Event::Shutdown) if deadline.is_none() => {
                    tracing::info!("shutdown requested");
                    self.set_phase(StagerPhase::ShuttingDown)?;
                    self.signal_apps(Signal::SIGTERM);
                    deadline = Some(Instant::now() + SHUTDOWN_TIMEOUT);
                }
                Some(Event::Shutdown) => {}
                None => break,
            }
        }

        if self.phase() != Some(StagerPhase::ShuttingDown) {
            self.set_phase(StagerPhase::ShuttingDown)?;
        }
        self.stop()?;
        Ok(self.exit_code())
    }

    fn has_live_apps(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.apps.values().any(|a| a.pid.is_some() && a.exit_code.is_none()))
    }

    fn exit_code(&self) -> i32 {
        self.state
            .as_ref()
            .and_then(|s| s.apps.values().filter_map(|a| a.exit_code).find(|c| *c != 0))
            .unwrap_or(0)
    }

    fn signal_apps(&self, signal: Signal) {
        let Some(state) = &self.state else {
            return;
        };
        for (app, tracked) in &state.apps {
            let (Some(pid), None) = (tracked.pid, tracked.exit_code) else {
                continue;
            };
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match kill(Pid::from_raw(raw), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(app, pid, error = %e, "failed to signal app"),
            }
        }
    }
}

impl Bootstrap for StagerSetup {
    fn install_signal_handling(&mut self) -> Result<()> {
        if !self.handle_signals {
            return Ok(());
        }
        let events = self.events.0.clone();
        ctrlc::set_handler(move || {
            let _ = events.send(Event::Shutdown);
        })
        .map_err(|e| BerthError::Internal {
            message: format!("failed to install signal handler: {e}"),
        })
    }

    fn read_manifest(&mut self) -> Result<()> {
        let config = StagerConfig::load(&self.directory)?;
        if config.pod.apps.is_empty() {
            return Err(BerthError::InvalidManifest {
                message: "pod has no apps".into(),
            });
        }
        tracing::info!(id = %config.uuid, apps = config.pod.apps.len(), "stager configuration loaded");
        self.config = Some(config);
        Ok(())
    }

    fn write_state(&mut self) -> Result<()> {
        let uuid = self.config()?.uuid.clone();
        self.state = Some(StagerState::new(uuid));
        self.save()
    }

    fn populate_state(&mut self) -> Result<()> {
        let names: Vec<String> = self.config()?.pod.apps.iter().map(|a| a.name.clone()).collect();
        let state = self.state_mut()?;
        for name in names {
            let _ = state.apps.insert(name, AppState::default());
        }
        state.phase = StagerPhase::Populated;
        self.save()
    }

    fn create_factory(&mut self) -> Result<()> {
        if self.factory.is_none() {
            let root = self.config()?.primitive_root.clone();
            self.factory = Some(Box::new(LinuxFactory::new(root)?));
        }
        Ok(())
    }

    fn launch_init(&mut self) -> Result<()> {
        let config = self.config()?;
        let factory = self.factory.as_ref().ok_or_else(|| out_of_order("primitive factory"))?;
        let container = factory.create(
            config.uuid.as_str(),
            &ContainerConfig {
                rootfs: config.rootfs.clone(),
                namespaces: config.namespaces.clone(),
                hostname: config.hostname.clone(),
            },
        )?;
        self.container = Some(container);
        Ok(())
    }

    fn container_filesystem(&mut self) -> Result<()> {
        let mounts = self.config()?.mounts.clone();
        self.container
            .as_mut()
            .ok_or_else(|| out_of_order("primitive container"))?
            .apply_mounts(&mounts)
    }

    fn create_containers(&mut self) -> Result<()> {
        let apps = self.config()?.pod.apps.clone();
        for runtime_app in apps {
            let log = logs::open_app_log(&self.directory, &runtime_app.name)?;
            let log_err = log
                .try_clone()
                .map_err(|e| BerthError::io(logs::log_path(&self.directory, &runtime_app.name), e))?;

            let mut spec = app_process(Some(&runtime_app.app), &[]);
            spec.stdin = Stdio::null();
            spec.stdout = Stdio::from(log);
            spec.stderr = Stdio::from(log_err);

            let mut handle = self
                .container
                .as_ref()
                .ok_or_else(|| out_of_order("primitive container"))?
                .start(spec)?;
            let pid = handle.pid();
            if let Some(tracked) = self.state_mut()?.apps.get_mut(&runtime_app.name) {
                tracked.pid = Some(pid);
            }
            self.save()?;

            let events = self.events.0.clone();
            let app = runtime_app.name.clone();
            let _ = std::thread::Builder::new()
                .name(format!("berth-wait-{app}"))
                .spawn(move || {
                    let code = handle.wait().unwrap_or_else(|e| {
                        tracing::warn!(app, error = %e, "failed to wait for app");
                        1
                    });
                    let _ = events.send(Event::Exited { app, code });
                })
                .map_err(|e| BerthError::io("app waiter", e))?;
            tracing::info!(app = %runtime_app.name, pid, "app started");
        }
        Ok(())
    }

    fn mark_running(&mut self) -> Result<()> {
        self.set_phase(StagerPhase::Running)
    }

    fn signal_ready(&mut self, report: &Readiness) {
        let Some(mut ready) = self.ready.take() else {
            tracing::debug!(%report, "no readiness descriptor");
            return;
        };
        if let Err(e) = writeln!(ready, "{report}") {
            tracing::warn!(error = %e, "failed to report readiness");
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.signal_apps(Signal::SIGKILL);
        if let Some(mut container) = self.container.take() {
            container.destroy()?;
        }
        Ok(())
    }
}

fn out_of_order(what: &str) -> BerthError {
    BerthError::Internal {
        message: format!("{what} used before it was set up"),
    }
}

/// Takes ownership of the readiness descriptor inherited from the host.
/// Returns `None` when the stager was started without one.
#[must_use]
pub fn inherited_ready_fd() -> Option<File> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(READY_FD, libc::F_GETFD) } < 0 {
        return None;
    }
    // SAFETY: the descriptor is open and nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(READY_FD) };
    // Apps must not inherit it.
    // SAFETY: F_SETFD on a descriptor we own.
    let _ = unsafe { libc::fcntl(READY_FD, libc::F_SETFD, libc::FD_CLOEXEC) };
    Some(File::from(fd))
}

/// Runs the stager for `directory`: bootstrap, then supervision.
/// Returns the exit code the stager process should exit with.
///
/// # Errors
///
/// Returns [`BerthError::BootstrapStepFailed`] if a step failed, or an
/// error from supervision.
pub fn execute(directory: &Path) -> Result<i32> {
    let mut setup = StagerSetup::new(directory, inherited_ready_fd());
    run(&mut setup)?;
    setup.supervise()
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::process::Command;
    use std::sync::{Arc, Mutex};

    use berth_common::manifest::{App, RuntimeApp, RuntimeImage};
    use berth_core::primitive::{ProcessHandle, ProcessSpec};

    use super::*;
    use crate::stager::Step;
    use crate::state::load_state;

    /// Runs processes on the host, recording the mounts it was given.
    struct HostFactory {
        mounts: Arc<Mutex<Vec<MountDescriptor>>>,
        fail_mounts: bool,
        destroyed: Arc<Mutex<usize>>,
    }

    struct HostContainer {
        id: String,
        mounts: Arc<Mutex<Vec<MountDescriptor>>>,
        fail_mounts: bool,
        destroyed: Arc<Mutex<usize>>,
    }

    impl Factory for HostFactory {
        fn create(&self, id: &str, _config: &ContainerConfig) -> Result<Box<dyn PrimitiveContainer>> {
            Ok(Box::new(HostContainer {
                id: id.into(),
                mounts: Arc::clone(&self.mounts),
                fail_mounts: self.fail_mounts,
                destroyed: Arc::clone(&self.destroyed),
            }))
        }

        fn load(&self, id: &str) -> Result<Box<dyn PrimitiveContainer>> {
            Err(BerthError::NotFound {
                kind: "container context",
                id: id.into(),
            })
        }
    }

    impl PrimitiveContainer for HostContainer {
        fn id(&self) -> &str {
            &self.id
        }

        fn apply_mounts(&mut self, mounts: &[MountDescriptor]) -> Result<()> {
            if self.fail_mounts {
                return Err(BerthError::Internal {
                    message: "mount refused".into(),
                });
            }
            self.mounts.lock().expect("lock").extend_from_slice(mounts);
            Ok(())
        }

        fn start(&self, process: ProcessSpec) -> Result<ProcessHandle> {
            let child = Command::new(&process.args[0])
                .args(&process.args[1..])
                .stdin(process.stdin)
                .stdout(process.stdout)
                .stderr(process.stderr)
                .spawn()
                .expect("spawn");
            Ok(ProcessHandle::new(child, None))
        }

        fn destroy(&mut self) -> Result<()> {
            *self.destroyed.lock().expect("lock") += 1;
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        mounts: Arc<Mutex<Vec<MountDescriptor>>>,
        destroyed: Arc<Mutex<usize>>,
    }

    impl Fixture {
        fn new(apps: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let config = StagerConfig {
                uuid: ContainerId::new("c1"),
                rootfs: dir.path().join("rootfs"),
                pod: PodManifest {
                    apps: apps
                        .iter()
                        .map(|(name, script)| RuntimeApp {
                            name: (*name).into(),
                            app: App {
                                exec: vec!["/bin/sh".into(), "-c".into(), (*script).into()],
                                ..App::default()
                            },
                            image: RuntimeImage {
                                name: format!("example.com/{name}"),
                                labels: Vec::new(),
                            },
                        })
                        .collect(),
                    volumes: Vec::new(),
                },
                mounts: vec![MountDescriptor::bind("/srv/data", "/volumes/data", false)],
                namespaces: NamespaceSet::default(),
                hostname: None,
                primitive_root: dir.path().join("primitive"),
            };
            config.write(dir.path()).expect("write config");
            Self {
                dir,
                mounts: Arc::default(),
                destroyed: Arc::default(),
            }
        }

        fn setup(&self, fail_mounts: bool, ready: Option<File>) -> StagerSetup {
            StagerSetup::new(self.dir.path(), ready)
                .without_signal_handling()
                .with_factory(Box::new(HostFactory {
                    mounts: Arc::clone(&self.mounts),
                    fail_mounts,
                    destroyed: Arc::clone(&self.destroyed),
                }))
        }

        fn destroyed(&self) -> usize {
            *self.destroyed.lock().expect("lock")
        }
    }

    #[test]
    fn bootstrap_runs_apps_and_reports_first_failure_code() {
        let fixture = Fixture::new(&[("ok", "echo hello"), ("bad", "exit 3")]);
        let report = fixture.dir.path().join("ready");
        let mut setup = fixture.setup(false, Some(File::create(&report).expect("ready file")));

        run(&mut setup).expect("bootstrap");
        assert_eq!(setup.phase(), Some(StagerPhase::Running));
        assert_eq!(fixture.mounts.lock().expect("lock").len(), 1);
        assert_eq!(std::fs::read_to_string(&report).expect("report"), "ok\n");

        assert_eq!(setup.supervise().expect("supervise"), 3);
        assert_eq!(fixture.destroyed(), 1);

        let state = load_state(&fixture.dir.path().join(STAGER_STATE_FILE)).expect("state");
        assert_eq!(state.phase, StagerPhase::ShuttingDown);
        assert_eq!(state.apps["ok"].exit_code, Some(0));
        assert_eq!(state.apps["bad"].exit_code, Some(3));

        let mut output = String::new();
        let _ = File::open(logs::log_path(fixture.dir.path(), "ok"))
            .expect("log")
            .read_to_string(&mut output)
            .expect("read log");
        assert_eq!(output, "hello\n");
    }

    #[test]
    fn mount_failure_persists_populated_state_and_reports_step() {
        let fixture = Fixture::new(&[("web", "sleep 5")]);
        let report = fixture.dir.path().join("ready");
        let mut setup = fixture.setup(true, Some(File::create(&report).expect("ready file")));

        let failure = run(&mut setup).expect_err("must fail");
        assert_eq!(failure.step, Step::ContainerFilesystem);
        assert_eq!(setup.phase(), Some(StagerPhase::Populated));
        assert_eq!(fixture.destroyed(), 1);

        let state = load_state(&fixture.dir.path().join(STAGER_STATE_FILE)).expect("state");
        assert_eq!(state.phase, StagerPhase::Populated);
        assert_eq!(state.apps["web"].pid, None);

        let line = std::fs::read_to_string(&report).expect("report");
        assert!(line.starts_with("error container-filesystem "), "{line}");
    }

    #[test]
    fn missing_configuration_fails_before_any_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut setup = StagerSetup::new(dir.path(), None).without_signal_handling();
        let failure = run(&mut setup).expect_err("must fail");
        assert_eq!(failure.step, Step::ReadManifest);
        assert_eq!(setup.phase(), None);
        assert!(!dir.path().join(STAGER_STATE_FILE).exists());
    }
}
