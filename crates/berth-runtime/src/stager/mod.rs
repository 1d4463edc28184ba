//! The bootstrap state machine.
//!
//! A container is brought up by running a fixed list of [`Step`]s against a
//! [`Bootstrap`] context. The list is data; the context supplies the step
//! bodies, so the real stager ([`StagerSetup`]) and test doubles share the
//! same sequencing and failure handling.
//!
//! On the first failing step the sequence halts, [`Bootstrap::stop`] is
//! called once, and the step's error is returned unchanged.

pub mod setup;

use std::fmt;

use berth_common::error::{BerthError, Result};
use thiserror::Error;

use crate::launch::Readiness;

pub use setup::{StagerConfig, StagerSetup, execute};

/// One bootstrap step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Install shutdown signal handling for the stager itself.
    SignalHandling,
    /// Read the stager configuration and pod manifest.
    ReadManifest,
    /// Persist the initial state file.
    WriteState,
    /// Populate per-app tracking.
    PopulateState,
    /// Create the runtime primitive factory.
    CreateFactory,
    /// Start the primitive's init process.
    LaunchInit,
    /// Apply volume mounts.
    ContainerFilesystem,
    /// Start every app process.
    CreateContainers,
    /// Record the running state.
    MarkRunning,
}

impl Step {
    /// Every step, in execution order.
    pub const ALL: [Self; 9] = [
        Self::SignalHandling,
        Self::ReadManifest,
        Self::WriteState,
        Self::PopulateState,
        Self::CreateFactory,
        Self::LaunchInit,
        Self::ContainerFilesystem,
        Self::CreateContainers,
        Self::MarkRunning,
    ];

    /// Name used in logs and readiness reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SignalHandling => "signal-handling",
            Self::ReadManifest => "read-manifest",
            Self::WriteState => "write-state",
            Self::PopulateState => "populate-state",
            Self::CreateFactory => "create-factory",
            Self::LaunchInit => "launch-init",
            Self::ContainerFilesystem => "container-filesystem",
            Self::CreateContainers => "create-containers",
            Self::MarkRunning => "mark-running",
        }
    }

    fn run(self, context: &mut dyn Bootstrap) -> Result<()> {
        match self {
            Self::SignalHandling => context.install_signal_handling(),
            Self::ReadManifest => context.read_manifest(),
            Self::WriteState => context.write_state(),
            Self::PopulateState => context.populate_state(),
            Self::CreateFactory => context.create_factory(),
            Self::LaunchInit => context.launch_init(),
            Self::ContainerFilesystem => context.container_filesystem(),
            Self::CreateContainers => context.create_containers(),
            Self::MarkRunning => context.mark_running(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The step bodies of a bootstrap.
pub trait Bootstrap {
    /// Installs shutdown signal handling.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be installed.
    fn install_signal_handling(&mut self) -> Result<()>;

    /// Reads the configuration and manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if they cannot be read or parsed.
    fn read_manifest(&mut self) -> Result<()>;

    /// Persists the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn write_state(&mut self) -> Result<()>;

    /// Populates per-app tracking.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracking cannot be persisted.
    fn populate_state(&mut self) -> Result<()>;

    /// Creates the primitive factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory cannot be created.
    fn create_factory(&mut self) -> Result<()>;

    /// Starts the primitive's init process.
    ///
    /// # Errors
    ///
    /// Returns an error if init fails to start.
    fn launch_init(&mut self) -> Result<()>;

    /// Applies the container's mounts.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount fails.
    fn container_filesystem(&mut self) -> Result<()>;

    /// Starts every app process.
    ///
    /// # Errors
    ///
    /// Returns an error if a process cannot be started.
    fn create_containers(&mut self) -> Result<()>;

    /// Records that every step completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    fn mark_running(&mut self) -> Result<()>;

    /// Reports the bootstrap outcome to the waiting supervisor.
    fn signal_ready(&mut self, report: &Readiness);

    /// Releases everything acquired so far. Must be a no-op when nothing
    /// was acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource could not be released.
    fn stop(&mut self) -> Result<()>;
}

/// The step that failed and its error.
#[derive(Debug, Error)]
#[error("bootstrap step {step} failed: {error}")]
pub struct StepFailure {
    /// The failing step.
    pub step: Step,
    /// The step's own error.
    #[source]
    pub error: BerthError,
}

impl From<StepFailure> for BerthError {
    fn from(failure: StepFailure) -> Self {
        Self::BootstrapStepFailed {
            step: failure.step.name().into(),
            message: failure.error.to_string(),
        }
    }
}

/// Runs every step in order.
///
/// # Errors
///
/// Returns the first failing step with its error, after
/// [`Bootstrap::stop`] has been called.
pub fn run(context: &mut dyn Bootstrap) -> std::result::Result<(), StepFailure> {
    for step in Step::ALL {
        tracing::debug!(%step, "bootstrap step");
        if let Err(error) = step.run(context) {
            tracing::error!(%step, error = %error, "bootstrap step failed");
            if let Err(e) = context.stop() {
                tracing::warn!(error = %e, "bootstrap rollback incomplete");
            }
            context.signal_ready(&Readiness::Failed {
                step: step.name().into(),
                message: error.to_string(),
            });
            return Err(StepFailure { step, error });
        }
    }
    tracing::info!("bootstrap complete");
    context.signal_ready(&Readiness::Ready);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tracks progress the way the real stager does, failing at `fail_at`.
    #[derive(Default)]
    struct Recorder {
        fail_at: Option<Step>,
        state: Option<&'static str>,
        acquired: bool,
        stops: usize,
        report: Option<Readiness>,
    }

    impl Recorder {
        fn failing_at(step: Step) -> Self {
            Self {
                fail_at: Some(step),
                ..Self::default()
            }
        }

        fn step(&mut self, step: Step, state: Option<&'static str>) -> Result<()> {
            if self.fail_at == Some(step) {
                return Err(BerthError::Internal {
                    message: format!("injected failure in {step}"),
                });
            }
            if let Some(state) = state {
                self.state = Some(state);
            }
            Ok(())
        }
    }

    impl Bootstrap for Recorder {
        fn install_signal_handling(&mut self) -> Result<()> {
            self.step(Step::SignalHandling, None)
        }

        fn read_manifest(&mut self) -> Result<()> {
            self.step(Step::ReadManifest, None)
        }

        fn write_state(&mut self) -> Result<()> {
            self.step(Step::WriteState, Some("setup"))
        }

        fn populate_state(&mut self) -> Result<()> {
            self.step(Step::PopulateState, Some("populated"))
        }

        fn create_factory(&mut self) -> Result<()> {
            self.step(Step::CreateFactory, None)
        }

        fn launch_init(&mut self) -> Result<()> {
            self.step(Step::LaunchInit, None)?;
            self.acquired = true;
            Ok(())
        }

        fn container_filesystem(&mut self) -> Result<()> {
            self.step(Step::ContainerFilesystem, None)
        }

        fn create_containers(&mut self) -> Result<()> {
            self.step(Step::CreateContainers, None)
        }

        fn mark_running(&mut self) -> Result<()> {
            self.step(Step::MarkRunning, Some("running"))
        }

        fn signal_ready(&mut self, report: &Readiness) {
            self.report = Some(report.clone());
        }

        fn stop(&mut self) -> Result<()> {
            self.stops += 1;
            self.acquired = false;
            Ok(())
        }
    }

    #[test]
    fn filesystem_failure_leaves_state_populated_and_stops_once() {
        let mut recorder = Recorder::failing_at(Step::ContainerFilesystem);
        let failure = run(&mut recorder).expect_err("must fail");

        assert_eq!(failure.step, Step::ContainerFilesystem);
        assert!(matches!(failure.error, BerthError::Internal { .. }));
        assert_eq!(recorder.state, Some("populated"));
        assert_eq!(recorder.stops, 1);
        assert!(!recorder.acquired);
        assert!(matches!(
            recorder.report,
            Some(Readiness::Failed { ref step, .. }) if step == "container-filesystem"
        ));
    }

    #[test]
    fn successful_bootstrap_reaches_running_without_stop() {
        let mut recorder = Recorder::default();
        run(&mut recorder).expect("bootstrap");

        assert_eq!(recorder.state, Some("running"));
        assert_eq!(recorder.stops, 0);
        assert_eq!(recorder.report, Some(Readiness::Ready));
    }

    #[test]
    fn early_failure_stops_with_nothing_acquired() {
        let mut recorder = Recorder::failing_at(Step::ReadManifest);
        let failure = run(&mut recorder).expect_err("must fail");

        assert_eq!(failure.step, Step::ReadManifest);
        assert_eq!(recorder.state, None);
        assert_eq!(recorder.stops, 1);
    }

    #[test]
    fn step_failure_converts_to_bootstrap_error() {
        let failure = StepFailure {
            step: Step::LaunchInit,
            error: BerthError::Internal {
                message: "no init".into(),
            },
        };
        let err = BerthError::from(failure);
        assert_eq!(
            err.to_string(),
            "bootstrap step launch-init failed: internal error: no init"
        );
    }
}
