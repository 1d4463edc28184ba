//! Launching the stager process for a container.
//!
//! The stager reports the outcome of its bootstrap sequence with a single
//! line on descriptor 3 (see [`Readiness`]). The host blocks on that line
//! before marking the container running.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use berth_common::constants::{READY_FD, STAGER_LOG_FILE};
use berth_common::error::{BerthError, Result};
use berth_core::cgroup::Cgroup;
use berth_core::primitive::exit_code;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// Step name reported when the stager dies before reporting readiness.
pub const LAUNCH_STEP: &str = "launch";

/// Starts stager processes.
pub trait StagerLauncher: Send + Sync {
    /// Starts the stager for the container directory `directory`, placing it
    /// in `cgroup` before it runs any code.
    ///
    /// # Errors
    ///
    /// Returns an error if the stager cannot be started.
    fn launch(&self, directory: &Path, cgroup: &Cgroup) -> Result<Box<dyn StagerHandle>>;
}

/// A running stager.
pub trait StagerHandle: Send + Sync {
    /// Host PID of the stager.
    fn pid(&self) -> u32;

    /// Blocks until the stager reports the outcome of its bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::BootstrapStepFailed`] if the bootstrap failed
    /// or the stager exited without reporting.
    fn wait_ready(&self) -> Result<()>;

    /// Blocks until the stager exits and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    fn wait(&self) -> Result<i32>;

    /// Asks the stager to shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn terminate(&self) -> Result<()>;

    /// Kills the stager.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn kill(&self) -> Result<()>;
}

/// Bootstrap outcome as written on the readiness descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every step completed.
    Ready,
    /// The named step failed.
    Failed {
        /// Step name.
        step: String,
        /// The step's error message.
        message: String,
    },
}

impl Readiness {
    /// Parses one readiness line. A line that is neither `ok` nor
    /// `error <step> <message>` is reported as a failed launch.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        if line == "ok" {
            return Self::Ready;
        }
        match line.strip_prefix("error ") {
            Some(rest) => {
                let (step, message) = rest.split_once(' ').unwrap_or((rest, ""));
                Self::Failed {
                    step: step.into(),
                    message: message.into(),
                }
            }
            None => Self::Failed {
                step: LAUNCH_STEP.into(),
                message: format!("unexpected readiness report {line:?}"),
            },
        }
    }

    /// Converts the report into a result.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::BootstrapStepFailed`] for a failure report.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ready => Ok(()),
            Self::Failed { step, message } => Err(BerthError::BootstrapStepFailed { step, message }),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ok"),
            Self::Failed { step, message } => {
                write!(f, "error {step} {}", message.replace('\n', " "))
            }
        }
    }
}

/// Runs `<binary> stager <directory>` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    /// Creates a launcher for the given stager binary.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl StagerLauncher for ProcessLauncher {
    fn launch(&self, directory: &Path, cgroup: &Cgroup) -> Result<Box<dyn StagerHandle>> {
        let log_path = directory.join(STAGER_LOG_FILE);
        let log = File::create(&log_path).map_err(|e| BerthError::io(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| BerthError::io(&log_path, e))?;

        let procs_path = cgroup.path().join("cgroup.procs");
        let procs = std::fs::OpenOptions::new()
            .write(true)
            .open(&procs_path)
            .map_err(|e| BerthError::io(&procs_path, e))?;

        let (ready_read, ready_write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| BerthError::io("ready pipe", e.into()))?;
        let write_fd = ready_write.as_raw_fd();
        let procs_fd = procs.as_raw_fd();

        let mut cmd = Command::new(&self.binary);
        let _ = cmd
            .arg("stager")
            .arg(directory)
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // SAFETY: the hook only issues async-signal-safe syscalls on
        // descriptors opened before the fork.
        unsafe {
            let _ = cmd.pre_exec(move || {
                if libc::write(procs_fd, b"0".as_ptr().cast(), 1) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if write_fd == READY_FD {
                    if libc::fcntl(write_fd, libc::F_SETFD, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(write_fd, READY_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| BerthError::io(&self.binary, e))?;
        drop(ready_write);
        drop(procs);

        let pid = child.id();
        tracing::info!(pid, directory = %directory.display(), cgroup = %cgroup.path().display(), "stager launched");
        Ok(Box::new(ProcessHandle {
            pid,
            child: Mutex::new(child),
            ready: Mutex::new(Some(File::from(ready_read))),
            exited: AtomicBool::new(false),
        }))
    }
}

/// Handle to a stager started by [`ProcessLauncher`].
#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    child: Mutex<Child>,
    ready: Mutex<Option<File>>,
    exited: AtomicBool,
}

impl ProcessHandle {
    fn signal(&self, signal: Signal) -> Result<()> {
        if self.exited.load(Ordering::Acquire) {
            return Ok(());
        }
        let pid = i32::try_from(self.pid).map_err(|_| BerthError::Internal {
            message: format!("pid {} out of range", self.pid),
        })?;
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(BerthError::io(format!("pid {}", self.pid), e.into())),
        }
    }
}

impl StagerHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn wait_ready(&self) -> Result<()> {
        let Some(file) = self.ready.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Err(BerthError::Internal {
                message: "stager readiness already consumed".into(),
            });
        };
        read_readiness(file)
    }

    fn wait(&self) -> Result<i32> {
        let status = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .wait()
            .map_err(|e| BerthError::io(format!("pid {}", self.pid), e))?;
        self.exited.store(true, Ordering::Release);
        Ok(exit_code(status))
    }

    fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

/// Reads one readiness report from `reader`. End of stream before a full
/// line means the stager died during bootstrap.
///
/// # Errors
///
/// Returns [`BerthError::BootstrapStepFailed`] unless the report is `ok`.
pub fn read_readiness(reader: impl std::io::Read) -> Result<()> {
    let mut line = String::new();
    let read = BufReader::new(reader)
        .read_line(&mut line)
        .map_err(|e| BerthError::io("ready pipe", e))?;
    if read == 0 {
        return Err(BerthError::BootstrapStepFailed {
            step: LAUNCH_STEP.into(),
            message: "stager exited before reporting readiness".into(),
        });
    }
    Readiness::parse(&line).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_success_and_failures() {
        assert_eq!(Readiness::parse("ok\n"), Readiness::Ready);
        assert_eq!(
            Readiness::parse("error container-filesystem mount /volumes/data: EPERM\n"),
            Readiness::Failed {
                step: "container-filesystem".into(),
                message: "mount /volumes/data: EPERM".into(),
            }
        );
        assert!(matches!(
            Readiness::parse("hello"),
            Readiness::Failed { step, .. } if step == LAUNCH_STEP
        ));
    }

    #[test]
    fn failure_line_stays_on_one_line() {
        let report = Readiness::Failed {
            step: "read-manifest".into(),
            message: "bad\njson".into(),
        };
        let line = report.to_string();
        assert_eq!(line, "error read-manifest bad json");
        assert_eq!(
            Readiness::parse(&line),
            Readiness::Failed {
                step: "read-manifest".into(),
                message: "bad json".into(),
            }
        );
    }

    #[test]
    fn read_readiness_treats_eof_as_launch_failure() {
        let err = read_readiness(&b""[..]).expect_err("eof");
        assert!(matches!(
            err,
            BerthError::BootstrapStepFailed { ref step, .. } if step == LAUNCH_STEP
        ));
        read_readiness(&b"ok\n"[..]).expect("ready");
    }

    #[test]
    fn launched_process_reports_on_fd_three() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cgroup_dir = dir.path().join("cgroup");
        std::fs::create_dir_all(&cgroup_dir).expect("cgroup dir");
        let procs = cgroup_dir.join("cgroup.procs");
        std::fs::write(&procs, "").expect("procs");
        let cgroup = Cgroup::new(dir.path(), "cgroup").expect("cgroup");

        // `sh stager <dir>` runs the script named `stager` in the directory.
        std::fs::write(
            dir.path().join("stager"),
            "echo \"$1\" >&2\necho ok >&3\nexit 4\n",
        )
        .expect("script");

        let handle = ProcessLauncher::new("/bin/sh")
            .launch(dir.path(), &cgroup)
            .expect("launch");
        handle.wait_ready().expect("ready");
        assert_eq!(handle.wait().expect("wait"), 4);
        handle.terminate().expect("signal after exit is a no-op");

        assert_eq!(std::fs::read_to_string(procs).expect("procs"), "0");
        let log = std::fs::read_to_string(dir.path().join(STAGER_LOG_FILE)).expect("log");
        assert_eq!(log.trim(), dir.path().display().to_string());
    }
}
