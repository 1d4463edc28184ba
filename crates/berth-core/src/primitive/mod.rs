//! The container runtime primitive.
//!
//! A [`Factory`] is bound to a root directory and creates or reloads
//! container contexts. A context is held by an init process that owns the
//! container's namespaces; processes are started inside it on demand.
//!
//! The stager only talks to these traits, so the kernel-facing
//! implementation ([`LinuxFactory`]) can be swapped for a test double.

pub mod linux;

use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};

use berth_common::error::{BerthError, Result};

use crate::filesystem::MountDescriptor;
use crate::namespace::NamespaceSet;

pub use linux::{LinuxFactory, start_initialization};

/// Settings for a new container context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Root filesystem processes are confined to.
    pub rootfs: PathBuf,
    /// Namespaces the context creates.
    pub namespaces: NamespaceSet,
    /// Hostname set when a UTS namespace is created.
    pub hostname: Option<String>,
}

/// A process to start inside a container context.
#[derive(Debug)]
pub struct ProcessSpec {
    /// Working directory inside the container. Empty means `/`.
    pub cwd: String,
    /// User name or numeric uid. Empty means root.
    pub user: String,
    /// Group name or numeric gid. Empty means the user's primary group.
    pub group: String,
    /// Argument vector; the first entry is the program.
    pub args: Vec<String>,
    /// Environment as `NAME=value` entries.
    pub env: Vec<String>,
    /// Standard input binding.
    pub stdin: Stdio,
    /// Standard output binding.
    pub stdout: Stdio,
    /// Standard error binding.
    pub stderr: Stdio,
    /// Allocate a pseudo-terminal instead of using the stdio bindings.
    pub tty: bool,
}

impl ProcessSpec {
    /// A process running `args` as root in `/`, inheriting stdio.
    #[must_use]
    pub fn new(args: Vec<String>) -> Self {
        Self {
            cwd: "/".into(),
            user: String::new(),
            group: String::new(),
            args,
            env: Vec::new(),
            stdin: Stdio::inherit(),
            stdout: Stdio::inherit(),
            stderr: Stdio::inherit(),
            tty: false,
        }
    }
}

/// A process started by [`PrimitiveContainer::start`].
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    console: Option<File>,
}

impl ProcessHandle {
    /// Wraps a spawned child and, for tty processes, the console master.
    #[must_use]
    pub const fn new(child: Child, console: Option<File>) -> Self {
        Self { child, console }
    }

    /// Host PID of the process.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Takes the pseudo-terminal master, if one was allocated.
    pub const fn take_console(&mut self) -> Option<File> {
        self.console.take()
    }

    /// Waits for the process to exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the child fails.
    pub fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().map_err(|e| BerthError::Io {
            path: format!("pid {}", self.child.id()).into(),
            source: e,
        })?;
        Ok(exit_code(status))
    }
}

/// Extracts a numeric exit code, mapping death by signal to `128 + signo`.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// Creates and reloads container contexts under a root directory.
pub trait Factory: Send + Sync {
    /// Creates the context `id` by launching its init process.
    ///
    /// # Errors
    ///
    /// Returns an error if the init process cannot be started.
    fn create(&self, id: &str, config: &ContainerConfig) -> Result<Box<dyn PrimitiveContainer>>;

    /// Loads a context previously created by [`Factory::create`].
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::NotFound`] if no live context exists.
    fn load(&self, id: &str) -> Result<Box<dyn PrimitiveContainer>>;
}

/// A live container context.
pub trait PrimitiveContainer: Send {
    /// Context identifier.
    fn id(&self) -> &str;

    /// Applies mounts inside the context's mount namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if any mount fails.
    fn apply_mounts(&mut self, mounts: &[MountDescriptor]) -> Result<()>;

    /// Starts a process inside the context.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn start(&self, process: ProcessSpec) -> Result<ProcessHandle>;

    /// Stops the init process and removes the persisted context.
    ///
    /// # Errors
    ///
    /// Returns an error if the context directory cannot be removed.
    fn destroy(&mut self) -> Result<()>;
}
