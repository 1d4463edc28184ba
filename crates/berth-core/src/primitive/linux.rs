//! Linux implementation of the container runtime primitive.
//!
//! Each context is held by an init process (`berth-stager init`) that
//! unshares the requested namespaces, then serves mount requests over its
//! stdin/stdout until the pipe closes. Processes are started by opening the
//! init's `/proc/<pid>/ns/*` files and joining them before `exec(2)`.
//!
//! Control protocol, one line per message:
//!
//! ```text
//! init -> unshared
//! host -> continue          (after writing uid/gid maps, if any)
//! init -> ready
//! host -> {"rootfs": ..., "mounts": [...]}
//! init -> ok | error <message>
//! ```

#![allow(unsafe_code)]

use std::ffi::CString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use berth_common::error::{BerthError, Result};
use berth_common::types::is_valid_name;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::pty::{OpenptyResult, openpty};
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Gid, Pid, Uid};
use serde::{Deserialize, Serialize};

use super::{ContainerConfig, Factory, PrimitiveContainer, ProcessHandle, ProcessSpec};
use crate::filesystem::{MountDescriptor, mount};
use crate::namespace::{NamespaceFds, NamespaceKind, NamespaceSet, user, uts};

const CONTEXT_FILE: &str = "context.json";

/// Persisted description of a live context.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Context {
    id: String,
    init_pid: u32,
    rootfs: PathBuf,
    namespaces: NamespaceSet,
}

/// Mount request sent to the init process.
#[derive(Debug, Serialize, Deserialize)]
struct MountRequest {
    rootfs: PathBuf,
    mounts: Vec<MountDescriptor>,
}

/// Creates contexts whose init process is `<init_binary> init`.
#[derive(Debug, Clone)]
pub struct LinuxFactory {
    root: PathBuf,
    init_binary: PathBuf,
}

impl LinuxFactory {
    /// Creates a factory rooted at `root`, re-executing the current binary
    /// as the init process.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created or the current
    /// executable cannot be resolved.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| BerthError::io(&root, e))?;
        let init_binary =
            std::env::current_exe().map_err(|e| BerthError::io("/proc/self/exe", e))?;
        Ok(Self { root, init_binary })
    }

    fn context_dir(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_name(id) {
            return Err(BerthError::InvalidName { name: id.into() });
        }
        Ok(self.root.join(id))
    }
}

impl Factory for LinuxFactory {
    fn create(&self, id: &str, config: &ContainerConfig) -> Result<Box<dyn PrimitiveContainer>> {
        let dir = self.context_dir(id)?;
        if dir.join(CONTEXT_FILE).exists() {
            return Err(BerthError::Config {
                message: format!("container context {id} already exists"),
            });
        }
        std::fs::create_dir_all(&dir).map_err(|e| BerthError::io(&dir, e))?;

        let mut cmd = Command::new(&self.init_binary);
        let _ = cmd
            .arg("init")
            .arg("--namespaces")
            .arg(config.namespaces.to_list())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(hostname) = &config.hostname {
            let _ = cmd.arg("--hostname").arg(hostname);
        }
        let child = cmd
            .spawn()
            .map_err(|e| BerthError::io(&self.init_binary, e))?;
        let mut control = InitControl::new(child)?;

        if let Err(e) = handshake(&mut control, &config.namespaces) {
            control.kill();
            return Err(e);
        }

        let context = Context {
            id: id.into(),
            init_pid: control.pid(),
            rootfs: config.rootfs.clone(),
            namespaces: config.namespaces.clone(),
        };
        let path = dir.join(CONTEXT_FILE);
        if let Err(e) = std::fs::write(&path, serde_json::to_vec_pretty(&context)?) {
            control.kill();
            return Err(BerthError::io(path, e));
        }

        tracing::info!(
            id,
            init_pid = context.init_pid,
            namespaces = %context.namespaces.to_list(),
            "container context created"
        );
        Ok(Box::new(LinuxContainer {
            dir,
            context,
            control: Some(control),
        }))
    }

    fn load(&self, id: &str) -> Result<Box<dyn PrimitiveContainer>> {
        let dir = self.context_dir(id)?;
        let not_found = || BerthError::NotFound {
            kind: "container context",
            id: id.into(),
        };
        let content = std::fs::read(dir.join(CONTEXT_FILE)).map_err(|_| not_found())?;
        let context: Context = serde_json::from_slice(&content)?;
        if kill(to_pid(context.init_pid)?, None).is_err() {
            return Err(not_found());
        }
        Ok(Box::new(LinuxContainer {
            dir,
            context,
            control: None,
        }))
    }
}

fn handshake(control: &mut InitControl, namespaces: &NamespaceSet) -> Result<()> {
    control.await_reply("unshared")?;
    if namespaces.contains(NamespaceKind::User) {
        user::write_identity_map(control.pid())?;
    }
    control.send("continue")?;
    control.await_reply("ready")
}

/// Host side of the init process's control pipes.
#[derive(Debug)]
struct InitControl {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl InitControl {
    fn new(mut child: Child) -> Result<Self> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(BerthError::Internal {
                message: "init process spawned without control pipes".into(),
            });
        };
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn send(&mut self, line: &str) -> Result<()> {
        writeln!(self.stdin, "{line}")
            .and_then(|()| self.stdin.flush())
            .map_err(|e| BerthError::io("init control pipe", e))
    }

    fn await_reply(&mut self, want: &str) -> Result<()> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| BerthError::io("init control pipe", e))?;
        if read == 0 {
            return Err(init_failure("init process exited"));
        }
        match line.trim_end() {
            reply if reply == want => Ok(()),
            reply => Err(init_failure(
                reply.strip_prefix("error ").unwrap_or(reply),
            )),
        }
    }

    fn request(&mut self, line: &str) -> Result<()> {
        self.send(line)?;
        self.await_reply("ok")
    }

    /// Closes the control pipe, which makes the init process exit.
    fn shutdown(self) {
        let Self { mut child, stdin, .. } = self;
        drop(stdin);
        if let Err(e) = child.wait() {
            tracing::warn!(error = %e, "failed to reap init process");
        }
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn init_failure(message: &str) -> BerthError {
    BerthError::io("init", io::Error::other(message.to_owned()))
}

fn to_pid(pid: u32) -> Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| BerthError::Internal {
            message: format!("pid {pid} out of range"),
        })
}

/// A context created or loaded by [`LinuxFactory`].
#[derive(Debug)]
struct LinuxContainer {
    dir: PathBuf,
    context: Context,
    control: Option<InitControl>,
}

impl PrimitiveContainer for LinuxContainer {
    fn id(&self) -> &str {
        &self.context.id
    }

    fn apply_mounts(&mut self, mounts: &[MountDescriptor]) -> Result<()> {
        let control = self.control.as_mut().ok_or_else(|| BerthError::Internal {
            message: format!("context {} has no init control channel", self.context.id),
        })?;
        let request = MountRequest {
            rootfs: self.context.rootfs.clone(),
            mounts: mounts.to_vec(),
        };
        control.request(&serde_json::to_string(&request)?)?;
        tracing::debug!(id = %self.context.id, count = mounts.len(), "mounts applied");
        Ok(())
    }

    fn start(&self, process: ProcessSpec) -> Result<ProcessHandle> {
        let program = process
            .args
            .first()
            .cloned()
            .ok_or_else(|| BerthError::InvalidManifest {
                message: "process has an empty argument vector".into(),
            })?;
        let (uid, gid) = resolve_ids(&self.context.rootfs, &process.user, &process.group)?;

        let mut fds = NamespaceFds::open(self.context.init_pid, &self.context.namespaces)?;
        let pid_ns = fds.take(NamespaceKind::Pid);
        let rootfs = c_string(self.context.rootfs.as_os_str().as_bytes())?;
        let cwd = c_string(if process.cwd.is_empty() {
            b"/"
        } else {
            process.cwd.as_bytes()
        })?;
        let in_user_ns = self.context.namespaces.contains(NamespaceKind::User);
        let tty = process.tty;

        let mut cmd = Command::new(&program);
        let _ = cmd.args(&process.args[1..]).env_clear();
        for entry in &process.env {
            if let Some((name, value)) = entry.split_once('=') {
                let _ = cmd.env(name, value);
            }
        }
        let console = if tty {
            Some(attach_pty(&mut cmd)?)
        } else {
            let _ = cmd
                .stdin(process.stdin)
                .stdout(process.stdout)
                .stderr(process.stderr);
            None
        };

        // SAFETY: the hook runs in the single-threaded child between fork
        // and exec. It only issues setns, setsid, ioctl, chroot, chdir and
        // set*id system calls on values prepared before the fork.
        unsafe {
            let _ = cmd.pre_exec(move || {
                fds.enter()?;
                if tty {
                    let _ = nix::unistd::setsid()?;
                    if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                nix::unistd::chroot(rootfs.as_c_str())?;
                nix::unistd::chdir(cwd.as_c_str())?;
                if !in_user_ns {
                    nix::unistd::setgroups(&[])?;
                }
                nix::unistd::setgid(gid)?;
                nix::unistd::setuid(uid)?;
                Ok(())
            });
        }

        let child = spawn_with_pid_namespace(cmd, pid_ns).map_err(|e| BerthError::io(&program, e))?;
        tracing::info!(
            id = %self.context.id,
            pid = child.id(),
            program = %program,
            tty,
            "process started"
        );
        Ok(ProcessHandle::new(child, console))
    }

    fn destroy(&mut self) -> Result<()> {
        if let Some(control) = self.control.take() {
            control.shutdown();
        } else {
            match kill(to_pid(self.context.init_pid)?, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(BerthError::io("init", e.into())),
            }
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BerthError::io(&self.dir, e)),
        }
        tracing::info!(id = %self.context.id, "container context destroyed");
        Ok(())
    }
}

/// Spawns `cmd`, first joining `pid_ns` on a dedicated thread.
///
/// `setns(CLONE_NEWPID)` only affects children of the calling thread, so the
/// fork has to happen on a thread that can be discarded afterwards.
fn spawn_with_pid_namespace(mut cmd: Command, pid_ns: Option<OwnedFd>) -> io::Result<Child> {
    let Some(fd) = pid_ns else {
        return cmd.spawn();
    };
    std::thread::Builder::new()
        .name("berth-spawn".into())
        .spawn(move || {
            nix::sched::setns(&fd, CloneFlags::CLONE_NEWPID)?;
            cmd.spawn()
        })?
        .join()
        .map_err(|_| io::Error::other("spawner thread panicked"))?
}

/// Binds a new pseudo-terminal to the command's stdio and returns the master.
fn attach_pty(cmd: &mut Command) -> Result<File> {
    let OpenptyResult { master, slave } =
        openpty(None, None).map_err(|e| BerthError::io("/dev/ptmx", e.into()))?;
    for fd in [&master, &slave] {
        let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| BerthError::io("/dev/ptmx", e.into()))?;
    }
    let slave = File::from(slave);
    let dup = |f: &File| f.try_clone().map_err(|e| BerthError::io("/dev/pts", e));
    let _ = cmd.stdin(dup(&slave)?).stdout(dup(&slave)?).stderr(slave);
    Ok(File::from(master))
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| BerthError::InvalidManifest {
        message: format!("path contains a NUL byte: {}", String::from_utf8_lossy(bytes)),
    })
}

/// Resolves a user and group, by number or through the rootfs databases.
fn resolve_ids(rootfs: &Path, user: &str, group: &str) -> Result<(Uid, Gid)> {
    let (uid, primary_gid) = if user.is_empty() {
        (0, 0)
    } else if let Ok(uid) = user.parse() {
        (uid, uid)
    } else {
        let (uid, gid) = lookup(rootfs, "etc/passwd", "user", user)?;
        (uid, gid.unwrap_or(uid))
    };
    let gid = if group.is_empty() {
        primary_gid
    } else if let Ok(gid) = group.parse() {
        gid
    } else {
        lookup(rootfs, "etc/group", "group", group)?.0
    };
    Ok((Uid::from_raw(uid), Gid::from_raw(gid)))
}

/// Finds `name` in a colon separated database such as `etc/passwd`,
/// returning the third field and, when numeric, the fourth.
fn lookup(rootfs: &Path, database: &str, kind: &'static str, name: &str) -> Result<(u32, Option<u32>)> {
    let path = rootfs.join(database);
    let content = std::fs::read_to_string(&path).map_err(|e| BerthError::io(&path, e))?;
    content
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.first() == Some(&name))
        .and_then(|fields| {
            let id = fields.get(2)?.parse().ok()?;
            Some((id, fields.get(3).and_then(|g| g.parse().ok())))
        })
        .ok_or_else(|| BerthError::NotFound {
            kind,
            id: name.into(),
        })
}

/// Entry point of the init process.
///
/// Unshares `namespaces`, waits for the host to finish the id mappings,
/// then applies mount requests read from stdin until it is closed. When a
/// PID namespace is created, a holder child keeps it alive as its PID 1.
///
/// # Errors
///
/// Returns an error if the namespaces cannot be set up or the control pipe
/// fails.
pub fn start_initialization(namespaces: &NamespaceSet, hostname: Option<&str>) -> Result<()> {
    let mut input = io::stdin().lock();
    let mut output = io::stdout().lock();

    let holder = match prepare(namespaces, hostname, &mut input, &mut output) {
        Ok(holder) => holder,
        Err(e) => {
            let _ = reply(&mut output, &format!("error {e}"));
            return Err(e);
        }
    };
    reply(&mut output, "ready")?;

    for line in input.lines() {
        let line = line.map_err(|e| BerthError::io("stdin", e))?;
        let outcome = serde_json::from_str::<MountRequest>(&line)
            .map_err(BerthError::from)
            .and_then(|request| {
                request
                    .mounts
                    .iter()
                    .try_for_each(|m| mount::apply(&request.rootfs, m))
            });
        match outcome {
            Ok(()) => reply(&mut output, "ok")?,
            Err(e) => {
                tracing::warn!(error = %e, "mount request failed");
                reply(&mut output, &format!("error {e}"))?;
            }
        }
    }

    if let Some(pid) = holder {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
    tracing::debug!("control pipe closed, init exiting");
    Ok(())
}

fn prepare(
    namespaces: &NamespaceSet,
    hostname: Option<&str>,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<Option<Pid>> {
    namespaces.unshare()?;
    reply(output, "unshared")?;

    let mut line = String::new();
    let _ = input
        .read_line(&mut line)
        .map_err(|e| BerthError::io("stdin", e))?;
    if line.trim_end() != "continue" {
        return Err(init_failure("host aborted the handshake"));
    }

    if namespaces.contains(NamespaceKind::Mount) {
        mount::make_private_root()?;
    }
    if let (true, Some(hostname)) = (namespaces.contains(NamespaceKind::Uts), hostname) {
        uts::set_hostname(hostname)?;
    }
    if namespaces.contains(NamespaceKind::Pid) {
        return spawn_pid_holder().map(Some);
    }
    Ok(None)
}

fn reply(output: &mut impl Write, line: &str) -> Result<()> {
    writeln!(output, "{line}")
        .and_then(|()| output.flush())
        .map_err(|e| BerthError::io("stdout", e))
}

/// Forks the first process of the new PID namespace.
fn spawn_pid_holder() -> Result<Pid> {
    // SAFETY: init is single threaded. The child only calls prctl and pause.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!(pid = child.as_raw(), "pid namespace holder started");
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);
            loop {
                nix::unistd::pause();
            }
        }
        Err(e) => Err(BerthError::io("fork", e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootfs_with_databases() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("etc");
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nworker:x:1000:1001::/srv:/bin/sh\n",
        )
        .expect("passwd");
        std::fs::write(dir.path().join("etc/group"), "root:x:0:\nstaff:x:50:worker\n")
            .expect("group");
        dir
    }

    #[test]
    fn resolve_ids_defaults_to_root() {
        let (uid, gid) = resolve_ids(Path::new("/nonexistent"), "", "").expect("resolve");
        assert_eq!((uid.as_raw(), gid.as_raw()), (0, 0));
    }

    #[test]
    fn resolve_ids_accepts_numbers_without_databases() {
        let (uid, gid) = resolve_ids(Path::new("/nonexistent"), "42", "7").expect("resolve");
        assert_eq!((uid.as_raw(), gid.as_raw()), (42, 7));
    }

    #[test]
    fn resolve_ids_reads_rootfs_databases() {
        let rootfs = rootfs_with_databases();
        let (uid, gid) = resolve_ids(rootfs.path(), "worker", "").expect("resolve");
        assert_eq!((uid.as_raw(), gid.as_raw()), (1000, 1001));

        let (_, gid) = resolve_ids(rootfs.path(), "worker", "staff").expect("resolve");
        assert_eq!(gid.as_raw(), 50);
    }

    #[test]
    fn resolve_ids_reports_unknown_names() {
        let rootfs = rootfs_with_databases();
        assert!(matches!(
            resolve_ids(rootfs.path(), "nobody", ""),
            Err(BerthError::NotFound { kind: "user", .. })
        ));
        assert!(matches!(
            resolve_ids(rootfs.path(), "", "wheel"),
            Err(BerthError::NotFound { kind: "group", .. })
        ));
    }

    #[test]
    fn factory_rejects_invalid_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = LinuxFactory::new(dir.path()).expect("factory");
        assert!(matches!(
            factory.load("../escape"),
            Err(BerthError::InvalidName { .. })
        ));
    }

    #[test]
    fn load_without_context_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = LinuxFactory::new(dir.path()).expect("factory");
        assert!(matches!(
            factory.load("missing"),
            Err(BerthError::NotFound { .. })
        ));
    }

    #[test]
    fn prepare_without_namespaces_follows_handshake() {
        let mut input = io::Cursor::new(b"continue\n".to_vec());
        let mut output = Vec::new();
        let holder = prepare(&NamespaceSet::from_kinds([]), None, &mut input, &mut output)
            .expect("prepare");
        assert!(holder.is_none());
        assert_eq!(output, b"unshared\n");
    }

    #[test]
    fn prepare_fails_when_host_aborts() {
        let mut input = io::Cursor::new(Vec::new());
        let mut output = Vec::new();
        assert!(prepare(&NamespaceSet::from_kinds([]), None, &mut input, &mut output).is_err());
    }
}
