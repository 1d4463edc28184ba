//! Running one process inside an existing container.
//!
//! Used by exec/attach: the broker spawns `berth-stager run` with piped
//! stdio, and this module joins the container's primitive context and
//! relays the process's I/O until it exits.

use std::io;
use std::path::PathBuf;
use std::sync::mpsc;

use berth_common::constants::OUTPUT_FLUSH_GRACE;
use berth_common::error::{BerthError, Result};
use berth_common::manifest::App;
use berth_core::primitive::{Factory, LinuxFactory, ProcessSpec};

use crate::stager::StagerConfig;

/// Program run when neither a command nor an app is given.
pub const DEFAULT_SHELL: &str = "/bin/sh";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Container directory holding `stager.json`.
    pub directory: PathBuf,
    /// App whose user, environment and working directory are used.
    pub app: Option<String>,
    /// Argument vector. Empty means the app's own exec, or a shell.
    pub command: Vec<String>,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
}

/// Builds the process for `app`, running `command` if it is not empty.
#[must_use]
pub fn app_process(app: Option<&App>, command: &[String]) -> ProcessSpec {
    let args = if !command.is_empty() {
        command.to_vec()
    } else if let Some(app) = app.filter(|a| !a.exec.is_empty()) {
        app.exec.clone()
    } else {
        vec![DEFAULT_SHELL.to_owned()]
    };

    let mut spec = ProcessSpec::new(args);
    if let Some(app) = app {
        if !app.working_directory.is_empty() {
            spec.cwd.clone_from(&app.working_directory);
        }
        spec.user.clone_from(&app.user);
        spec.group.clone_from(&app.group);
        spec.env = app.env_list();
    }
    if !spec.env.iter().any(|e| e.starts_with("PATH=")) {
        spec.env.push(DEFAULT_PATH.to_owned());
    }
    spec
}

/// Runs the requested process and returns its exit code.
///
/// # Errors
///
/// Returns an error if the container context cannot be loaded, the app is
/// unknown, or the process cannot be started.
pub fn run(request: &RunRequest) -> Result<i32> {
    let config = StagerConfig::load(&request.directory)?;
    let app = match &request.app {
        Some(name) => Some(
            config
                .pod
                .apps
                .iter()
                .find(|a| &a.name == name)
                .map(|a| &a.app)
                .ok_or_else(|| BerthError::NotFound {
                    kind: "app",
                    id: name.clone(),
                })?,
        ),
        None => None,
    };

    let factory = LinuxFactory::new(&config.primitive_root)?;
    let container = factory.load(config.uuid.as_str())?;

    let mut spec = app_process(app, &request.command);
    spec.tty = request.tty;
    let mut handle = container.start(spec)?;
    tracing::debug!(id = %config.uuid, pid = handle.pid(), tty = request.tty, "run process started");

    let relay = handle.take_console().map(relay_console).transpose()?;
    let code = handle.wait()?;
    if let Some(done) = relay {
        // Output still buffered in the console gets a short window to drain.
        if done.recv_timeout(OUTPUT_FLUSH_GRACE).is_err() {
            tracing::debug!(id = %config.uuid, "console output not drained before grace window");
        }
    }
    Ok(code)
}

/// Copies stdin to the console and the console to stdout on worker
/// threads. The returned channel fires once output reaches end of stream.
fn relay_console(console: std::fs::File) -> Result<mpsc::Receiver<()>> {
    let mut input = console
        .try_clone()
        .map_err(|e| BerthError::io("console", e))?;
    let mut output = console;
    let (done_tx, done_rx) = mpsc::channel();

    let _ = std::thread::Builder::new()
        .name("berth-console-in".into())
        .spawn(move || {
            let _ = io::copy(&mut io::stdin().lock(), &mut input);
        })
        .map_err(|e| BerthError::io("console relay", e))?;
    let _ = std::thread::Builder::new()
        .name("berth-console-out".into())
        .spawn(move || {
            // The master reads EIO once the last slave closes.
            let _ = io::copy(&mut output, &mut io::stdout().lock());
            let _ = done_tx.send(());
        })
        .map_err(|e| BerthError::io("console relay", e))?;
    Ok(done_rx)
}

#[cfg(test)]
mod tests {
    use berth_common::manifest::EnvVar;

    use super::*;

    fn web_app() -> App {
        App {
            exec: vec!["/bin/web".into(), "--port".into(), "80".into()],
            user: "www".into(),
            working_directory: "/srv".into(),
            environment: vec![EnvVar {
                name: "PATH".into(),
                value: "/opt/bin".into(),
            }],
            ..App::default()
        }
    }

    #[test]
    fn app_process_uses_app_exec_and_context() {
        let spec = app_process(Some(&web_app()), &[]);
        assert_eq!(spec.args, vec!["/bin/web", "--port", "80"]);
        assert_eq!(spec.cwd, "/srv");
        assert_eq!(spec.user, "www");
        assert_eq!(spec.env, vec!["PATH=/opt/bin"]);
    }

    #[test]
    fn command_overrides_app_exec() {
        let spec = app_process(Some(&web_app()), &["ls".into(), "-l".into()]);
        assert_eq!(spec.args, vec!["ls", "-l"]);
        assert_eq!(spec.cwd, "/srv");
    }

    #[test]
    fn defaults_to_shell_in_root() {
        let spec = app_process(None, &[]);
        assert_eq!(spec.args, vec![DEFAULT_SHELL]);
        assert_eq!(spec.cwd, "/");
        assert!(spec.user.is_empty());
        assert_eq!(spec.env, vec![DEFAULT_PATH]);
    }

    #[test]
    fn run_without_stager_config_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let request = RunRequest {
            directory: dir.path().to_path_buf(),
            ..RunRequest::default()
        };
        assert!(matches!(run(&request), Err(BerthError::Io { .. })));
    }
}
