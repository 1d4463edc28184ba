//! `berth-stager run`: start a process in an existing container.

use std::path::PathBuf;

use berth_runtime::run::RunRequest;
use clap::Args;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container directory holding `stager.json`.
    pub directory: PathBuf,

    /// App whose user, environment and working directory are used.
    #[arg(long)]
    pub app: Option<String>,

    /// Allocate a pseudo-terminal.
    #[arg(long)]
    pub tty: bool,

    /// Command to run. Defaults to the app's exec, or a shell.
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Executes the `run` command and returns the process's exit code.
///
/// # Errors
///
/// Returns an error if the container cannot be loaded or the process
/// cannot be started.
pub fn execute(args: RunArgs) -> anyhow::Result<i32> {
    let request = RunRequest {
        directory: args.directory,
        app: args.app,
        command: args.command,
        tty: args.tty,
    };
    Ok(berth_runtime::run::run(&request)?)
}
