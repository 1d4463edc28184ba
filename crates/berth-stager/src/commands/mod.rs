//! Subcommand definitions and dispatch.

pub mod init;
pub mod logs;
pub mod run;
pub mod stager;

use std::path::PathBuf;

use berth_common::constants::RUN_LOG_FILE;
use clap::{Parser, Subcommand};

/// Container-side entry points for berth.
#[derive(Parser, Debug)]
#[command(name = "berth-stager", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bootstrap sequence for a container directory.
    Stager(stager::StagerArgs),
    /// Start one process inside an existing container.
    Run(run::RunArgs),
    /// Namespace initialization for the container primitive.
    #[command(hide = true)]
    Init(init::InitArgs),
    /// Print an app's captured output.
    Logs(logs::LogsArgs),
}

impl Command {
    /// File this command's diagnostics go to, or `None` for stderr.
    #[must_use]
    pub fn log_file(&self) -> Option<PathBuf> {
        match self {
            Self::Run(args) => Some(args.directory.join(RUN_LOG_FILE)),
            Self::Stager(_) | Self::Init(_) | Self::Logs(_) => None,
        }
    }
}

/// Dispatches the parsed command and returns the process exit code.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Stager(args) => stager::execute(&args),
        Command::Run(args) => run::execute(args),
        Command::Init(args) => init::execute(&args),
        Command::Logs(args) => logs::execute(&args),
    }
}
