//! `berth-stager logs`: print an app's captured output.

use std::io::Write;
use std::path::PathBuf;

use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container directory.
    pub directory: PathBuf,

    /// App name.
    pub app: String,
}

/// Executes the `logs` command.
///
/// # Errors
///
/// Returns an error if the log exists but cannot be read.
pub fn execute(args: &LogsArgs) -> anyhow::Result<i32> {
    let logs = berth_runtime::logs::read_logs(&args.directory, &args.app)?;
    std::io::stdout().lock().write_all(logs.as_bytes())?;
    Ok(0)
}
