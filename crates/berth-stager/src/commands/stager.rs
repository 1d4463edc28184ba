//! `berth-stager stager`: bootstrap and supervise a container.

use std::path::PathBuf;

use clap::Args;

/// Arguments for the `stager` command.
#[derive(Args, Debug)]
pub struct StagerArgs {
    /// Container directory holding `stager.json`.
    pub directory: PathBuf,
}

/// Executes the `stager` command.
///
/// Runs every bootstrap step, reports readiness on fd 3 and supervises the
/// apps until they exit or a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if a bootstrap step or supervision fails.
pub fn execute(args: &StagerArgs) -> anyhow::Result<i32> {
    tracing::info!(directory = %args.directory.display(), "stager starting");
    let code = berth_runtime::stager::execute(&args.directory)?;
    tracing::info!(code, "stager finished");
    Ok(code)
}
