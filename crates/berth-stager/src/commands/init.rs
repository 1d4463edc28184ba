//! `berth-stager init`: namespace setup for a primitive container.

use berth_core::namespace::NamespaceSet;
use clap::Args;

/// Arguments for the `init` command.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Comma separated namespaces to unshare, e.g. `pid,mount,uts`.
    #[arg(long)]
    pub namespaces: String,

    /// Hostname to set inside a new UTS namespace.
    #[arg(long)]
    pub hostname: Option<String>,
}

/// Executes the `init` command.
///
/// # Errors
///
/// Returns an error if the namespace list is invalid or initialization
/// fails.
pub fn execute(args: &InitArgs) -> anyhow::Result<i32> {
    let namespaces = NamespaceSet::parse(&args.namespaces)?;
    berth_core::primitive::linux::start_initialization(&namespaces, args.hostname.as_deref())?;
    Ok(0)
}
