#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries process I/O and fd 3 carries readiness. A `run` session's
    // stderr is relayed to the entering client, so its diagnostics go to a file.
    let subscriber = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if let Some(path) = cli.command.log_file() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        subscriber
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    let code = commands::execute(cli)?;
    std::process::exit(code);
}
