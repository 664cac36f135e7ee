//! rollcall binary entry point.
//!
//! A thin wrapper around the rollcall-cli library that:
//! 1. Initializes logging
//! 2. Parses command-line arguments
//! 3. Runs the command against the store

use anyhow::Result;
use clap::Parser;
use rollcall_cli::{Cli, run};

fn main() -> Result<()> {
    // Logs go to stderr so command output stays clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(&cli, &mut std::io::stdout().lock())
}
