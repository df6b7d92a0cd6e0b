//! `trainyard`
//!
//! Runs registered training/inference programs as supervised jobs and
//! shows their recorded history.

use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use trainyard_jobs::cli::{Cli, Outcome, log_filter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = writeln!(io::stderr(), "error: {e:#}");
            return ExitCode::from(Outcome::Internal.exit_code());
        }
    };

    let log_filter = log_filter(&config.daemon.log_level);
    trainyard_core::tracing_init::init_tracing(&log_filter, cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting trainyard");

    match cli.execute(config).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            error!(error = %format!("{e:#}"), "trainyard failed");
            let _ = writeln!(io::stderr(), "error: {e:#}");
            ExitCode::from(Outcome::Internal.exit_code())
        }
    }
}
