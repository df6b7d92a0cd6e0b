//! The `trainyard` command line.
//!
//! User-facing output goes to stdout with `writeln!` (NDJSON or JSON);
//! logs go to stderr.

mod list_cmd;
mod run_cmd;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use trainyard_core::Config;

use crate::storage::Database;

pub use run_cmd::RunArgs;

#[derive(Parser, Debug)]
#[command(name = "trainyard")]
#[command(version, about = "Run and track ML training and inference jobs")]
pub struct Cli {
    /// Database file path
    #[arg(long, global = true, env = "TRAINYARD_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true, env = "TRAINYARD_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "TRAINYARD_LOG_JSON")]
    pub log_json: bool,

    /// Project directory holding `.trainyard/settings.json`
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a registered program as a job
    Run(RunArgs),
    /// List recent job records
    Jobs {
        /// Maximum number of records
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// List recent audit entries
    Audit {
        /// Maximum number of entries
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// List registered job kinds
    Programs,
}

/// How a command ended, mapped to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Command done; for `run`, the job completed.
    Success,
    /// The job ran and failed.
    JobFailed,
    /// Rejected kind or malformed request; nothing ran.
    Rejected,
    /// The command itself failed (configuration, database, I/O).
    Internal,
}

impl Outcome {
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::JobFailed => 1,
            Self::Rejected => 2,
            Self::Internal => 3,
        }
    }
}

impl Cli {
    /// Resolve configuration: files and environment, then CLI flags.
    pub fn resolve_config(&self) -> anyhow::Result<Config> {
        let project_dir = match &self.project_dir {
            Some(dir) => Some(dir.clone()),
            None => std::env::current_dir().ok(),
        };
        let mut config = trainyard_core::config::load_config(project_dir.as_deref())?;
        if let Some(path) = &self.db_path {
            config.daemon.database_path = Some(path.clone());
        }
        if let Some(level) = &self.log_level {
            config.daemon.log_level.clone_from(level);
        }
        Ok(config)
    }

    pub async fn execute(self, config: Config) -> anyhow::Result<Outcome> {
        match self.command {
            Command::Run(args) => run_cmd::handle(args, &config).await,
            Command::Jobs { limit } => {
                list_cmd::jobs(&open_database(&config).await?, limit).await?;
                Ok(Outcome::Success)
            }
            Command::Audit { limit } => {
                list_cmd::audit(&open_database(&config).await?, limit).await?;
                Ok(Outcome::Success)
            }
            Command::Programs => {
                list_cmd::programs(&config)?;
                Ok(Outcome::Success)
            }
        }
    }
}

/// Default tracing filter: `level` for both trainyard crates.
pub fn log_filter(level: &str) -> String {
    format!("trainyard_jobs={level},trainyard_core={level}")
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    let path = match &config.daemon.database_path {
        Some(path) => path.clone(),
        None => trainyard_core::config::default_database_path()
            .context("Cannot determine home directory for the default database path")?,
    };
    info!(path = %path.display(), "Opening database");
    Ok(Database::open(&path).await?)
}
