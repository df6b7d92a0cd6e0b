//! `trainyard run`.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_stream::StreamExt;
use tracing::warn;
use trainyard_core::Config;

use super::{Outcome, open_database};
use crate::orchestrator::{AggregateResult, JobRequest, Orchestrator};
use crate::storage::{JobStateStore, MemoryStore};
use crate::stream::JobEvent;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Registered job kind (see `trainyard programs`)
    pub kind: String,

    /// Action recorded with the job; `train` enables epoch progress parsing
    #[arg(long, default_value = "run")]
    pub action: String,

    /// Job parameters as a JSON object
    #[arg(long, conflicts_with = "params_file")]
    pub params: Option<String>,

    /// Read job parameters from a JSON file
    #[arg(long)]
    pub params_file: Option<PathBuf>,

    /// Print one JSON result after the job ends instead of streaming events
    #[arg(long)]
    pub aggregate: bool,

    /// Keep job records in memory only
    #[arg(long)]
    pub ephemeral: bool,
}

/// Malformed `--params` / `--params-file` input.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid parameters JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parameters must be a JSON object")]
    NotAnObject,
}

impl RunArgs {
    /// Parse the parameters; absent parameters mean `{}`.
    pub fn parameters(&self) -> Result<serde_json::Value, ParamsError> {
        let text = match (&self.params, &self.params_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => {
                std::fs::read_to_string(path).map_err(|source| ParamsError::Read {
                    path: path.clone(),
                    source,
                })?
            }
            (None, None) => return Ok(serde_json::Value::Object(serde_json::Map::new())),
        };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if !value.is_object() {
            return Err(ParamsError::NotAnObject);
        }
        Ok(value)
    }
}

pub(super) async fn handle(args: RunArgs, config: &Config) -> anyhow::Result<Outcome> {
    let parameters = match args.parameters() {
        Ok(parameters) => parameters,
        Err(e) => {
            warn!(error = %e, "Malformed job request");
            writeln!(io::stderr(), "error: {e}")?;
            return Ok(Outcome::Rejected);
        }
    };
    let request = JobRequest::new(args.kind.clone(), args.action.clone(), parameters);

    if args.ephemeral {
        let orchestrator = Orchestrator::from_config(config, Arc::new(MemoryStore::new()));
        run_job(&orchestrator, request, args.aggregate).await
    } else {
        let db = open_database(config).await?;
        let orchestrator = Orchestrator::from_config(config, Arc::new(db));
        run_job(&orchestrator, request, args.aggregate).await
    }
}

/// Run one job to its end.
///
/// The attempt is always awaited: a broken stdout only stops printing, and
/// Ctrl-C shuts the orchestrator down so the attempt still records its
/// terminal state and audit entry.
async fn run_job<S: JobStateStore>(
    orchestrator: &Orchestrator<S>,
    request: JobRequest,
    aggregate: bool,
) -> anyhow::Result<Outcome> {
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;

    let report = if aggregate {
        let handle = match orchestrator.submit(request) {
            Ok(handle) => handle,
            Err(rejected) => return reject(&rejected),
        };
        let wait = handle.wait();
        tokio::pin!(wait);
        loop {
            tokio::select! {
                report = &mut wait => break report,
                result = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    on_interrupt(orchestrator, result);
                }
            }
        }
    } else {
        let (handle, mut events) = match orchestrator.submit_streaming(request) {
            Ok(started) => started,
            Err(rejected) => return reject(&rejected),
        };
        let mut printing = true;
        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else { break };
                    if printing && let Err(e) = print_event(&event) {
                        warn!(error = %e, "Cannot write job events, waiting for the job silently");
                        printing = false;
                    }
                }
                result = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    on_interrupt(orchestrator, result);
                }
            }
        }
        handle.wait().await
    };

    if aggregate {
        let result = AggregateResult::from(report.clone());
        let mut out = io::stdout().lock();
        if let Err(e) = writeln!(out, "{}", serde_json::to_string(&result)?) {
            warn!(error = %e, "Cannot write job result");
        }
    }
    Ok(if report.success() {
        Outcome::Success
    } else {
        Outcome::JobFailed
    })
}

fn print_event(event: &JobEvent) -> anyhow::Result<()> {
    let line = serde_json::to_string(event)?;
    let mut out = io::stdout().lock();
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}

fn on_interrupt<S: JobStateStore>(orchestrator: &Orchestrator<S>, result: io::Result<()>) {
    match result {
        Ok(()) => {
            warn!("Interrupted, stopping the job");
            orchestrator.shutdown();
        }
        Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
    }
}

fn reject(rejected: &crate::registry::RejectedKind) -> anyhow::Result<Outcome> {
    writeln!(io::stderr(), "error: {rejected}")?;
    Ok(Outcome::Rejected)
}
