//! Job execution orchestration.
//!
//! [`Orchestrator`] is the entry point:
//! - validates a [`JobRequest`] against the program registry (synchronously,
//!   before any side effect)
//! - runs each accepted attempt on its own task: stage config, spawn,
//!   supervise, extract progress, publish events, persist transitions
//! - limits concurrent attempts with a semaphore
//!
//! Every attempt ends with exactly one terminal store write and one audit
//! entry, whatever path it takes.

mod attempt;
pub mod output;
pub mod retry;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info};
use trainyard_core::config::RetryConfig;
use trainyard_core::{Config, MatcherSet};

use crate::registry::{ProgramRegistry, RejectedKind};
use crate::staging::{ConfigStager, StagingError};
use crate::storage::{DatabaseError, JobStateStore, JobStatus};
use crate::stream::{EventMultiplexer, EventStream, MultiplexerError};
use crate::subprocess::{ProcessSupervisor, SpawnError};

pub use state::{AttemptEvent, AttemptState, JobAttempt, StateError};

/// A request to run one registered program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: String,
    pub action: String,
    /// Opaque JSON forwarded to the program through the staged config.
    pub parameters: serde_json::Value,
}

impl JobRequest {
    pub fn new(kind: impl Into<String>, action: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            action: action.into(),
            parameters,
        }
    }
}

/// Why an accepted attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("{reason}")]
    RuntimeFailure { reason: String },

    #[error("Interrupted by shutdown")]
    Interrupted,

    #[error("Job state store unavailable during {operation}: {source}")]
    StoreUnavailable {
        operation: &'static str,
        #[source]
        source: DatabaseError,
    },
}

/// Everything known about an attempt once it has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub attempt_id: String,
    /// Store id; `None` when the record could not be created.
    pub job_id: Option<i64>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    /// Store writes that failed after all retries.
    pub store_errors: u32,
}

impl AttemptReport {
    pub fn success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Non-streaming result of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl From<AttemptReport> for AggregateResult {
    fn from(report: AttemptReport) -> Self {
        Self {
            success: report.success(),
            exit_code: report.exit_code,
            stdout: report.stdout,
            stderr: report.stderr,
        }
    }
}

/// Tunables for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub staging_dir: std::path::PathBuf,
    pub max_output_bytes: usize,
    pub max_concurrent_jobs: usize,
    pub job_timeout: Option<Duration>,
    pub terminate_grace: Duration,
    pub subscriber_buffer: usize,
    pub subscriber_stall: Duration,
    pub store_retry: RetryConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let daemon = &config.daemon;
        Self {
            staging_dir: daemon.staging_dir_or_default(),
            max_output_bytes: daemon.max_output_bytes,
            max_concurrent_jobs: daemon.max_concurrent_jobs.max(1),
            job_timeout: daemon.job_timeout_secs.map(Duration::from_secs),
            terminate_grace: Duration::from_secs(daemon.terminate_grace_secs),
            subscriber_buffer: daemon.subscriber_buffer.max(1),
            subscriber_stall: Duration::from_secs(daemon.subscriber_stall_secs),
            store_retry: config.store_retry.clone(),
        }
    }
}

struct Shared<S> {
    registry: ProgramRegistry,
    stager: ConfigStager,
    supervisor: ProcessSupervisor,
    store: Arc<S>,
    matchers: Arc<MatcherSet>,
    slots: Arc<Semaphore>,
    retry: RetryConfig,
    max_output_bytes: usize,
    subscriber_buffer: usize,
    subscriber_stall: Duration,
}

/// Runs job attempts against a [`JobStateStore`].
pub struct Orchestrator<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: JobStateStore> Orchestrator<S> {
    pub fn new(registry: ProgramRegistry, store: Arc<S>, settings: OrchestratorSettings) -> Self {
        Self::with_matchers(registry, store, settings, MatcherSet::with_defaults())
    }

    pub fn with_matchers(
        registry: ProgramRegistry,
        store: Arc<S>,
        settings: OrchestratorSettings,
        matchers: MatcherSet,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(settings.job_timeout, settings.terminate_grace);
        Self {
            shared: Arc::new(Shared {
                registry,
                stager: ConfigStager::new(settings.staging_dir),
                supervisor,
                store,
                matchers: Arc::new(matchers),
                slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
                retry: settings.store_retry,
                max_output_bytes: settings.max_output_bytes,
                subscriber_buffer: settings.subscriber_buffer,
                subscriber_stall: settings.subscriber_stall,
            }),
        }
    }

    /// Build from a resolved [`Config`].
    pub fn from_config(config: &Config, store: Arc<S>) -> Self {
        let registry = ProgramRegistry::from_config(config.programs_or_default());
        Self::new(registry, store, OrchestratorSettings::from_config(config))
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Terminate every running attempt and fail the ones still queued.
    ///
    /// Attempts still end with their terminal write and audit entry; wait
    /// on their handles before exiting.
    pub fn shutdown(&self) {
        self.shared.supervisor.shutdown();
    }

    /// Free concurrency slots right now.
    pub fn available_slots(&self) -> usize {
        self.shared.slots.available_permits()
    }

    /// Validate `request` and start its attempt on a new task.
    ///
    /// Unknown kinds are rejected here, with no store write and no spawn.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, RejectedKind> {
        let events = EventMultiplexer::new(self.shared.subscriber_buffer)
            .with_stall_timeout(self.shared.subscriber_stall);
        self.start(request, events)
    }

    /// Like [`submit`](Self::submit), with the subscriber attached before
    /// the attempt starts so no event is missed.
    pub fn submit_streaming(
        &self,
        request: JobRequest,
    ) -> Result<(JobHandle, EventStream), RejectedKind> {
        let (events, stream) = EventMultiplexer::with_subscriber(self.shared.subscriber_buffer);
        let events = events.with_stall_timeout(self.shared.subscriber_stall);
        Ok((self.start(request, events)?, stream))
    }

    /// Run `request` to completion without streaming.
    pub async fn run(&self, request: JobRequest) -> Result<AggregateResult, RejectedKind> {
        let handle = self.submit(request)?;
        Ok(handle.wait().await.into())
    }

    fn start(
        &self,
        request: JobRequest,
        events: EventMultiplexer,
    ) -> Result<JobHandle, RejectedKind> {
        let invocation = match self.shared.registry.resolve(&request.kind) {
            Ok(invocation) => invocation.clone(),
            Err(rejected) => {
                info!(kind = %request.kind, "Rejected job request");
                return Err(rejected);
            }
        };

        let attempt_id = uuid::Uuid::new_v4().to_string();
        info!(
            attempt_id = %attempt_id,
            kind = %request.kind,
            action = %request.action,
            "Job accepted"
        );

        let task = tokio::spawn(attempt::run_attempt(
            Arc::clone(&self.shared),
            attempt_id.clone(),
            request,
            invocation,
            events.clone(),
        ));

        Ok(JobHandle {
            attempt_id,
            events,
            task,
        })
    }
}

/// Handle to a running attempt.
#[derive(Debug)]
pub struct JobHandle {
    attempt_id: String,
    events: EventMultiplexer,
    task: JoinHandle<AttemptReport>,
}

impl JobHandle {
    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    /// Attach the live subscriber. Events published before this call are
    /// not replayed, except the terminal event.
    pub fn subscribe(&self) -> Result<EventStream, MultiplexerError> {
        self.events.attach()
    }

    /// Wait for the attempt to finish.
    pub async fn wait(self) -> AttemptReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(attempt_id = %self.attempt_id, error = %e, "Job attempt task failed");
                AttemptReport {
                    attempt_id: self.attempt_id,
                    job_id: None,
                    status: JobStatus::Failed,
                    exit_code: None,
                    error: Some(format!("Attempt task failed: {e}")),
                    stdout: String::new(),
                    stderr: String::new(),
                    output_truncated: false,
                    store_errors: 0,
                }
            }
        }
    }
}
