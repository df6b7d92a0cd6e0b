//! One job attempt, from staging to its audit entry.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use trainyard_core::{ProgressExtractor, ProgressUpdate};

use super::output::BoundedOutput;
use super::retry::with_retry;
use super::state::{AttemptEvent, JobAttempt};
use super::{AttemptReport, JobError, JobRequest, Shared};
use crate::registry::Invocation;
use crate::storage::{AuditStatus, JobStateStore, JobStatus, JobUpdate, NewAuditEntry, NewJob};
use crate::stream::{EventMultiplexer, JobEvent, TerminalOutcome};
use crate::subprocess::{ExitOutcome, ProcessEvent, SupervisedProcess};

/// Output kept in an audit entry, per stream (the tail end).
const AUDIT_OUTPUT_BYTES: usize = 64 * 1024;

pub(super) async fn run_attempt<S: JobStateStore>(
    shared: Arc<Shared<S>>,
    attempt_id: String,
    request: JobRequest,
    invocation: Invocation,
    events: EventMultiplexer,
) -> AttemptReport {
    let limit = shared.max_output_bytes;
    let run = AttemptRun {
        shared,
        attempt_id,
        request,
        events,
        machine: JobAttempt::new(),
        job_id: None,
        stdout: BoundedOutput::new(limit),
        stderr: BoundedOutput::new(limit),
        store_errors: 0,
    };
    run.execute(invocation).await
}

struct AttemptRun<S> {
    shared: Arc<Shared<S>>,
    attempt_id: String,
    request: JobRequest,
    events: EventMultiplexer,
    machine: JobAttempt,
    job_id: Option<i64>,
    stdout: BoundedOutput,
    stderr: BoundedOutput,
    store_errors: u32,
}

impl<S: JobStateStore> AttemptRun<S> {
    async fn execute(mut self, invocation: Invocation) -> AttemptReport {
        // Held until the report is built; the semaphore is never closed.
        let _permit = Arc::clone(&self.shared.slots).acquire_owned().await.ok();
        self.apply(AttemptEvent::Accepted);
        if self.shared.supervisor.is_shut_down() {
            return self.fail_to_start(JobError::Interrupted).await;
        }

        let mut staged = match self.shared.stager.stage(&self.request.parameters).await {
            Ok(staged) => staged,
            Err(e) => return self.fail_to_start(JobError::from(e)).await,
        };

        let args = invocation.args_with_config(staged.path());
        let process = match self.shared.supervisor.spawn(&invocation, &args) {
            Ok(process) => process,
            Err(e) => {
                staged.release().await;
                return self.fail_to_start(JobError::from(e)).await;
            }
        };

        self.apply(AttemptEvent::Spawned);
        self.create_record(JobStatus::Running, None).await;
        info!(
            attempt_id = %self.attempt_id,
            job_id = ?self.job_id,
            pid = ?process.pid(),
            "Job running"
        );

        let outcome = self.pump(process).await;
        staged.release().await;

        let event = match outcome {
            Some(outcome) => AttemptEvent::Exited(outcome),
            None => AttemptEvent::Aborted {
                error: "Supervisor stopped without an exit status".to_string(),
            },
        };
        if let Some(update) = self.apply(event) {
            self.update_record(&update, "mark_terminal").await;
        }
        self.conclude(None).await
    }

    /// Forward process output until the exit notification.
    async fn pump(&mut self, mut process: SupervisedProcess) -> Option<ExitOutcome> {
        let mut extractor =
            ProgressExtractor::new(&self.request.action, Arc::clone(&self.shared.matchers));

        let outcome = loop {
            match process.next_event().await {
                Some(ProcessEvent::Stdout(text)) => {
                    self.stdout.push(&text);
                    let updates = extractor.push(&text);
                    self.events.publish(JobEvent::Stdout { text }).await;
                    for update in updates {
                        self.record_progress(update).await;
                    }
                }
                Some(ProcessEvent::Stderr(text)) => {
                    self.stderr.push(&text);
                    self.events.publish(JobEvent::Stderr { text }).await;
                }
                Some(ProcessEvent::Exited(outcome)) => break Some(outcome),
                None => break None,
            }
        };

        if let Some(update) = extractor.finish() {
            self.record_progress(update).await;
        }
        outcome
    }

    async fn record_progress(&mut self, update: ProgressUpdate) {
        let Some(change) = self.apply(AttemptEvent::Progress(update)) else {
            return;
        };
        if let (Some(percent), Some(line)) = (change.progress, change.last_metrics_line.clone()) {
            debug!(attempt_id = %self.attempt_id, percent, "Job progress");
            self.events
                .publish(JobEvent::Progress { percent, line })
                .await;
        }
        self.update_record(&change, "update_progress").await;
    }

    /// Staging or spawning failed, or shutdown came first: the failed
    /// record is the only job write.
    async fn fail_to_start(mut self, err: JobError) -> AttemptReport {
        let message = err.to_string();
        warn!(attempt_id = %self.attempt_id, error = %message, "Job failed to start");

        let spawn_error = matches!(err, JobError::Spawn(_)).then(|| message.clone());
        if self
            .apply(AttemptEvent::StartFailed { error: message.clone() })
            .is_some()
        {
            self.create_record(JobStatus::Failed, Some(message)).await;
        }
        self.conclude(spawn_error).await
    }

    /// Append the audit entry, publish the terminal event, build the report.
    async fn conclude(mut self, spawn_error: Option<String>) -> AttemptReport {
        let status = self.machine.status().unwrap_or(JobStatus::Failed);
        let exit_code = self.machine.exit_code();
        let error = self.machine.error().map(str::to_string);

        let details = serde_json::json!({
            "attempt_id": self.attempt_id,
            "kind": self.request.kind,
            "action": self.request.action,
            "parameters": self.request.parameters,
            "job_id": self.job_id,
            "exit_code": exit_code,
            "error": error,
            "stdout": self.stdout.tail(AUDIT_OUTPUT_BYTES),
            "stderr": self.stderr.tail(AUDIT_OUTPUT_BYTES),
        });
        let entry = NewAuditEntry {
            action: self.request.action.clone(),
            details: details.to_string(),
            status: if status == JobStatus::Completed {
                AuditStatus::Success
            } else {
                AuditStatus::Error
            },
        };
        let store = &self.shared.store;
        if let Err(source) =
            with_retry(&self.shared.retry, "append_audit", || store.append_audit(&entry)).await
        {
            self.store_failed(&JobError::StoreUnavailable {
                operation: "append_audit",
                source,
            });
        }

        info!(
            attempt_id = %self.attempt_id,
            job_id = ?self.job_id,
            status = %status,
            exit_code = ?exit_code,
            "Job finished"
        );

        let terminal = TerminalOutcome {
            job_id: self.job_id,
            status,
            exit_code,
            error: if spawn_error.is_some() { None } else { error.clone() },
            spawn_error,
        };
        self.events.publish(JobEvent::Terminal(terminal)).await;

        let output_truncated = self.stdout.truncated() || self.stderr.truncated();
        AttemptReport {
            attempt_id: self.attempt_id,
            job_id: self.job_id,
            status,
            exit_code,
            error,
            stdout: self.stdout.into_string(),
            stderr: self.stderr.into_string(),
            output_truncated,
            store_errors: self.store_errors,
        }
    }

    fn apply(&mut self, event: AttemptEvent) -> Option<JobUpdate> {
        match self.machine.transition(event) {
            Ok(update) => update,
            Err(e) => {
                warn!(attempt_id = %self.attempt_id, error = %e, "Ignoring job event");
                None
            }
        }
    }

    async fn create_record(&mut self, status: JobStatus, error: Option<String>) {
        let job = NewJob {
            kind: self.request.kind.clone(),
            action: self.request.action.clone(),
            parameters: self.request.parameters.to_string(),
            status,
            error,
        };
        let store = &self.shared.store;
        match with_retry(&self.shared.retry, "create_job", || store.create_job(&job)).await {
            Ok(id) => self.job_id = Some(id),
            Err(source) => self.store_failed(&JobError::StoreUnavailable {
                operation: "create_job",
                source,
            }),
        }
    }

    /// Unpersisted attempts (no record) skip updates.
    async fn update_record(&mut self, update: &JobUpdate, operation: &'static str) {
        let Some(id) = self.job_id else {
            return;
        };
        let store = &self.shared.store;
        if let Err(source) =
            with_retry(&self.shared.retry, operation, || store.update_job(id, update)).await
        {
            self.store_failed(&JobError::StoreUnavailable { operation, source });
        }
    }

    fn store_failed(&mut self, err: &JobError) {
        error!(attempt_id = %self.attempt_id, job_id = ?self.job_id, error = %err, "Store write failed");
        self.store_errors += 1;
    }
}
