//! Per-attempt state machine.
//!
//! ```text
//! Validating ──Accepted──▶ Staging ──Spawned──▶ Running ──Exited(0)──▶ Completed
//!                             │                    │
//!                             └──StartFailed──▶ Failed ◀──Exited(≠0) / Aborted
//! ```
//!
//! [`JobAttempt::transition`] is the only way to move between states. Each
//! accepted event yields the store mutation it implies, so the caller
//! never decides on its own what to persist. Terminal states absorb: every
//! later event is rejected with [`StateError::Terminal`].

use std::fmt;

use trainyard_core::ProgressUpdate;
use trainyard_core::db::unix_timestamp;

use crate::storage::{JobStatus, JobUpdate};
use crate::subprocess::ExitOutcome;

/// Where an attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Validating,
    Staging,
    Running,
    Completed,
    Failed,
}

impl AttemptState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Staging => "staging",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    /// The kind resolved against the registry.
    Accepted,
    /// Config staged and child spawned.
    Spawned,
    /// Staging or spawning failed; the child never ran.
    StartFailed { error: String },
    /// A progress line was matched on stdout.
    Progress(ProgressUpdate),
    /// The supervisor reported the child's end.
    Exited(ExitOutcome),
    /// The attempt lost its supervisor or hit an internal error.
    Aborted { error: String },
}

impl AttemptEvent {
    const fn name(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Spawned => "spawned",
            Self::StartFailed { .. } => "start_failed",
            Self::Progress(_) => "progress",
            Self::Exited(_) => "exited",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Attempt already {state}, ignoring {event}")]
    Terminal {
        state: AttemptState,
        event: &'static str,
    },

    #[error("Invalid transition from {from} on {event}")]
    Invalid {
        from: AttemptState,
        event: &'static str,
    },
}

/// One job attempt's lifecycle and progress.
#[derive(Debug, Clone)]
pub struct JobAttempt {
    state: AttemptState,
    progress: u8,
    last_metrics_line: Option<String>,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl Default for JobAttempt {
    fn default() -> Self {
        Self::new()
    }
}

impl JobAttempt {
    pub const fn new() -> Self {
        Self {
            state: AttemptState::Validating,
            progress: 0,
            last_metrics_line: None,
            exit_code: None,
            error: None,
        }
    }

    pub const fn state(&self) -> AttemptState {
        self.state
    }

    pub const fn progress(&self) -> u8 {
        self.progress
    }

    pub fn last_metrics_line(&self) -> Option<&str> {
        self.last_metrics_line.as_deref()
    }

    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Terminal status, once reached.
    pub const fn status(&self) -> Option<JobStatus> {
        match self.state {
            AttemptState::Completed => Some(JobStatus::Completed),
            AttemptState::Failed => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Apply `event`.
    ///
    /// Returns the store mutation it implies, or `None` when nothing needs
    /// persisting (a state change before the record exists, or a progress
    /// line that changes nothing).
    pub fn transition(&mut self, event: AttemptEvent) -> Result<Option<JobUpdate>, StateError> {
        use AttemptEvent as E;
        use AttemptState as S;

        if self.state.is_terminal() {
            return Err(StateError::Terminal {
                state: self.state,
                event: event.name(),
            });
        }

        match (self.state, event) {
            (S::Validating, E::Accepted) => {
                self.state = S::Staging;
                Ok(None)
            }
            (S::Staging, E::Spawned) => {
                self.state = S::Running;
                Ok(None)
            }
            (S::Staging | S::Running, E::StartFailed { error } | E::Aborted { error }) => {
                Ok(Some(self.finish(JobStatus::Failed, None, Some(error))))
            }
            (S::Running, E::Progress(update)) => Ok(self.advance(update)),
            (S::Running, E::Exited(outcome)) => {
                let status = if outcome.success() {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                Ok(Some(self.finish(
                    status,
                    outcome.exit_code(),
                    outcome.failure_reason(),
                )))
            }
            (from, event) => Err(StateError::Invalid {
                from,
                event: event.name(),
            }),
        }
    }

    /// Record a progress line; progress is clamped and never regresses.
    fn advance(&mut self, update: ProgressUpdate) -> Option<JobUpdate> {
        let percent = update.percent.min(100).max(self.progress);
        if percent == self.progress && self.last_metrics_line.as_deref() == Some(&update.line) {
            return None;
        }
        self.progress = percent;
        self.last_metrics_line = Some(update.line.clone());
        Some(JobUpdate {
            progress: Some(percent),
            last_metrics_line: Some(update.line),
            ..JobUpdate::default()
        })
    }

    fn finish(
        &mut self,
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> JobUpdate {
        self.state = match status {
            JobStatus::Completed => AttemptState::Completed,
            JobStatus::Running | JobStatus::Failed => AttemptState::Failed,
        };
        if status == JobStatus::Completed {
            self.progress = 100;
        }
        self.exit_code = exit_code;
        self.error.clone_from(&error);

        JobUpdate {
            progress: (status == JobStatus::Completed).then_some(100),
            last_metrics_line: None,
            status: Some(status),
            exit_code,
            error,
            completed_at: Some(unix_timestamp()),
        }
    }
}
