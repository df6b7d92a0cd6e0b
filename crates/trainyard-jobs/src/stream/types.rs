//! Event types delivered to a job's live subscriber.

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;

use crate::storage::JobStatus;

/// One normalized event of a job attempt.
///
/// Serialized with a `type` tag, e.g. `{"type":"progress","percent":30,...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Stdout { text: String },
    Stderr { text: String },
    Progress { percent: u8, line: String },
    Terminal(TerminalOutcome),
}

impl JobEvent {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

/// Final outcome of an attempt, carried by [`JobEvent::Terminal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutcome {
    /// Store id, absent when the record could not be created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Set when the program could not be started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TerminalOutcome {
    pub fn success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Multiplexer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiplexerError {
    #[error("A subscriber is already attached to this job")]
    AlreadySubscribed,
}

/// The subscriber's end of a job's event channel. Ends after the terminal
/// event.
#[derive(Debug)]
pub struct EventStream {
    inner: ReceiverStream<JobEvent>,
}

impl EventStream {
    pub(crate) const fn new(inner: ReceiverStream<JobEvent>) -> Self {
        Self { inner }
    }
}

impl Stream for EventStream {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
