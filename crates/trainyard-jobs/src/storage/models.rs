//! Database models for the job state store.

use serde::{Deserialize, Serialize};

/// Job record from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub kind: String,
    pub action: String,
    /// Request parameters as JSON text.
    pub parameters: String,
    pub status: String,
    pub progress: i64,
    pub last_metrics_line: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl JobRecord {
    /// Parsed status, `None` for values written by something else.
    pub fn job_status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}

/// Audit log entry from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    /// Serialized request context (JSON text).
    pub details: String,
    pub status: String,
    pub timestamp: i64,
}

/// Job status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
}

impl AuditStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Insert payload for a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub kind: String,
    pub action: String,
    pub parameters: String,
    /// Initial status: `Running` after a spawn, `Failed` when the attempt
    /// never got that far.
    pub status: JobStatus,
    pub error: Option<String>,
}

/// Partial update of a job record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub progress: Option<u8>,
    pub last_metrics_line: Option<String>,
    pub status: Option<JobStatus>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub completed_at: Option<i64>,
}

impl JobUpdate {
    /// Whether this update moves the job into a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(JobStatus::is_terminal)
    }
}

/// Insert payload for an audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEntry {
    pub action: String,
    pub details: String,
    pub status: AuditStatus,
}
