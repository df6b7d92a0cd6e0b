//! In-process job state store.
//!
//! Used by tests and by `trainyard run --ephemeral`. Every write is recorded
//! in order so callers can assert on the exact sequence of mutations, and
//! writes can be made to fail on demand.

use std::sync::{Mutex, MutexGuard, PoisonError};

use trainyard_core::db::unix_timestamp;

use super::db::DatabaseError;
use super::models::{
    AuditEntry, JobRecord, JobStatus, JobUpdate, NewAuditEntry, NewJob,
};
use super::store::JobStateStore;

/// One mutation observed by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Create { id: i64, status: JobStatus },
    Update { id: i64, update: JobUpdate },
    Audit { id: i64, entry: NewAuditEntry },
}

#[derive(Default)]
struct State {
    jobs: Vec<JobRecord>,
    audit: Vec<AuditEntry>,
    writes: Vec<StoreWrite>,
    fail_next_writes: u32,
}

impl State {
    fn injected_failure(&mut self) -> Result<(), DatabaseError> {
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(DatabaseError::Connection("store unavailable".to_string()));
        }
        Ok(())
    }
}

/// Vector-backed [`JobStateStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` writes fail with a connection error.
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_next_writes = n;
    }

    /// Every successful write so far, in order.
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.lock().writes.clone()
    }

    /// Writes that put a job into a terminal status (create or update).
    pub fn terminal_writes(&self, id: i64) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|w| match w {
                StoreWrite::Create { id: wid, status } => *wid == id && status.is_terminal(),
                StoreWrite::Update { id: wid, update } => *wid == id && update.is_terminal(),
                StoreWrite::Audit { .. } => false,
            })
            .count()
    }

    /// Every status a job has been written with, in order.
    pub fn status_history(&self, id: i64) -> Vec<JobStatus> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| match w {
                StoreWrite::Create { id: wid, status } if *wid == id => Some(*status),
                StoreWrite::Update { id: wid, update } if *wid == id => update.status,
                _ => None,
            })
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }
}

impl JobStateStore for MemoryStore {
    async fn create_job(&self, job: &NewJob) -> Result<i64, DatabaseError> {
        let mut state = self.lock();
        state.injected_failure()?;

        let now = unix_timestamp();
        let id = i64::try_from(state.jobs.len()).unwrap_or(i64::MAX) + 1;
        state.jobs.push(JobRecord {
            id,
            kind: job.kind.clone(),
            action: job.action.clone(),
            parameters: job.parameters.clone(),
            status: job.status.as_str().to_string(),
            progress: 0,
            last_metrics_line: None,
            exit_code: None,
            error: job.error.clone(),
            created_at: now,
            updated_at: now,
            completed_at: job.status.is_terminal().then_some(now),
        });
        state.writes.push(StoreWrite::Create {
            id,
            status: job.status,
        });
        Ok(id)
    }

    async fn update_job(&self, id: i64, update: &JobUpdate) -> Result<(), DatabaseError> {
        let mut state = self.lock();
        state.injected_failure()?;

        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {id}")))?;

        if let Some(progress) = update.progress {
            job.progress = i64::from(progress);
        }
        if let Some(line) = &update.last_metrics_line {
            job.last_metrics_line = Some(line.clone());
        }
        if let Some(status) = update.status {
            job.status = status.as_str().to_string();
        }
        if let Some(code) = update.exit_code {
            job.exit_code = Some(i64::from(code));
        }
        if let Some(error) = &update.error {
            job.error = Some(error.clone());
        }
        if update.completed_at.is_some() {
            job.completed_at = update.completed_at;
        }
        job.updated_at = unix_timestamp();

        state.writes.push(StoreWrite::Update {
            id,
            update: update.clone(),
        });
        Ok(())
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, DatabaseError> {
        let mut state = self.lock();
        state.injected_failure()?;

        let id = i64::try_from(state.audit.len()).unwrap_or(i64::MAX) + 1;
        state.audit.push(AuditEntry {
            id,
            action: entry.action.clone(),
            details: entry.details.clone(),
            status: entry.status.as_str().to_string(),
            timestamp: unix_timestamp(),
        });
        state.writes.push(StoreWrite::Audit {
            id,
            entry: entry.clone(),
        });
        Ok(id)
    }

    async fn get_job(&self, id: i64) -> Result<JobRecord, DatabaseError> {
        self.lock()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {id}")))
    }

    async fn list_jobs(&self, limit: u32) -> Result<Vec<JobRecord>, DatabaseError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, DatabaseError> {
        Ok(self
            .lock()
            .audit
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
