//! The job state store boundary consumed by the orchestrator.

use std::future::Future;

use super::db::DatabaseError;
use super::models::{AuditEntry, JobRecord, JobUpdate, NewAuditEntry, NewJob};

/// Durable storage for job records and the audit log.
///
/// Passed into the orchestrator at construction; [`Database`](super::Database)
/// is the production implementation and [`MemoryStore`](super::MemoryStore)
/// the in-process fake.
pub trait JobStateStore: Send + Sync + 'static {
    /// Insert a job record, returning its store-assigned id.
    fn create_job(
        &self,
        job: &NewJob,
    ) -> impl Future<Output = Result<i64, DatabaseError>> + Send;

    /// Apply a partial update to a job record.
    fn update_job(
        &self,
        id: i64,
        update: &JobUpdate,
    ) -> impl Future<Output = Result<(), DatabaseError>> + Send;

    /// Append an audit entry, returning its id.
    fn append_audit(
        &self,
        entry: &NewAuditEntry,
    ) -> impl Future<Output = Result<i64, DatabaseError>> + Send;

    /// Fetch one job record.
    fn get_job(&self, id: i64) -> impl Future<Output = Result<JobRecord, DatabaseError>> + Send;

    /// Most recent job records first.
    fn list_jobs(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<JobRecord>, DatabaseError>> + Send;

    /// Most recent audit entries first.
    fn list_audit(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<AuditEntry>, DatabaseError>> + Send;
}
