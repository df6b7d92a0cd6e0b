//! Database queries for the job state store.

use trainyard_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{AuditEntry, JobRecord, JobUpdate, NewAuditEntry, NewJob};
use super::store::JobStateStore;

impl JobStateStore for Database {
    // =========================================================================
    // Job queries
    // =========================================================================

    async fn create_job(&self, job: &NewJob) -> Result<i64, DatabaseError> {
        let now = unix_timestamp();
        let completed_at = job.status.is_terminal().then_some(now);

        let result = sqlx::query(
            r"
            INSERT INTO jobs (kind, action, parameters, status, error, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&job.kind)
        .bind(&job.action)
        .bind(&job.parameters)
        .bind(job.status.as_str())
        .bind(job.error.as_deref())
        .bind(now)
        .bind(now)
        .bind(completed_at)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_job(&self, id: i64, update: &JobUpdate) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            r"
            UPDATE jobs SET
                progress = COALESCE(?, progress),
                last_metrics_line = COALESCE(?, last_metrics_line),
                status = COALESCE(?, status),
                exit_code = COALESCE(?, exit_code),
                error = COALESCE(?, error),
                completed_at = COALESCE(?, completed_at),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(update.progress.map(i64::from))
        .bind(update.last_metrics_line.as_deref())
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.exit_code.map(i64::from))
        .bind(update.error.as_deref())
        .bind(update.completed_at)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Job {id}")));
        }
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<JobRecord, DatabaseError> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Job {id}")))
    }

    async fn list_jobs(&self, limit: u32) -> Result<Vec<JobRecord>, DatabaseError> {
        let jobs = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(jobs)
    }

    // =========================================================================
    // Audit queries
    // =========================================================================

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<i64, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO audit_log (action, details, status, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(entry.status.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, DatabaseError> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::models::{AuditStatus, JobStatus};
    use super::*;

    async fn test_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn running_job(kind: &str) -> NewJob {
        NewJob {
            kind: kind.to_string(),
            action: "train".to_string(),
            parameters: r#"{"epochs":10}"#.to_string(),
            status: JobStatus::Running,
            error: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let db = test_db().await;
        let id = db.create_job(&running_job("run_yolo")).await.unwrap();

        let job = db.get_job(id).await.unwrap();
        assert_eq!(job.kind, "run_yolo");
        assert_eq!(job.action, "train");
        assert_eq!(job.job_status(), Some(JobStatus::Running));
        assert_eq!(job.progress, 0);
        assert!(job.completed_at.is_none());
        assert_eq!(job.parameters, r#"{"epochs":10}"#);
    }

    #[tokio::test]
    async fn failed_job_is_created_terminal() {
        let db = test_db().await;
        let id = db
            .create_job(&NewJob {
                status: JobStatus::Failed,
                error: Some("No such file or directory".to_string()),
                ..running_job("run_yolo")
            })
            .await
            .unwrap();

        let job = db.get_job(id).await.unwrap();
        assert_eq!(job.job_status(), Some(JobStatus::Failed));
        assert!(job.completed_at.is_some());
        assert_eq!(job.error.as_deref(), Some("No such file or directory"));
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields() {
        let db = test_db().await;
        let id = db.create_job(&running_job("run_yolo")).await.unwrap();

        db.update_job(
            id,
            &JobUpdate {
                progress: Some(30),
                last_metrics_line: Some("Epoch 3/10".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.update_job(
            id,
            &JobUpdate {
                status: Some(JobStatus::Completed),
                exit_code: Some(0),
                completed_at: Some(unix_timestamp()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let job = db.get_job(id).await.unwrap();
        assert_eq!(job.progress, 30);
        assert_eq!(job.last_metrics_line.as_deref(), Some("Epoch 3/10"));
        assert_eq!(job.job_status(), Some(JobStatus::Completed));
        assert_eq!(job.exit_code, Some(0));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let db = test_db().await;
        let err = db.update_job(42, &JobUpdate::default()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_jobs_newest_first() {
        let db = test_db().await;
        let first = db.create_job(&running_job("collect_images")).await.unwrap();
        let second = db.create_job(&running_job("run_yolo")).await.unwrap();

        let jobs = db.list_jobs(10).await.unwrap();
        assert_eq!(
            jobs.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![second, first]
        );
        assert_eq!(db.list_jobs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn audit_entries_append_and_list() {
        let db = test_db().await;
        db.append_audit(&NewAuditEntry {
            action: "train".to_string(),
            details: r#"{"kind":"run_yolo"}"#.to_string(),
            status: AuditStatus::Success,
        })
        .await
        .unwrap();
        db.append_audit(&NewAuditEntry {
            action: "predict".to_string(),
            details: "{}".to_string(),
            status: AuditStatus::Error,
        })
        .await
        .unwrap();

        let entries = db.list_audit(50).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "predict");
        assert_eq!(entries[0].status, "error");
        assert_eq!(entries[1].status, "success");
    }

    #[tokio::test]
    async fn progress_outside_range_is_rejected_by_schema() {
        let db = test_db().await;
        let id = db.create_job(&running_job("run_yolo")).await.unwrap();
        let result = db
            .update_job(
                id,
                &JobUpdate {
                    progress: Some(101),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.is_err());
    }
}
