#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for job attempts.
//!
//! Fake programs are `sh -c` scripts; the staged config path arrives as
//! `$1` (or `$2` after a `--config` flag).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use trainyard_core::config::RetryConfig;
use trainyard_jobs::orchestrator::{JobRequest, Orchestrator, OrchestratorSettings};
use trainyard_jobs::registry::{Invocation, ProgramRegistry};
use trainyard_jobs::storage::{
    AuditStatus, Database, JobStateStore, JobStatus, MemoryStore, StoreWrite,
};
use trainyard_jobs::stream::{JobEvent, MultiplexerError};

fn sh(script: &str) -> Invocation {
    Invocation {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string(), "job".to_string()],
        config_flag: None,
        working_directory: None,
    }
}

fn settings(staging_dir: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        staging_dir: staging_dir.to_path_buf(),
        max_output_bytes: 1024 * 1024,
        max_concurrent_jobs: 4,
        job_timeout: None,
        terminate_grace: Duration::from_secs(1),
        subscriber_buffer: 64,
        subscriber_stall: Duration::from_secs(30),
        store_retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
        },
    }
}

fn registry(programs: &[(&str, Invocation)]) -> ProgramRegistry {
    ProgramRegistry::new(
        programs
            .iter()
            .map(|(kind, invocation)| ((*kind).to_string(), invocation.clone())),
    )
}

fn memory_orchestrator(
    staging_dir: &Path,
    programs: &[(&str, Invocation)],
) -> (Orchestrator<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(
        registry(programs),
        Arc::clone(&store),
        settings(staging_dir),
    );
    (orchestrator, store)
}

fn progress_of(events: &[JobEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect()
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, Iterator::count)
}

#[tokio::test]
async fn training_job_streams_progress_and_completes() {
    let dir = tempfile::TempDir::new().unwrap();
    let staging = dir.path().join("configs");
    let script = r#"
        cat "$1"; echo
        echo "Epoch 1/4 loss=0.9"
        echo "Epoch 2/4 loss=0.5"
        echo "warming up" >&2
        echo "Epoch 4/4 loss=0.1"
    "#;
    let (orchestrator, store) = memory_orchestrator(&staging, &[("run_yolo", sh(script))]);

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({"epochs": 4}));
    let (handle, stream) = orchestrator.submit_streaming(request).unwrap();
    let events: Vec<JobEvent> = stream.collect().await;
    let report = handle.wait().await;

    assert!(report.success());
    assert_eq!(report.exit_code, Some(0));
    assert!(report.stdout.contains(r#""epochs": 4"#));
    assert_eq!(report.stderr, "warming up\n");
    assert_eq!(progress_of(&events), vec![25, 50, 100]);

    // Exactly one terminal event, and it is the last.
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);
    let Some(JobEvent::Terminal(outcome)) = events.last() else {
        panic!("last event must be terminal");
    };
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.job_id, report.job_id);

    let id = report.job_id.unwrap();
    assert_eq!(
        store.status_history(id),
        vec![JobStatus::Running, JobStatus::Completed]
    );
    assert_eq!(store.terminal_writes(id), 1);

    let record = store.get_job(id).await.unwrap();
    assert_eq!(record.progress, 100);
    assert_eq!(record.last_metrics_line.as_deref(), Some("Epoch 4/4 loss=0.1"));
    assert!(record.completed_at.is_some());

    let audit = store.audit_entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status, AuditStatus::Success.as_str());
    let details: serde_json::Value = serde_json::from_str(&audit[0].details).unwrap();
    assert_eq!(details["kind"], "run_yolo");
    assert_eq!(details["job_id"], id);
    assert_eq!(details["parameters"]["epochs"], 4);

    assert_eq!(staged_files(&staging), 0);
}

#[tokio::test]
async fn progress_line_split_across_chunks() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = "printf 'Epoch 3/1'; sleep 0.2; printf '0\\n'; sleep 0.2; exit 1";
    let (orchestrator, store) = memory_orchestrator(dir.path(), &[("run_yolo", sh(script))]);

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let (handle, stream) = orchestrator.submit_streaming(request).unwrap();
    let events: Vec<JobEvent> = stream.collect().await;
    let report = handle.wait().await;

    assert_eq!(progress_of(&events), vec![30]);
    assert_eq!(report.status, JobStatus::Failed);
    let record = store.get_job(report.job_id.unwrap()).await.unwrap();
    assert_eq!(record.progress, 30);
    assert_eq!(record.last_metrics_line.as_deref(), Some("Epoch 3/10"));
}

#[tokio::test]
async fn non_training_action_only_jumps_to_done() {
    let dir = tempfile::TempDir::new().unwrap();
    let (orchestrator, store) =
        memory_orchestrator(dir.path(), &[("collect_images", sh("echo Epoch 5/10"))]);

    let request = JobRequest::new("collect_images", "collect", serde_json::json!({}));
    let (handle, stream) = orchestrator.submit_streaming(request).unwrap();
    let events: Vec<JobEvent> = stream.collect().await;
    let report = handle.wait().await;

    assert!(progress_of(&events).is_empty());
    assert!(report.success());
    let record = store.get_job(report.job_id.unwrap()).await.unwrap();
    assert_eq!(record.progress, 100);
    assert_eq!(record.last_metrics_line, None);
}

#[tokio::test]
async fn non_zero_exit_fails_and_cleans_up() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = r#"echo "$1" >&2; echo "bad dataset" >&2; exit 3"#;
    let (orchestrator, store) = memory_orchestrator(dir.path(), &[("run_yolo", sh(script))]);

    let result = orchestrator
        .run(JobRequest::new("run_yolo", "train", serde_json::json!({})))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    let config_path = PathBuf::from(result.stderr.lines().next().unwrap());
    assert!(config_path.starts_with(dir.path()));
    assert!(!config_path.exists(), "staged config must be removed");
    assert!(result.stderr.contains("bad dataset"));

    let jobs = store.list_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_status(), Some(JobStatus::Failed));
    assert_eq!(jobs[0].exit_code, Some(3));
    assert_eq!(jobs[0].error.as_deref(), Some("Exited with code 3"));
    assert_eq!(store.terminal_writes(jobs[0].id), 1);

    let audit = store.audit_entries();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status, "error");
}

#[tokio::test]
async fn config_flag_precedes_staged_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut invocation = sh(r#"[ "$1" = "--config" ] && cat "$2""#);
    invocation.config_flag = Some("--config".to_string());
    let (orchestrator, _store) = memory_orchestrator(dir.path(), &[("run_yolo", invocation)]);

    let result = orchestrator
        .run(JobRequest::new(
            "run_yolo",
            "predict",
            serde_json::json!({"mode": "predict"}),
        ))
        .await
        .unwrap();

    assert!(result.success);
    let staged: serde_json::Value = serde_json::from_str(&result.stdout).unwrap();
    assert_eq!(staged, serde_json::json!({"mode": "predict"}));
}

#[tokio::test]
async fn unknown_kind_has_no_side_effects() {
    let dir = tempfile::TempDir::new().unwrap();
    let staging = dir.path().join("configs");
    let marker = dir.path().join("ran");
    let script = format!("touch {}", marker.display());
    let (orchestrator, store) = memory_orchestrator(&staging, &[("run_yolo", sh(&script))]);

    for kind in ["rm", "run_yolo.py", "RUN_YOLO", "../run_yolo", ""] {
        let err = orchestrator
            .submit(JobRequest::new(kind, "train", serde_json::json!({})))
            .unwrap_err();
        assert_eq!(err.kind, kind);
    }
    let err = orchestrator
        .run(JobRequest::new("nope", "train", serde_json::json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, "nope");

    assert_eq!(store.job_count(), 0);
    assert!(store.writes().is_empty());
    assert!(!marker.exists());
    assert!(!staging.exists());
}

#[tokio::test]
async fn spawn_failure_goes_straight_to_failed() {
    let dir = tempfile::TempDir::new().unwrap();
    let missing = Invocation {
        program: PathBuf::from("/nonexistent/trainyard-missing-program"),
        args: Vec::new(),
        config_flag: None,
        working_directory: None,
    };
    let (orchestrator, store) = memory_orchestrator(dir.path(), &[("run_yolo", missing)]);

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let (handle, stream) = orchestrator.submit_streaming(request).unwrap();
    let events: Vec<JobEvent> = stream.collect().await;
    let report = handle.wait().await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.exit_code, None);
    assert!(report.error.is_some());

    let [JobEvent::Terminal(outcome)] = events.as_slice() else {
        panic!("expected only a terminal event, got {events:?}");
    };
    assert!(outcome.spawn_error.is_some());
    assert_eq!(outcome.status, JobStatus::Failed);

    let id = report.job_id.unwrap();
    assert_eq!(store.status_history(id), vec![JobStatus::Failed]);
    assert_eq!(store.terminal_writes(id), 1);
    assert!(store.get_job(id).await.unwrap().completed_at.is_some());
    assert_eq!(store.audit_entries().len(), 1);
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn staging_failure_never_spawns() {
    let dir = tempfile::TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let marker = dir.path().join("ran");
    let script = format!("touch {}", marker.display());
    let (orchestrator, store) =
        memory_orchestrator(&blocker.join("configs"), &[("run_yolo", sh(&script))]);

    let result = orchestrator
        .run(JobRequest::new("run_yolo", "train", serde_json::json!({})))
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!marker.exists());
    let jobs = store.list_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(store.status_history(jobs[0].id), vec![JobStatus::Failed]);
    assert!(jobs[0].error.as_deref().unwrap().contains("staged config"));
    assert_eq!(store.audit_entries().len(), 1);
}

#[tokio::test]
async fn unavailable_store_still_runs_the_job() {
    let dir = tempfile::TempDir::new().unwrap();
    let (orchestrator, store) = memory_orchestrator(dir.path(), &[("run_yolo", sh("echo done"))]);
    // First write plus three retries.
    store.fail_next_writes(4);

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let report = orchestrator.submit(request).unwrap().wait().await;

    assert!(report.success());
    assert_eq!(report.stdout, "done\n");
    assert_eq!(report.job_id, None);
    assert_eq!(report.store_errors, 1);
    assert_eq!(store.job_count(), 0);
    // The audit entry is written once the store recovers.
    assert_eq!(store.audit_entries().len(), 1);
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let dir = tempfile::TempDir::new().unwrap();
    let (orchestrator, store) = memory_orchestrator(dir.path(), &[("run_yolo", sh("true"))]);
    store.fail_next_writes(2);

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let report = orchestrator.submit(request).unwrap().wait().await;

    assert_eq!(report.store_errors, 0);
    let id = report.job_id.unwrap();
    assert_eq!(store.terminal_writes(id), 1);
    assert!(matches!(
        store.writes().first(),
        Some(StoreWrite::Create {
            status: JobStatus::Running,
            ..
        })
    ));
}

#[tokio::test]
async fn timeout_fails_the_attempt() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut settings = settings(dir.path());
    settings.job_timeout = Some(Duration::from_millis(300));
    let orchestrator = Orchestrator::new(
        registry(&[("run_yolo", sh("echo started; exec sleep 30"))]),
        Arc::clone(&store),
        settings,
    );

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let report = orchestrator.submit(request).unwrap().wait().await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.stdout, "started\n");
    assert_eq!(report.error.as_deref(), Some("Timed out after 300ms"));
    assert_eq!(store.terminal_writes(report.job_id.unwrap()), 1);
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn concurrency_limit_serializes_attempts() {
    let dir = tempfile::TempDir::new().unwrap();
    let lock = dir.path().join("busy");
    let script = format!(
        "if [ -e {lock} ]; then echo overlap; fi; touch {lock}; sleep 0.2; rm {lock}",
        lock = lock.display()
    );
    let store = Arc::new(MemoryStore::new());
    let mut settings = settings(&dir.path().join("configs"));
    settings.max_concurrent_jobs = 1;
    let orchestrator = Orchestrator::new(
        registry(&[("collect_images", sh(&script))]),
        Arc::clone(&store),
        settings,
    );

    let handles: Vec<_> = (0..3)
        .map(|_| {
            orchestrator
                .submit(JobRequest::new(
                    "collect_images",
                    "collect",
                    serde_json::json!({}),
                ))
                .unwrap()
        })
        .collect();

    for handle in handles {
        let report = handle.wait().await;
        assert!(report.success());
        assert!(!report.stdout.contains("overlap"));
    }
    assert_eq!(store.job_count(), 3);
    assert_eq!(store.audit_entries().len(), 3);
    assert_eq!(orchestrator.available_slots(), 1);
}

#[tokio::test]
async fn concurrent_attempts_get_distinct_configs() {
    let dir = tempfile::TempDir::new().unwrap();
    let (orchestrator, _store) =
        memory_orchestrator(dir.path(), &[("run_yolo", sh(r#"cat "$1""#))]);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            orchestrator
                .submit(JobRequest::new(
                    "run_yolo",
                    "train",
                    serde_json::json!({ "index": i }),
                ))
                .unwrap()
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let report = handle.wait().await;
        let staged: serde_json::Value = serde_json::from_str(&report.stdout).unwrap();
        assert_eq!(staged["index"], i);
    }
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn dropped_subscriber_does_not_abandon_the_attempt() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = "echo hello; sleep 0.2; echo Epoch 1/2; sleep 0.2; echo bye";
    let (orchestrator, store) = memory_orchestrator(dir.path(), &[("run_yolo", sh(script))]);

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let (handle, mut stream) = orchestrator.submit_streaming(request).unwrap();
    assert_eq!(
        stream.next().await,
        Some(JobEvent::Stdout {
            text: "hello\n".to_string()
        })
    );
    drop(stream);

    let report = handle.wait().await;
    assert!(report.success());
    assert!(report.stdout.ends_with("bye\n"));

    let id = report.job_id.unwrap();
    assert_eq!(
        store.status_history(id),
        vec![JobStatus::Running, JobStatus::Completed]
    );
    assert_eq!(store.terminal_writes(id), 1);
    assert_eq!(store.audit_entries().len(), 1);
}

#[tokio::test]
async fn stalled_subscriber_does_not_stall_the_job() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut settings = settings(dir.path());
    settings.subscriber_buffer = 1;
    settings.subscriber_stall = Duration::from_millis(50);
    let orchestrator = Orchestrator::new(
        registry(&[(
            "collect_images",
            sh("i=0; while [ $i -lt 200 ]; do echo image $i; sleep 0.001; i=$((i+1)); done"),
        )]),
        Arc::clone(&store),
        settings,
    );

    let request = JobRequest::new("collect_images", "collect", serde_json::json!({}));
    let (handle, _stream) = orchestrator.submit_streaming(request).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap();
    assert!(report.success());
    assert_eq!(report.stdout.lines().count(), 200);
    assert_eq!(store.terminal_writes(report.job_id.unwrap()), 1);
}

#[tokio::test]
async fn shutdown_fails_running_and_queued_attempts() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut settings = settings(dir.path());
    settings.max_concurrent_jobs = 1;
    settings.terminate_grace = Duration::from_millis(200);
    let orchestrator = Orchestrator::new(
        registry(&[("run_yolo", sh("echo started; exec sleep 30"))]),
        Arc::clone(&store),
        settings,
    );

    let request = JobRequest::new("run_yolo", "train", serde_json::json!({}));
    let (running, mut stream) = orchestrator.submit_streaming(request.clone()).unwrap();
    assert!(matches!(stream.next().await, Some(JobEvent::Stdout { .. })));
    let queued = orchestrator.submit(request).unwrap();
    tokio::task::yield_now().await;

    orchestrator.shutdown();

    let running = tokio::time::timeout(Duration::from_secs(10), running.wait())
        .await
        .unwrap();
    assert_eq!(running.status, JobStatus::Failed);
    assert_eq!(running.error.as_deref(), Some("Interrupted by shutdown"));
    let id = running.job_id.unwrap();
    assert_eq!(
        store.status_history(id),
        vec![JobStatus::Running, JobStatus::Failed]
    );
    assert_eq!(store.terminal_writes(id), 1);

    let queued = tokio::time::timeout(Duration::from_secs(10), queued.wait())
        .await
        .unwrap();
    assert_eq!(queued.status, JobStatus::Failed);
    assert_eq!(queued.error.as_deref(), Some("Interrupted by shutdown"));
    assert_eq!(
        store.status_history(queued.job_id.unwrap()),
        vec![JobStatus::Failed]
    );

    assert_eq!(store.audit_entries().len(), 2);
    assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn subscribe_once_and_late_subscriber_sees_outcome() {
    let dir = tempfile::TempDir::new().unwrap();
    let (orchestrator, _store) = memory_orchestrator(dir.path(), &[("run_yolo", sh("exit 4"))]);

    let handle = orchestrator
        .submit(JobRequest::new("run_yolo", "train", serde_json::json!({})))
        .unwrap();
    let stream = handle.subscribe().unwrap();
    assert_eq!(
        handle.subscribe().unwrap_err(),
        MultiplexerError::AlreadySubscribed
    );

    let events: Vec<JobEvent> = stream.collect().await;
    let Some(JobEvent::Terminal(outcome)) = events.last() else {
        panic!("stream must end with the terminal event");
    };
    assert_eq!(outcome.exit_code, Some(4));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let report = handle.wait().await;
    assert_eq!(report.exit_code, Some(4));
}

#[tokio::test]
async fn sqlite_store_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(Database::open_in_memory().await.unwrap());
    let orchestrator = Orchestrator::new(
        registry(&[("run_yolo", sh("echo 'Epoch 1/2'; echo 'Epoch 2/2'"))]),
        Arc::clone(&db),
        settings(dir.path()),
    );

    let result = orchestrator
        .run(JobRequest::new("run_yolo", "train", serde_json::json!({"epochs": 2})))
        .await
        .unwrap();
    assert!(result.success);

    let jobs = db.list_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_status(), Some(JobStatus::Completed));
    assert_eq!(jobs[0].progress, 100);
    assert_eq!(jobs[0].exit_code, Some(0));
    assert_eq!(jobs[0].last_metrics_line.as_deref(), Some("Epoch 2/2"));
    assert_eq!(jobs[0].parameters, r#"{"epochs":2}"#);

    let audit = db.list_audit(50).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, "train");
    assert_eq!(audit[0].status, "success");
}
