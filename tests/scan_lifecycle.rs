//! End-to-end job lifecycle tests over the in-memory queue and store.

use std::sync::Arc;
use std::time::Duration;

use recon_queue::config::{ScanAuthorization, WorkerConfig};
use recon_queue::retry::RetryPolicy;
use recon_queue::runner::{MockExecutor, MockOutcome};
use recon_queue::scheduler::{
    JobStatus, MemoryQueue, MemoryStore, PollOutcome, Producer, Reconciler, StatusCache,
    WorkQueue, Worker, WorkerContext, WorkerPool, STALE_JOB_MESSAGE,
};
use recon_queue::storage::JobStore;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Setup {
    queue: Arc<MemoryQueue>,
    store: Arc<MemoryStore>,
    context: WorkerContext,
    producer: Producer,
    _results: TempDir,
}

fn setup(outcome: MockOutcome) -> Setup {
    let results = TempDir::new().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let authorization = ScanAuthorization::granted();

    let executor = MockExecutor::new(results.path())
        .with_phase_delay(Duration::from_millis(5))
        .with_outcome(outcome);
    let context = WorkerContext {
        cache: queue.clone(),
        store: store.clone(),
        executor: Arc::new(executor),
        authorization,
        config: WorkerConfig::default()
            .with_poll_timeout(Duration::from_millis(20))
            .with_job_timeout(Duration::from_millis(500))
            .with_store_retry(RetryPolicy::none())
            .with_error_backoff(Duration::from_millis(10), Duration::from_millis(50)),
    };
    let producer =
        Producer::new(queue.clone(), queue.clone(), authorization).with_store(store.clone());

    Setup {
        queue,
        store,
        context,
        producer,
        _results: results,
    }
}

fn worker(setup: &Setup) -> (Worker, broadcast::Sender<()>) {
    let (tx, rx) = broadcast::channel(1);
    let worker = Worker::new("it-worker", setup.queue.clone(), setup.context.clone(), rx);
    (worker, tx)
}

#[tokio::test]
async fn test_enqueued_job_runs_to_done() {
    let setup = setup(MockOutcome::Succeed);
    let position = setup
        .producer
        .enqueue("j1", "example.com", "u1")
        .await
        .unwrap();
    assert_eq!(position, 1);

    let queued = setup.store.get("j1").await.unwrap().unwrap();
    assert_eq!(queued.status, JobStatus::Queued);

    let (worker, _tx) = worker(&setup);
    let outcome = worker.poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            job_id: "j1".to_string()
        }
    );

    let record = setup.store.get("j1").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert!(record.completed_at.is_some());
    assert!(record.error_message.is_none());
    assert!(record.results.is_some());
    assert_eq!(record.progress.as_ref().map(|p| p.progress), Some(100));

    let cached = setup.queue.get_status("j1").await.unwrap().unwrap();
    assert_eq!(cached.get("status").map(String::as_str), Some("done"));
    assert_eq!(setup.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_executor_records_error() {
    let setup = setup(MockOutcome::Fail {
        code: 2,
        stderr: "nmap: host unreachable".to_string(),
    });
    setup
        .producer
        .enqueue("j2", "example.com", "u1")
        .await
        .unwrap();

    let (worker, _tx) = worker(&setup);
    match worker.poll_once().await.unwrap() {
        PollOutcome::Failed { job_id, message } => {
            assert_eq!(job_id, "j2");
            assert!(message.contains("host unreachable"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let record = setup.store.get("j2").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.completed_at.is_some());
    assert!(record.progress.as_ref().map(|p| p.progress).unwrap_or(0) < 100);
}

#[tokio::test]
async fn test_hung_executor_times_out() {
    let setup = setup(MockOutcome::Hang);
    setup
        .producer
        .enqueue("j3", "example.com", "u1")
        .await
        .unwrap();

    let (worker, _tx) = worker(&setup);
    let outcome = worker.poll_once().await.unwrap();
    assert!(matches!(outcome, PollOutcome::Failed { .. }));

    let record = setup.store.get("j3").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_malformed_entry_does_not_block_queue() {
    let setup = setup(MockOutcome::Succeed);
    setup.queue.push("{not json").await.unwrap();
    setup
        .producer
        .enqueue("j4", "example.com", "u1")
        .await
        .unwrap();

    let (worker, _tx) = worker(&setup);
    assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Malformed);
    assert!(matches!(
        worker.poll_once().await.unwrap(),
        PollOutcome::Completed { .. }
    ));
    assert_eq!(worker.stats().entries_dropped, 1);
}

#[tokio::test]
async fn test_stale_running_job_is_failed_once() {
    let setup = setup(MockOutcome::Succeed);
    setup
        .producer
        .enqueue("j5", "example.com", "u1")
        .await
        .unwrap();
    // A worker claims the job and dies before finishing.
    setup
        .store
        .mark_running("j5", "example.com", "u1")
        .await
        .unwrap();
    setup.queue.pop(Duration::from_millis(10)).await.unwrap();
    assert!(setup
        .store
        .set_updated_at("j5", chrono::Utc::now() - chrono::Duration::hours(2)));

    let reconciler = Reconciler::new(
        setup.store.clone(),
        setup.queue.clone(),
        Duration::from_secs(1800),
    );
    assert_eq!(reconciler.reconcile_once().await.unwrap(), vec!["j5"]);
    assert!(reconciler.reconcile_once().await.unwrap().is_empty());

    let record = setup.store.get("j5").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert_eq!(record.error_message.as_deref(), Some(STALE_JOB_MESSAGE));
    let cached = setup.queue.get_status("j5").await.unwrap().unwrap();
    assert_eq!(cached.get("status").map(String::as_str), Some("error"));
}

#[tokio::test]
async fn test_entry_lost_before_claim_stays_queued() {
    let setup = setup(MockOutcome::Succeed);
    setup
        .producer
        .enqueue("j6", "example.com", "u1")
        .await
        .unwrap();

    // Popped by a worker that crashed before writing `running`.
    let popped = setup.queue.pop(Duration::from_millis(10)).await.unwrap();
    assert!(popped.is_some());
    assert_eq!(setup.queue.len().await.unwrap(), 0);

    let reconciler = Reconciler::new(
        setup.store.clone(),
        setup.queue.clone(),
        Duration::from_millis(1),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(reconciler.reconcile_once().await.unwrap().is_empty());

    let record = setup.store.get("j6").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_finished_job_never_regresses() {
    let setup = setup(MockOutcome::Succeed);
    setup
        .producer
        .enqueue("j7", "example.com", "u1")
        .await
        .unwrap();
    let (worker, _tx) = worker(&setup);
    worker.poll_once().await.unwrap();

    // The same id enqueued again is skipped, not rerun.
    setup
        .producer
        .enqueue("j7", "example.com", "u1")
        .await
        .unwrap();
    assert_eq!(
        worker.poll_once().await.unwrap(),
        PollOutcome::Skipped {
            job_id: "j7".to_string()
        }
    );

    assert!(!setup
        .store
        .mark_running("j7", "example.com", "u1")
        .await
        .unwrap());
    assert!(!setup.store.mark_error("j7", "late failure").await.unwrap());

    let record = setup.store.get("j7").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Done);
    assert!(record.error_message.is_none());
}

#[tokio::test]
async fn test_pool_drains_queue_and_shuts_down() {
    let setup = setup(MockOutcome::Succeed);
    for i in 0..4 {
        setup
            .producer
            .enqueue(&format!("pool-{}", i), "example.com", "u1")
            .await
            .unwrap();
    }

    let queues: Vec<Arc<dyn WorkQueue>> = vec![setup.queue.clone(), setup.queue.clone()];
    let mut pool =
        WorkerPool::new(setup.context.clone()).with_shutdown_timeout(Duration::from_secs(5));
    pool.start(queues).unwrap();
    assert!(pool.is_running());
    assert_eq!(pool.num_workers(), 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pool.stats().jobs_completed < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pool.shutdown().await.unwrap();
    assert!(!pool.is_running());
    assert_eq!(pool.stats().jobs_completed, 4);
    assert!(setup
        .store
        .records()
        .iter()
        .all(|r| r.status == JobStatus::Done));
}

#[tokio::test]
async fn test_unauthorized_worker_fails_every_job() {
    let mut setup = setup(MockOutcome::Succeed);
    setup.context.authorization = ScanAuthorization::denied();
    setup
        .producer
        .enqueue("j8", "example.com", "u1")
        .await
        .unwrap();

    let (worker, _tx) = worker(&setup);
    assert!(matches!(
        worker.poll_once().await.unwrap(),
        PollOutcome::Failed { .. }
    ));
    let record = setup.store.get("j8").await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Error);
    assert!(record.error_message.unwrap().contains("ALLOW_SCANS"));
}
