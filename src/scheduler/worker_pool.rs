//! Worker pool for processing scan jobs from the work queue.
//!
//! Each [`Worker`] runs as an independent async task with one job in flight
//! at a time. Per job it:
//!
//! 1. Pops the head of the queue, waiting at most `poll_timeout`
//! 2. Parses the entry; a malformed entry is logged and dropped
//! 3. Marks the job `running` in the store and mirrors it into the cache
//! 4. Checks scan authorization, then runs the [`ScanExecutor`]
//! 5. Marks the job `done` (with its result artifact) or `error`
//!
//! # Features
//!
//! - Graceful shutdown with broadcast channel; the in-flight job finishes
//! - Queue errors back off (doubling) instead of stopping the loop
//! - Worker 0 runs the stuck-job [`Reconciler`] at startup and on an interval
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ScanAuthorization, WorkerConfig};
use crate::error::JobFailure;
use crate::retry::{loop_backoff, with_backoff};
use crate::runner::{load_result_artifact, ScanExecutor, ScanOutput, ScanRequest};
use crate::storage::JobStore;

use super::job::{JobStatus, QueueEntry};
use super::progress::ProgressTracker;
use super::queue::{QueueError, StatusCache, WorkQueue};
use super::reconciler::Reconciler;

/// Longest slice of a malformed payload echoed into the logs.
const MALFORMED_PREVIEW_CHARS: usize = 200;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Worker initialization failed.
    #[error("Worker initialization failed: {0}")]
    WorkerInitFailed(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Everything a worker needs besides its own queue connection.
#[derive(Clone)]
pub struct WorkerContext {
    pub cache: Arc<dyn StatusCache>,
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn ScanExecutor>,
    pub authorization: ScanAuthorization,
    pub config: WorkerConfig,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed.
    pub jobs_failed: u64,
    /// Queue payloads dropped as malformed.
    pub entries_dropped: u64,
    /// Jobs failed by the reconciler.
    pub jobs_reconciled: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    entries_dropped: AtomicU64,
    jobs_reconciled: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            entries_dropped: AtomicU64::new(0),
            jobs_reconciled: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_dropped(&self) {
        self.entries_dropped.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reconciled(&self, count: usize) {
        self.jobs_reconciled
            .fetch_add(count as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            entries_dropped: self.entries_dropped.load(Ordering::SeqCst),
            jobs_reconciled: self.jobs_reconciled.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that runs several workers against the same queue.
pub struct WorkerPool {
    context: WorkerContext,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    num_workers: usize,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Creates a pool; workers start with [`WorkerPool::start`].
    ///
    /// The default shutdown timeout leaves room for an in-flight job to
    /// run to its own timeout.
    pub fn new(context: WorkerContext) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_timeout = context.config.job_timeout + Duration::from_secs(60);

        Self {
            context,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            num_workers: 0,
            shutdown_timeout,
        }
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Starts one worker per queue connection.
    ///
    /// `BLPOP` blocks the connection it runs on, so each worker gets its
    /// own. Worker 0 also runs the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running
    /// and `PoolError::WorkerInitFailed` if `queues` is empty.
    pub fn start(&mut self, queues: Vec<Arc<dyn WorkQueue>>) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if queues.is_empty() {
            return Err(PoolError::WorkerInitFailed(
                "at least one worker is required".to_string(),
            ));
        }

        self.num_workers = queues.len();
        for (i, queue) in queues.into_iter().enumerate() {
            let mut worker = Worker::new(
                format!("worker-{}", i),
                queue,
                self.context.clone(),
                self.shutdown_tx.subscribe(),
            )
            .with_shared_stats(Arc::clone(&self.stats));

            if i == 0 {
                worker = worker.with_reconciler(Reconciler::new(
                    Arc::clone(&self.context.store),
                    Arc::clone(&self.context.cache),
                    self.context.config.stale_after,
                ));
            }

            let handle = tokio::spawn(async move {
                worker.run().await;
            });
            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.num_workers,
            executor = %self.context.executor.name(),
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop popping new entries; a job already in flight runs to
    /// completion (bounded by its own timeout).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}

/// Result of one [`Worker::poll_once`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The pop timed out with nothing to do.
    Idle,
    /// The payload could not be parsed and was dropped.
    Malformed,
    /// The store was unreachable; the entry went back to the queue head.
    Requeued { job_id: String },
    /// The job was not `queued` in the store (already claimed or terminal).
    Skipped { job_id: String },
    /// The job reached `done`.
    Completed { job_id: String },
    /// The job reached `error` with `message`.
    Failed { job_id: String, message: String },
}

/// A single worker that processes jobs from the queue.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    queue: Arc<dyn WorkQueue>,
    context: WorkerContext,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    reconciler: Option<Reconciler>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Creates a worker consuming `queue`.
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn WorkQueue>,
        context: WorkerContext,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            context,
            shutdown_rx,
            reconciler: None,
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Makes this worker run `reconciler` at startup and every
    /// `reconcile_interval`.
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    fn with_shared_stats(mut self, stats: Arc<SharedPoolStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns this worker's statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(1)
    }

    /// Main worker loop.
    ///
    /// Pops and processes jobs until a shutdown signal is received. The
    /// signal is checked between pops, so a job in flight always finishes.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        let mut next_reconcile = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.shutdown_requested() {
                info!(worker_id = %self.id, "Worker received shutdown signal");
                break;
            }

            if self.reconciler.is_some() && Instant::now() >= next_reconcile {
                self.reconcile().await;
                next_reconcile = Instant::now() + self.context.config.reconcile_interval;
            }

            let delay = match self.poll_once().await {
                Ok(PollOutcome::Requeued { .. }) => {
                    consecutive_errors += 1;
                    Some(self.error_delay(consecutive_errors))
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    None
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let delay = self.error_delay(consecutive_errors);
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to pop from work queue"
                    );
                    Some(delay)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown_rx.recv() => {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) => true,
            Err(broadcast::error::TryRecvError::Closed) => true,
            // Only shutdown is ever sent, so a lagged receiver missed one
            Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            Err(broadcast::error::TryRecvError::Empty) => false,
        }
    }

    fn error_delay(&self, consecutive_errors: u32) -> Duration {
        loop_backoff(
            consecutive_errors,
            self.context.config.error_backoff,
            self.context.config.max_error_backoff,
        )
    }

    async fn reconcile(&self) {
        let Some(reconciler) = &self.reconciler else {
            return;
        };
        match reconciler.reconcile_once().await {
            Ok(failed) => self.stats.record_reconciled(failed.len()),
            Err(e) => warn!(worker_id = %self.id, error = %e, "Reconciliation failed"),
        }
    }

    /// Pops at most one entry and drives it to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns the queue error when the pop itself failed.
    pub async fn poll_once(&self) -> Result<PollOutcome, QueueError> {
        match self.queue.pop(self.context.config.poll_timeout).await? {
            Some(raw) => Ok(self.process_entry(&raw).await),
            None => {
                debug!(worker_id = %self.id, "No jobs available");
                Ok(PollOutcome::Idle)
            }
        }
    }

    /// Processes one raw queue payload.
    pub async fn process_entry(&self, raw: &str) -> PollOutcome {
        let entry = match QueueEntry::parse(raw) {
            Ok(entry) => entry,
            Err(e) => {
                let preview: String = raw.chars().take(MALFORMED_PREVIEW_CHARS).collect();
                warn!(
                    worker_id = %self.id,
                    error = %e,
                    payload = %preview,
                    "Dropping malformed queue entry"
                );
                self.stats.record_dropped();
                return PollOutcome::Malformed;
            }
        };
        let job_id = entry.job_id.clone();

        let claimed = with_backoff("mark running", self.context.config.store_retry, || {
            self.context
                .store
                .mark_running(&entry.job_id, &entry.target, &entry.user_id)
        })
        .await;

        match claimed {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    "Job is not queued in the store, skipping"
                );
                return PollOutcome::Skipped { job_id };
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Could not mark job running, returning it to the queue"
                );
                if let Err(requeue_err) = self.queue.requeue_front(raw).await {
                    error!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        error = %requeue_err,
                        "Failed to requeue job, it is lost"
                    );
                }
                return PollOutcome::Requeued { job_id };
            }
        }

        self.mirror_status(&job_id, JobStatus::Running).await;
        info!(
            worker_id = %self.id,
            job_id = %job_id,
            target = %entry.target,
            "Processing job"
        );

        self.stats.increment_active();
        let start_time = Instant::now();
        let mut tracker = ProgressTracker::new(job_id.clone(), Arc::clone(&self.context.store));
        let result = self.execute(&entry, &mut tracker).await;
        let duration = start_time.elapsed();
        self.stats.decrement_active();

        match result {
            Ok(output) => {
                self.finish_done(&entry, output, &mut tracker).await;
                self.stats.record_completion(duration);
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed successfully"
                );
                PollOutcome::Completed { job_id }
            }
            Err(failure) => {
                let message = failure.to_string();
                self.finish_error(&job_id, &message, &mut tracker).await;
                self.stats.record_failure(duration);
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    kind = failure.kind(),
                    error = %message,
                    "Job failed"
                );
                PollOutcome::Failed { job_id, message }
            }
        }
    }

    /// Runs the executor while feeding its progress events to `tracker`.
    async fn execute(
        &self,
        entry: &QueueEntry,
        tracker: &mut ProgressTracker,
    ) -> Result<ScanOutput, JobFailure> {
        self.context.authorization.check()?;

        let request = ScanRequest {
            job_id: entry.job_id.clone(),
            target: entry.target.clone(),
            timeout: self.context.config.job_timeout,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        let execution = self.context.executor.execute(&request, tx);
        let forward = async {
            while let Some(event) = rx.recv().await {
                tracker.apply(event).await;
            }
        };

        let (result, ()) = tokio::join!(execution, forward);
        result
    }

    async fn finish_done(
        &self,
        entry: &QueueEntry,
        output: ScanOutput,
        tracker: &mut ProgressTracker,
    ) {
        let results = match output.result_ref.as_deref() {
            Some(result_ref) => load_result_artifact(result_ref).await,
            None => None,
        };

        // Progress is only written while the row is still running.
        tracker.complete_scan("Scan completed successfully").await;

        let written = with_backoff("mark done", self.context.config.store_retry, || {
            self.context.store.mark_done(
                &entry.job_id,
                output.result_ref.as_deref(),
                results.as_ref(),
            )
        })
        .await;
        self.after_terminal_write(&entry.job_id, JobStatus::Done, written.map_err(|e| e.to_string()))
            .await;
    }

    async fn finish_error(&self, job_id: &str, message: &str, tracker: &mut ProgressTracker) {
        tracker.report_error(message).await;

        let written = with_backoff("mark error", self.context.config.store_retry, || {
            self.context.store.mark_error(job_id, message)
        })
        .await;
        self.after_terminal_write(job_id, JobStatus::Error, written.map_err(|e| e.to_string()))
            .await;
    }

    async fn after_terminal_write(
        &self,
        job_id: &str,
        status: JobStatus,
        written: Result<bool, String>,
    ) {
        match written {
            Ok(true) => self.mirror_status(job_id, status).await,
            Ok(false) => warn!(
                worker_id = %self.id,
                job_id = %job_id,
                status = %status,
                "Job was no longer running, terminal status not written"
            ),
            // The row stays running; the reconciler fails it once stale.
            Err(e) => error!(
                worker_id = %self.id,
                job_id = %job_id,
                status = %status,
                error = %e,
                "Failed to write terminal status"
            ),
        }
    }

    async fn mirror_status(&self, job_id: &str, status: JobStatus) {
        if let Err(e) = self.context.cache.set_status(job_id, status).await {
            warn!(
                worker_id = %self.id,
                job_id = %job_id,
                error = %e,
                "Could not mirror status into cache"
            );
        }
    }
}
