//! Scan job scheduling: producer, work queue, worker pool and reconciler.
//!
//! This module provides the job lifecycle around an external scan executor:
//!
//! - **Producer**: validates a request and pushes it onto the work queue
//! - **JobQueue**: Redis list (`RPUSH` / `BLPOP`) plus a `job:{id}` status hash
//! - **WorkerPool**: workers that claim jobs and drive them to a terminal state
//! - **ProgressTracker**: per-job phase progress written to the job store
//! - **Reconciler**: fails jobs left `running` by a crashed worker
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │ RPUSH
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │    Queue     │
//!                      └──────┬───────┘
//!                             │ BLPOP
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │                   │                   │
//!         └─────────► scans table + job:{id} ◄────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use recon_queue::config::{QueueConfig, ScanAuthorization, WorkerConfig};
//! use recon_queue::retry::RetryPolicy;
//! use recon_queue::runner::MockExecutor;
//! use recon_queue::scheduler::{JobQueue, Producer, WorkerContext, WorkerPool};
//!
//! let queue = Arc::new(JobQueue::connect(&QueueConfig::default(), RetryPolicy::startup()).await?);
//! let producer = Producer::new(queue.clone(), queue.clone(), ScanAuthorization::from_env());
//! producer.enqueue("scan123", "example.com", "user42").await?;
//!
//! let mut pool = WorkerPool::new(WorkerContext {
//!     cache: queue.clone(),
//!     store,
//!     executor: Arc::new(MockExecutor::new(std::env::temp_dir())),
//!     authorization: ScanAuthorization::from_env(),
//!     config: WorkerConfig::default(),
//! });
//! pool.start(vec![queue])?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Single terminal write**: transitions are guarded in the store, so a
//!   job reaches `done` or `error` once and never moves again
//! - **Stuck jobs**: the reconciler fails `running` jobs with no update
//!   within the staleness threshold
//! - **Store outages**: an entry that cannot be claimed goes back to the
//!   head of the queue
//! - **Known gap**: a worker dying between `BLPOP` and the `running` write
//!   loses the entry; its row stays `queued`

pub mod job;
pub mod memory;
pub mod producer;
pub mod progress;
pub mod queue;
pub mod reconciler;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{JobRecord, JobRequest, JobStatus, MalformedEntry, QueueEntry};
pub use memory::{MemoryQueue, MemoryStore};
pub use producer::{EnqueueError, Producer};
pub use progress::{ProgressEvent, ProgressRecord, ProgressTracker};
pub use queue::{JobQueue, QueueError, StatusCache, WorkQueue};
pub use reconciler::{Reconciler, STALE_JOB_MESSAGE};
pub use worker_pool::{PollOutcome, PoolError, PoolStats, Worker, WorkerContext, WorkerPool};
