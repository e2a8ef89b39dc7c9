//! Stuck-job reconciliation.
//!
//! A worker that dies mid-scan leaves its row `running` forever. The
//! reconciler periodically fails every `running` row whose `updated_at` is
//! older than the staleness threshold, then mirrors the new status into
//! the cache.
//!
//! The sweep is a single guarded `UPDATE`, so one pass transitions each
//! stale row at most once. A worker finishing the same job concurrently
//! loses the race if the sweep commits first: both writes require
//! `status = 'running'`, so the first terminal write wins and the row
//! never flips between `error` and `done`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::storage::{JobStore, StoreError};

use super::job::JobStatus;
use super::queue::StatusCache;

/// Message stored on jobs failed by the reconciler.
pub const STALE_JOB_MESSAGE: &str = "stuck job — no update within threshold";

/// Fails over jobs abandoned in `running`.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    cache: Arc<dyn StatusCache>,
    stale_after: Duration,
}

impl Reconciler {
    /// Creates a reconciler failing jobs idle for longer than `stale_after`.
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: Arc<dyn StatusCache>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            stale_after,
        }
    }

    /// Staleness threshold.
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Runs one sweep and returns the ids it failed.
    pub async fn reconcile_once(&self) -> Result<Vec<String>, StoreError> {
        let threshold = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - threshold;

        let failed = self.store.fail_stale(cutoff, STALE_JOB_MESSAGE).await?;

        for job_id in &failed {
            warn!(job_id = %job_id, stale_after_secs = self.stale_after.as_secs(), "Failed stuck job");
            if let Err(e) = self.cache.set_status(job_id, JobStatus::Error).await {
                warn!(job_id = %job_id, error = %e, "Could not mirror stale job status");
            }
        }

        if !failed.is_empty() {
            info!(count = failed.len(), "Reconciled stuck jobs");
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobRequest;
    use crate::scheduler::memory::{MemoryQueue, MemoryStore};

    async fn running_job(store: &MemoryStore, job_id: &str, idle: chrono::Duration) {
        let entry = JobRequest::new(job_id, "example.com", "u1").into_entry();
        store.insert_queued(&entry).await.expect("insert");
        store
            .mark_running(job_id, "example.com", "u1")
            .await
            .expect("running");
        store.set_updated_at(job_id, Utc::now() - idle);
    }

    #[tokio::test]
    async fn test_stale_job_fails_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryQueue::new());
        running_job(&store, "stale", chrono::Duration::minutes(45)).await;
        running_job(&store, "busy", chrono::Duration::minutes(1)).await;

        let reconciler = Reconciler::new(store.clone(), cache.clone(), Duration::from_secs(1800));

        let failed = reconciler.reconcile_once().await.expect("sweep");
        assert_eq!(failed, vec!["stale".to_string()]);
        assert!(reconciler.reconcile_once().await.expect("sweep").is_empty());

        let stale = store.get("stale").await.expect("get").expect("row");
        assert_eq!(stale.status, JobStatus::Error);
        assert_eq!(stale.error_message.as_deref(), Some(STALE_JOB_MESSAGE));
        assert!(stale.completed_at.is_some());

        let busy = store.get("busy").await.expect("get").expect("row");
        assert_eq!(busy.status, JobStatus::Running);

        let cached = cache.get_status("stale").await.expect("cache").expect("hash");
        assert_eq!(cached["status"], "error");
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        running_job(&store, "j1", chrono::Duration::hours(2)).await;
        store.mark_done("j1", None, None).await.expect("done");
        store.set_updated_at("j1", Utc::now() - chrono::Duration::hours(2));

        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(MemoryQueue::new()),
            Duration::from_secs(1800),
        );
        assert!(reconciler.reconcile_once().await.expect("sweep").is_empty());
        let record = store.get("j1").await.expect("get").expect("row");
        assert_eq!(record.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_fail_sweep() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryQueue::new());
        cache.set_fail_cache(true);
        running_job(&store, "j1", chrono::Duration::hours(1)).await;

        let reconciler = Reconciler::new(store.clone(), cache, Duration::from_secs(60));
        assert_eq!(reconciler.reconcile_once().await.expect("sweep"), vec!["j1"]);
    }
}
