//! In-process queue, cache and job store.
//!
//! These back the `local` command and the test-suite. They apply the same
//! transition guards as the Redis and PostgreSQL implementations, and
//! expose a few knobs (`fail_next_ops`, `set_fail_writes`, `set_updated_at`)
//! for driving failure paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::storage::{JobStore, StoreError};

use super::job::{timestamp, JobRecord, JobStatus, QueueEntry};
use super::progress::ProgressRecord;
use super::queue::{entry_fields, QueueError, StatusCache, WorkQueue};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`WorkQueue`] and [`StatusCache`].
#[derive(Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
    cache: Mutex<HashMap<String, HashMap<String, String>>>,
    failing_ops: AtomicU32,
    fail_cache: AtomicBool,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` queue operations fail.
    pub fn fail_next_ops(&self, count: u32) {
        self.failing_ops.store(count, Ordering::SeqCst);
    }

    /// Makes every cache write fail while set.
    pub fn set_fail_cache(&self, fail: bool) {
        self.fail_cache.store(fail, Ordering::SeqCst);
    }

    /// Payloads currently waiting, head first.
    pub fn pending(&self) -> Vec<String> {
        lock(&self.items).iter().cloned().collect()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        let consumed = self
            .failing_ops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            Err(QueueError::Unavailable("injected queue failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_cache(&self) -> Result<(), QueueError> {
        if self.fail_cache.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("injected cache failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, payload: &str) -> Result<usize, QueueError> {
        self.check_available()?;
        let len = {
            let mut items = lock(&self.items);
            items.push_back(payload.to_string());
            items.len()
        };
        self.notify.notify_one();
        Ok(len)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.check_available()?;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let head = lock(&self.items).pop_front();
            if let Some(payload) = head {
                return Ok(Some(payload));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue_front(&self, payload: &str) -> Result<(), QueueError> {
        self.check_available()?;
        lock(&self.items).push_front(payload.to_string());
        self.notify.notify_one();
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        self.check_available()?;
        Ok(lock(&self.items).len())
    }
}

#[async_trait]
impl StatusCache for MemoryQueue {
    async fn record_enqueued(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.check_cache()?;
        let fields = entry_fields(entry)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        lock(&self.cache).insert(entry.job_id.clone(), fields);
        Ok(())
    }

    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), QueueError> {
        self.check_cache()?;
        let mut cache = lock(&self.cache);
        let fields = cache.entry(job_id.to_string()).or_default();
        fields.insert("status".to_string(), status.as_str().to_string());
        fields.insert("updated_at".to_string(), timestamp(Utc::now()));
        Ok(())
    }

    async fn get_status(
        &self,
        job_id: &str,
    ) -> Result<Option<HashMap<String, String>>, QueueError> {
        Ok(lock(&self.cache).get(job_id).cloned())
    }
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, JobRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail while set. Reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Backdates a row's `updated_at`, as if no update arrived since `at`.
    pub fn set_updated_at(&self, job_id: &str, at: DateTime<Utc>) -> bool {
        match lock(&self.rows).get_mut(job_id) {
            Some(record) => {
                record.updated_at = at;
                true
            }
            None => false,
        }
    }

    /// Every row, ordered by job id.
    pub fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = lock(&self.rows).values().cloned().collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        records
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }

    /// Applies `running -> next` when the row is running.
    fn finish(
        &self,
        job_id: &str,
        next: JobStatus,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut rows = lock(&self.rows);
        match rows.get_mut(job_id) {
            Some(record) if record.status.can_transition_to(next) => {
                let now = Utc::now();
                record.status = next;
                record.updated_at = now;
                record.completed_at = Some(now);
                apply(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_queued(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        lock(&self.rows)
            .entry(entry.job_id.clone())
            .or_insert_with(|| JobRecord::queued(entry, Utc::now()));
        Ok(())
    }

    async fn mark_running(
        &self,
        job_id: &str,
        target: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut rows = lock(&self.rows);
        let record = rows.entry(job_id.to_string()).or_insert_with(|| {
            let entry = QueueEntry {
                job_id: job_id.to_string(),
                target: target.to_string(),
                user_id: user_id.to_string(),
                enqueued_at: timestamp(now),
                status: JobStatus::Queued,
            };
            JobRecord::queued(&entry, now)
        });

        if record.status != JobStatus::Queued {
            return Ok(false);
        }
        record.status = JobStatus::Running;
        record.updated_at = now;
        Ok(true)
    }

    async fn mark_done(
        &self,
        job_id: &str,
        result_ref: Option<&str>,
        results: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError> {
        self.finish(job_id, JobStatus::Done, |record| {
            record.result_ref = result_ref.map(str::to_string);
            record.results = results.cloned();
            record.error_message = None;
        })
    }

    async fn mark_error(&self, job_id: &str, message: &str) -> Result<bool, StoreError> {
        self.finish(job_id, JobStatus::Error, |record| {
            record.error_message = Some(message.to_string());
        })
    }

    async fn update_progress(
        &self,
        job_id: &str,
        record: &ProgressRecord,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        if let Some(row) = lock(&self.rows).get_mut(job_id) {
            if row.status == JobStatus::Running {
                row.progress = Some(record.clone());
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(lock(&self.rows).get(job_id).cloned())
    }

    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<Vec<String>, StoreError> {
        self.check_writable()?;
        let now = Utc::now();
        let mut failed = Vec::new();
        for record in lock(&self.rows).values_mut() {
            if record.status == JobStatus::Running && record.updated_at < cutoff {
                record.status = JobStatus::Error;
                record.error_message = Some(message.to_string());
                record.updated_at = now;
                record.completed_at = Some(now);
                failed.push(record.job_id.clone());
            }
        }
        failed.sort();
        Ok(failed)
    }
}
