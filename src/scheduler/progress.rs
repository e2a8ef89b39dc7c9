//! Per-job progress tracking.
//!
//! A scan walks five fixed phases. The tracker turns phase/activity events
//! into a [`ProgressRecord`] (overall percentage plus elapsed and ETA
//! figures) and writes it to the job store's progress annotation.
//!
//! Writes are telemetry: a failed write is logged and the scan carries on.
//! One tracker exists per job; the worker creates it when it claims the job
//! and drops it when the job reaches a terminal state.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scheduler::job::{timestamp, JobStatus};
use crate::storage::JobStore;

/// Number of phases in a scan.
pub const TOTAL_PHASES: u8 = 5;

/// Ordered phase names, indexed by `phase - 1`.
pub const PHASE_NAMES: [&str; TOTAL_PHASES as usize] = [
    "Subdomain Enumeration",
    "OSINT Intelligence Gathering",
    "Port Scanning",
    "Technology Detection",
    "Vulnerability Scanning",
];

/// Nominal phase durations in seconds, used only for ETA.
pub const PHASE_ESTIMATES_SECS: [u64; TOTAL_PHASES as usize] = [30, 20, 120, 30, 60];

/// Fallback estimate when no phase has started yet.
const DEFAULT_PHASE_ESTIMATE_SECS: u64 = 60;

/// Below this many seconds into a phase, report the full phase estimate.
const PHASE_WARMUP_SECS: u64 = 5;

/// Highest percentage reported before the scan is complete.
const MAX_RUNNING_PROGRESS: u8 = 99;

/// Returns the display name of a 1-based phase number.
pub fn phase_name(phase: u8) -> String {
    match phase {
        1..=TOTAL_PHASES => PHASE_NAMES[usize::from(phase - 1)].to_string(),
        other => format!("Phase {}", other),
    }
}

fn phase_estimate_secs(phase: u8) -> u64 {
    match phase {
        1..=TOTAL_PHASES => PHASE_ESTIMATES_SECS[usize::from(phase - 1)],
        _ => DEFAULT_PHASE_ESTIMATE_SECS,
    }
}

/// Overall percentage for `sub_percent` of the way through `phase`.
///
/// `(phase - 1) / TOTAL_PHASES * 100 + sub_percent * phase_weight`, with the
/// phase clamped to `1..=TOTAL_PHASES` and the sub-percentage to `0..=100`.
pub fn overall_progress(phase: u8, sub_percent: u8) -> u8 {
    let phase = u32::from(phase.clamp(1, TOTAL_PHASES));
    let sub = u32::from(sub_percent.min(100));
    let total = u32::from(TOTAL_PHASES);
    let base = (phase - 1) * 100 / total;
    let weight = 100 / total;
    (base + weight * sub / 100).min(100) as u8
}

/// Snapshot written to `scans.progress_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub phase: String,
    pub activity: String,
    pub progress: u8,
    pub status: JobStatus,
    pub elapsed_seconds: u64,
    pub estimated_remaining_seconds: u64,
    pub phase_elapsed_seconds: u64,
    pub phase_remaining_seconds: u64,
    pub timestamp: String,
}

/// A progress event emitted by a scan executor.
///
/// Executors running as child processes print these as
/// `PROGRESS {"event":"start_phase","phase":1}` lines on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StartPhase {
        phase: u8,
        #[serde(default)]
        detail: Option<String>,
    },
    Activity {
        detail: String,
        #[serde(default)]
        sub_percent: Option<u8>,
    },
    CompletePhase {
        phase: u8,
        #[serde(default)]
        summary: Option<String>,
    },
}

/// Prefix marking a stdout line as a progress event.
pub const PROGRESS_LINE_PREFIX: &str = "PROGRESS ";

impl ProgressEvent {
    /// Parses a `PROGRESS {json}` line. Returns `None` for any other line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let payload = line.trim().strip_prefix(PROGRESS_LINE_PREFIX)?;
        serde_json::from_str(payload).ok()
    }

    /// Formats the event as a stdout line.
    pub fn to_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}", PROGRESS_LINE_PREFIX, json)
    }
}

/// Tracks and publishes progress for one job.
pub struct ProgressTracker {
    job_id: String,
    store: Arc<dyn JobStore>,
    started: Instant,
    current_phase: u8,
    phase_started: Option<Instant>,
    last_progress: u8,
    failed_writes: u32,
}

impl ProgressTracker {
    /// Creates a tracker for `job_id`; the elapsed clock starts now.
    pub fn new(job_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            started: Instant::now(),
            current_phase: 0,
            phase_started: None,
            last_progress: 0,
            failed_writes: 0,
        }
    }

    /// The job this tracker reports for.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Last published percentage.
    pub fn progress(&self) -> u8 {
        self.last_progress
    }

    /// Number of progress writes the store rejected.
    pub fn failed_writes(&self) -> u32 {
        self.failed_writes
    }

    /// Applies an executor event.
    pub async fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::StartPhase { phase, detail } => {
                self.start_phase(phase, detail.as_deref()).await
            }
            ProgressEvent::Activity {
                detail,
                sub_percent,
            } => self.update_activity(&detail, sub_percent).await,
            ProgressEvent::CompletePhase { phase, summary } => {
                self.complete_phase(phase, summary.as_deref()).await
            }
        }
    }

    /// Enters `phase` (1-based).
    pub async fn start_phase(&mut self, phase: u8, detail: Option<&str>) {
        self.current_phase = phase;
        self.phase_started = Some(Instant::now());

        let name = phase_name(phase);
        let activity = detail
            .map(str::to_string)
            .unwrap_or_else(|| format!("Starting {}...", name));
        let progress = self.running_progress(overall_progress(phase, 0));
        self.publish(name, activity, progress, JobStatus::Running)
            .await;
    }

    /// Reports activity within the current phase.
    pub async fn update_activity(&mut self, detail: &str, sub_percent: Option<u8>) {
        let name = phase_name(self.current_phase);
        let computed = overall_progress(self.current_phase, sub_percent.unwrap_or(0));
        let progress = self.running_progress(computed);
        self.publish(name, detail.to_string(), progress, JobStatus::Running)
            .await;
    }

    /// Marks `phase` finished.
    pub async fn complete_phase(&mut self, phase: u8, summary: Option<&str>) {
        let name = phase_name(phase);
        let activity = summary
            .map(str::to_string)
            .unwrap_or_else(|| format!("Completed {}", name));
        let computed = overall_progress(phase, 100);
        let progress = self.running_progress(computed);
        self.publish(name, activity, progress, JobStatus::Running)
            .await;
    }

    /// Marks the whole scan finished at exactly 100%.
    pub async fn complete_scan(&mut self, summary: &str) {
        self.last_progress = 100;
        self.publish(
            "Complete".to_string(),
            summary.to_string(),
            100,
            JobStatus::Done,
        )
        .await;
    }

    /// Reports a terminal error, keeping the last percentage.
    pub async fn report_error(&mut self, message: &str) {
        let progress = self.last_progress;
        self.publish(
            "Error".to_string(),
            message.to_string(),
            progress,
            JobStatus::Error,
        )
        .await;
    }

    /// Builds the record for the given values without writing it.
    pub fn snapshot(
        &self,
        phase: String,
        activity: String,
        progress: u8,
        status: JobStatus,
    ) -> ProgressRecord {
        let elapsed = self.started.elapsed().as_secs_f64();
        let phase_elapsed = self
            .phase_started
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);

        let estimated_remaining_seconds = if progress > 0 && progress < 100 {
            let estimated_total = elapsed / (f64::from(progress) / 100.0);
            (estimated_total - elapsed).max(0.0) as u64
        } else {
            0
        };

        let estimate = phase_estimate_secs(self.current_phase);
        let phase_remaining_seconds = if phase_elapsed < PHASE_WARMUP_SECS {
            estimate
        } else {
            estimate.saturating_sub(phase_elapsed)
        };

        ProgressRecord {
            phase,
            activity,
            progress,
            status,
            elapsed_seconds: elapsed as u64,
            estimated_remaining_seconds,
            phase_elapsed_seconds: phase_elapsed,
            phase_remaining_seconds,
            timestamp: timestamp(Utc::now()),
        }
    }

    fn running_progress(&mut self, computed: u8) -> u8 {
        let progress = computed.min(MAX_RUNNING_PROGRESS).max(self.last_progress);
        self.last_progress = progress;
        progress
    }

    async fn publish(&mut self, phase: String, activity: String, progress: u8, status: JobStatus) {
        let record = self.snapshot(phase, activity, progress, status);
        debug!(
            job_id = %self.job_id,
            phase = %record.phase,
            progress = record.progress,
            "Publishing progress"
        );
        if let Err(e) = self.store.update_progress(&self.job_id, &record).await {
            self.failed_writes += 1;
            warn!(job_id = %self.job_id, error = %e, "Could not update progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobRequest;
    use crate::scheduler::memory::MemoryStore;

    async fn running_store(job_id: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let entry = JobRequest::new(job_id, "example.com", "u1").into_entry();
        store.insert_queued(&entry).await.expect("insert");
        store
            .mark_running(job_id, "example.com", "u1")
            .await
            .expect("running");
        store
    }

    #[test]
    fn test_overall_progress_formula() {
        assert_eq!(overall_progress(1, 0), 0);
        assert_eq!(overall_progress(1, 50), 10);
        assert_eq!(overall_progress(2, 0), 20);
        assert_eq!(overall_progress(3, 50), 50);
        assert_eq!(overall_progress(5, 100), 100);
        assert_eq!(overall_progress(0, 0), 0);
        assert_eq!(overall_progress(9, 200), 100);
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(phase_name(1), "Subdomain Enumeration");
        assert_eq!(phase_name(5), "Vulnerability Scanning");
        assert_eq!(phase_name(7), "Phase 7");
    }

    #[test]
    fn test_progress_line_parsing() {
        let event = ProgressEvent::Activity {
            detail: "nmap host 2/4".to_string(),
            sub_percent: Some(50),
        };
        assert_eq!(ProgressEvent::parse_line(&event.to_line()), Some(event));

        assert_eq!(
            ProgressEvent::parse_line(r#"PROGRESS {"event":"start_phase","phase":3}"#),
            Some(ProgressEvent::StartPhase {
                phase: 3,
                detail: None
            })
        );
        assert_eq!(ProgressEvent::parse_line("/tmp/results-j1.json"), None);
        assert_eq!(ProgressEvent::parse_line("PROGRESS {broken"), None);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_hits_100_only_at_completion() {
        let store = running_store("j1").await;
        let mut tracker = ProgressTracker::new("j1", store.clone());
        let mut seen = Vec::new();

        for phase in 1..=TOTAL_PHASES {
            tracker.start_phase(phase, None).await;
            seen.push(tracker.progress());
            tracker.update_activity("working", Some(60)).await;
            seen.push(tracker.progress());
            // A late, lower sub-percentage must not move progress backwards.
            tracker.update_activity("retrying", Some(10)).await;
            seen.push(tracker.progress());
            tracker.complete_phase(phase, None).await;
            seen.push(tracker.progress());
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert!(seen.iter().all(|p| *p < 100), "{:?}", seen);

        tracker.complete_scan("Scan completed successfully").await;
        assert_eq!(tracker.progress(), 100);

        let record = store.get("j1").await.expect("get").expect("row");
        let progress = record.progress.expect("progress written");
        assert_eq!(progress.progress, 100);
        assert_eq!(progress.status, JobStatus::Done);
        assert_eq!(tracker.failed_writes(), 0);
    }

    #[tokio::test]
    async fn test_error_keeps_last_progress() {
        let store = running_store("j2").await;
        let mut tracker = ProgressTracker::new("j2", store.clone());

        tracker.start_phase(3, Some("scanning ports")).await;
        tracker.report_error("nmap crashed").await;

        let progress = store
            .get("j2")
            .await
            .expect("get")
            .and_then(|r| r.progress)
            .expect("progress written");
        assert_eq!(progress.status, JobStatus::Error);
        assert_eq!(progress.progress, 40);
        assert_eq!(progress.activity, "nmap crashed");
    }

    #[tokio::test]
    async fn test_write_failure_does_not_abort() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let mut tracker = ProgressTracker::new("j3", store);

        tracker.start_phase(1, None).await;
        tracker.update_activity("still going", Some(50)).await;

        assert_eq!(tracker.progress(), 10);
        assert_eq!(tracker.failed_writes(), 2);
    }

    #[test]
    fn test_snapshot_uses_full_phase_estimate_at_phase_start() {
        let tracker = ProgressTracker::new("j4", Arc::new(MemoryStore::new()));
        let record = tracker.snapshot(
            "Port Scanning".to_string(),
            "starting".to_string(),
            0,
            JobStatus::Running,
        );
        assert_eq!(record.phase_remaining_seconds, 60);
        assert_eq!(record.estimated_remaining_seconds, 0);
    }
}
