//! Scan executor strategies.
//!
//! The worker drives a scan through the [`ScanExecutor`] trait. Two
//! implementations exist: [`super::ProcessSupervisor`] shells out to the
//! real tool chain, and [`MockExecutor`] walks the five phases in-process
//! and writes a canned result artifact.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::JobFailure;
use crate::scheduler::job::timestamp;
use crate::scheduler::progress::{phase_name, ProgressEvent, TOTAL_PHASES};

/// Largest result artifact loaded into the job store.
pub const MAX_ARTIFACT_BYTES: u64 = 16 * 1024 * 1024;

/// One scan to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub job_id: String,
    pub target: String,
    /// Wall-clock ceiling; the executor is terminated when it expires.
    pub timeout: Duration,
}

/// What a successful scan produced.
#[derive(Debug, Clone, Default)]
pub struct ScanOutput {
    /// Reference to the result artifact, usually a file path.
    pub result_ref: Option<String>,
    /// Captured standard output, progress lines excluded.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    pub duration: Duration,
}

/// Strategy that runs one scan to completion.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Runs the scan, sending progress events as they happen.
    ///
    /// Returns `Ok` only when the scan succeeded. Every failure is reduced
    /// to a [`JobFailure`] whose message ends up in the job store.
    async fn execute(
        &self,
        request: &ScanRequest,
        progress: UnboundedSender<ProgressEvent>,
    ) -> Result<ScanOutput, JobFailure>;
}

/// Returns the artifact path for `job_id` under `dir`.
pub fn result_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("results-{}.json", job_id))
}

/// Loads a JSON result artifact named by `result_ref`.
///
/// Returns `None` when the reference is not a readable JSON file. A missing
/// artifact never fails the job.
pub async fn load_result_artifact(result_ref: &str) -> Option<serde_json::Value> {
    let path = Path::new(result_ref.trim());
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No result artifact at reference");
            return None;
        }
    };

    if metadata.len() > MAX_ARTIFACT_BYTES {
        warn!(
            path = %path.display(),
            size = metadata.len(),
            "Result artifact too large to store"
        );
        return None;
    }

    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read result artifact");
            return None;
        }
    };

    match serde_json::from_slice(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Result artifact is not valid JSON");
            None
        }
    }
}

/// How a [`MockExecutor`] run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Writes the result artifact and succeeds.
    Succeed,
    /// Fails as if the executor exited with `code`.
    Fail { code: i32, stderr: String },
    /// Never finishes; the request timeout ends it.
    Hang,
}

/// In-process executor producing canned results.
#[derive(Debug, Clone)]
pub struct MockExecutor {
    results_dir: PathBuf,
    phase_delay: Duration,
    outcome: MockOutcome,
}

impl MockExecutor {
    /// Creates a mock that writes artifacts under `results_dir` and succeeds.
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            phase_delay: Duration::from_millis(200),
            outcome: MockOutcome::Succeed,
        }
    }

    /// Sets the pause after each phase.
    pub fn with_phase_delay(mut self, delay: Duration) -> Self {
        self.phase_delay = delay;
        self
    }

    /// Sets how the run ends.
    pub fn with_outcome(mut self, outcome: MockOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    async fn run(
        &self,
        request: &ScanRequest,
        progress: &UnboundedSender<ProgressEvent>,
    ) -> Result<ScanOutput, JobFailure> {
        let started = Instant::now();

        for phase in 1..=TOTAL_PHASES {
            // The receiver going away only means nobody is watching.
            let _ = progress.send(ProgressEvent::StartPhase {
                phase,
                detail: None,
            });
            let _ = progress.send(ProgressEvent::Activity {
                detail: format!("{} against {}", phase_name(phase), request.target),
                sub_percent: Some(50),
            });
            tokio::time::sleep(self.phase_delay).await;
            let _ = progress.send(ProgressEvent::CompletePhase {
                phase,
                summary: None,
            });
        }

        match &self.outcome {
            MockOutcome::Succeed => {}
            MockOutcome::Fail { code, stderr } => {
                return Err(JobFailure::executor_failure(*code, stderr));
            }
            MockOutcome::Hang => std::future::pending::<()>().await,
        }

        let path = result_path(&self.results_dir, &request.job_id);
        let artifact = json!({
            "job_id": request.job_id,
            "target": request.target,
            "mock": true,
            "subdomains": [],
            "open_ports": [],
            "vulnerabilities": [],
            "completed_at": timestamp(Utc::now()),
        });
        let body = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| JobFailure::Executor(format!("could not encode results: {}", e)))?;
        tokio::fs::create_dir_all(&self.results_dir)
            .await
            .map_err(|e| JobFailure::Executor(format!("could not create results dir: {}", e)))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| JobFailure::Executor(format!("could not write results: {}", e)))?;

        let result_ref = path.display().to_string();
        info!(job_id = %request.job_id, result_ref = %result_ref, "Mock scan finished");

        Ok(ScanOutput {
            stdout: format!("{}\n", result_ref),
            result_ref: Some(result_ref),
            stderr: String::new(),
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl ScanExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        request: &ScanRequest,
        progress: UnboundedSender<ProgressEvent>,
    ) -> Result<ScanOutput, JobFailure> {
        match tokio::time::timeout(request.timeout, self.run(request, &progress)).await {
            Ok(result) => result,
            Err(_) => Err(JobFailure::Timeout(request.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn request(job_id: &str, timeout: Duration) -> ScanRequest {
        ScanRequest {
            job_id: job_id.to_string(),
            target: "example.com".to_string(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_mock_writes_artifact_and_reports_phases() {
        let temp = TempDir::new().unwrap();
        let executor = MockExecutor::new(temp.path()).with_phase_delay(Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let output = executor
            .execute(&request("j1", Duration::from_secs(5)), tx)
            .await
            .unwrap();

        let expected = result_path(temp.path(), "j1");
        assert_eq!(output.result_ref, Some(expected.display().to_string()));

        let artifact = load_result_artifact(&expected.display().to_string())
            .await
            .unwrap();
        assert_eq!(artifact["job_id"], "j1");
        assert_eq!(artifact["mock"], true);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3 * usize::from(TOTAL_PHASES));
        assert_eq!(
            events.last(),
            Some(&ProgressEvent::CompletePhase {
                phase: TOTAL_PHASES,
                summary: None
            })
        );
    }

    #[tokio::test]
    async fn test_mock_failure_carries_stderr() {
        let temp = TempDir::new().unwrap();
        let executor = MockExecutor::new(temp.path())
            .with_phase_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Fail {
                code: 2,
                stderr: "subfinder: rate limited".to_string(),
            });
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = executor
            .execute(&request("j2", Duration::from_secs(5)), tx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "executor_failure");
        assert!(err.to_string().contains("rate limited"));
        assert!(!result_path(temp.path(), "j2").exists());
    }

    #[tokio::test]
    async fn test_mock_hang_times_out() {
        let temp = TempDir::new().unwrap();
        let executor = MockExecutor::new(temp.path())
            .with_phase_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Hang);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = executor
            .execute(&request("j3", Duration::from_millis(50)), tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_load_result_artifact_rejects_non_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("results-bad.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(load_result_artifact(&path.display().to_string()).await.is_none());
        assert!(load_result_artifact("scan finished").await.is_none());
        assert!(load_result_artifact(&temp.path().display().to_string())
            .await
            .is_none());
    }
}
