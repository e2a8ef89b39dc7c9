//! External scan process supervision.
//!
//! [`ProcessSupervisor`] runs the scan executor command as a child process
//! in its own process group, streams its output, and enforces the job's
//! wall-clock timeout. On expiry the whole process tree is killed, leaves
//! first, then the root, then anything left in the group.
//!
//! Descendants can leave the group (`setsid`) and get reparented once the
//! root exits. Two things still find them: the tree is snapshotted while the
//! root runs, and every spawned process carries a per-run marker in its
//! environment ([`RUN_MARKER_ENV`]). Both sets are killed when the run ends.
//!
//! The executor is invoked as `<command> <target> --job-id=<job_id>`. Each
//! stdout line of the form `PROGRESS {json}` is forwarded as a
//! [`ProgressEvent`]; the last other non-empty stdout line is taken as the
//! result reference.

use std::collections::{HashMap, HashSet};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{display_secs, JobFailure};
use crate::scheduler::progress::ProgressEvent;

use super::executor::{ScanExecutor, ScanOutput, ScanRequest};

/// How long to wait for output readers once the process is gone.
const DEFAULT_OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// How often the process tree is snapshotted while the executor runs.
const TREE_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(250);

/// Bytes of each output stream kept in memory; older output is dropped.
pub const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// Environment variable set on the executor and inherited by its descendants.
pub const RUN_MARKER_ENV: &str = "RECON_QUEUE_RUN";

/// Errors raised while supervising the executor process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The executor could not be started.
    #[error("{0}")]
    Spawn(String),

    /// The executor outlived its deadline and was killed.
    #[error("Job timed out after {} seconds", display_secs(.0))]
    Timeout(Duration),

    /// Waiting on or reading from the process failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a finished executor process left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    /// Tail of stdout, at most [`MAX_CAPTURED_BYTES`].
    pub stdout: String,
    /// Tail of stderr, at most [`MAX_CAPTURED_BYTES`].
    pub stderr: String,
    /// Last non-empty, non-progress stdout line.
    pub result_ref: Option<String>,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Returns whether the process exited with code 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Output captured so far from one stream.
///
/// Shared with the reader task so lines already read survive the task
/// being aborted.
#[derive(Debug, Default)]
struct Captured {
    text: String,
    last_line: Option<String>,
    dropped_bytes: usize,
}

impl Captured {
    fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.text.len() > MAX_CAPTURED_BYTES {
            let mut cut = self.text.len() - MAX_CAPTURED_BYTES;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.dropped_bytes += cut;
        }
    }
}

type SharedCapture = Arc<Mutex<Captured>>;

fn take_capture(capture: &SharedCapture) -> Captured {
    std::mem::take(&mut *capture.lock().unwrap_or_else(PoisonError::into_inner))
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
}

/// Spawns and supervises the scan executor command.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
    output_grace: Duration,
}

impl ProcessSupervisor {
    /// Creates a supervisor for `program` with leading `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            output_grace: DEFAULT_OUTPUT_GRACE,
        }
    }

    /// Builds a supervisor from the configured command line.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, SupervisorError> {
        let (program, args) = config
            .command_parts()
            .ok_or_else(|| SupervisorError::Spawn("executor command is empty".to_string()))?;
        Ok(Self::new(program, args))
    }

    /// Sets how long to wait for output after the process exits.
    pub fn with_output_grace(mut self, grace: Duration) -> Self {
        self.output_grace = grace;
        self
    }

    /// Runs the executor for one job.
    ///
    /// # Errors
    ///
    /// - `SupervisorError::Spawn` if the process could not be started
    /// - `SupervisorError::Timeout` if it outlived `timeout`; the tree is
    ///   killed before this returns
    /// - `SupervisorError::Io` if waiting on the process failed
    pub async fn run(
        &self,
        target: &str,
        job_id: &str,
        timeout: Duration,
        progress: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<ProcessOutput, SupervisorError> {
        let start = Instant::now();
        let marker = format!("{}:{}", job_id, Uuid::new_v4());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(target)
            .arg(format!("--job-id={}", job_id))
            .env(RUN_MARKER_ENV, &marker)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            warn!(job_id = %job_id, program = %self.program, error = %e, "Could not spawn scan executor");
            SupervisorError::Spawn(e.to_string())
        })?;
        let root = child.id();
        let _group = ProcessGroupGuard::new(root);

        info!(job_id = %job_id, pid = ?root, program = %self.program, "Scan executor started");

        let stdout = child.stdout.take().ok_or_else(|| {
            SupervisorError::Io(std::io::Error::other("stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SupervisorError::Io(std::io::Error::other("stderr not captured"))
        })?;

        let stdout_capture = SharedCapture::default();
        let stderr_capture = SharedCapture::default();
        let mut stdout_task = tokio::spawn(read_stdout(
            stdout,
            job_id.to_string(),
            progress,
            stdout_capture.clone(),
        ));
        let mut stderr_task = tokio::spawn(read_stderr(
            stderr,
            job_id.to_string(),
            stderr_capture.clone(),
        ));

        let mut tracked: HashSet<u32> = HashSet::new();
        let mut snapshot = tokio::time::interval(TREE_SNAPSHOT_INTERVAL);
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let waited = loop {
            tokio::select! {
                status = child.wait() => break Waited::Exited(status),
                _ = &mut deadline => break Waited::TimedOut,
                _ = snapshot.tick() => {
                    if let Some(pid) = root {
                        if let Ok(tree) = tokio::task::spawn_blocking(move || descendants(pid)).await {
                            tracked.extend(tree);
                        }
                    }
                }
            }
        };

        let status = match waited {
            Waited::Exited(Ok(status)) => status,
            Waited::Exited(Err(e)) => {
                if let Some(pid) = root {
                    kill_tree(pid);
                }
                let _ = child.start_kill();
                reap_stragglers(root, tracked, marker).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(SupervisorError::Io(e));
            }
            Waited::TimedOut => {
                let killed = match root {
                    Some(pid) => kill_tree(pid),
                    None => 0,
                };
                let _ = child.start_kill();
                // Reap the root so it does not linger as a zombie.
                if let Err(e) = child.wait().await {
                    warn!(job_id = %job_id, error = %e, "Could not reap timed out executor");
                }
                let escaped = reap_stragglers(root, tracked, marker).await;
                warn!(
                    job_id = %job_id,
                    timeout_secs = %display_secs(timeout),
                    killed = killed + escaped,
                    "Scan executor timed out, process tree killed"
                );
                collect(&mut stdout_task, self.output_grace).await;
                collect(&mut stderr_task, self.output_grace).await;
                return Err(SupervisorError::Timeout(timeout));
            }
        };

        // Whatever the executor left running goes with it, including
        // descendants that left the group.
        let stragglers = reap_stragglers(root, tracked, marker).await;
        if stragglers > 0 {
            warn!(job_id = %job_id, killed = stragglers, "Killed processes left behind by scan executor");
        }

        collect(&mut stdout_task, self.output_grace).await;
        collect(&mut stderr_task, self.output_grace).await;
        let stdout = take_capture(&stdout_capture);
        let stderr = take_capture(&stderr_capture);
        if stdout.dropped_bytes > 0 || stderr.dropped_bytes > 0 {
            debug!(
                job_id = %job_id,
                stdout_dropped = stdout.dropped_bytes,
                stderr_dropped = stderr.dropped_bytes,
                "Executor output truncated to its tail"
            );
        }

        let exit_code = status.code().unwrap_or(-1);
        let duration = start.elapsed();
        info!(
            job_id = %job_id,
            exit_code = exit_code,
            duration_ms = duration.as_millis() as u64,
            "Scan executor exited"
        );

        Ok(ProcessOutput {
            exit_code,
            stdout: stdout.text,
            stderr: stderr.text,
            result_ref: stdout.last_line,
            duration,
        })
    }
}

#[async_trait]
impl ScanExecutor for ProcessSupervisor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(
        &self,
        request: &ScanRequest,
        progress: UnboundedSender<ProgressEvent>,
    ) -> Result<ScanOutput, JobFailure> {
        let output = self
            .run(
                &request.target,
                &request.job_id,
                request.timeout,
                Some(progress),
            )
            .await
            .map_err(|e| match e {
                SupervisorError::Spawn(msg) => JobFailure::Spawn(msg),
                SupervisorError::Timeout(d) => JobFailure::Timeout(d),
                SupervisorError::Io(e) => JobFailure::Executor(e.to_string()),
            })?;

        if !output.is_success() {
            return Err(JobFailure::executor_failure(
                output.exit_code,
                &output.stderr,
            ));
        }

        Ok(ScanOutput {
            result_ref: output.result_ref,
            stdout: output.stdout,
            stderr: output.stderr,
            duration: output.duration,
        })
    }
}

/// Kills the group plus every remembered or marked process still alive.
/// Returns how many processes outside the group were signalled.
async fn reap_stragglers(root: Option<u32>, tracked: HashSet<u32>, marker: String) -> usize {
    if let Some(pid) = root {
        kill_group(pid);
    }
    let swept = tokio::task::spawn_blocking(move || {
        let mut targets: Vec<u32> = tracked.into_iter().filter(|pid| is_alive(*pid)).collect();
        for pid in marked_processes(&marker) {
            if !targets.contains(&pid) {
                targets.push(pid);
            }
        }
        targets.into_iter().filter(|pid| signal_kill(*pid)).count()
    })
    .await;
    swept.unwrap_or_else(|e| {
        warn!(error = %e, "Straggler sweep task failed");
        0
    })
}

/// Waits up to `grace` for a reader task, aborting it on expiry.
///
/// Output read before an abort is kept in the task's shared capture.
async fn collect(task: &mut JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Output reader task failed"),
        Err(_) => {
            task.abort();
            warn!("Output reader did not finish, abandoning remaining output");
        }
    }
}

async fn read_stdout<R>(
    stream: R,
    job_id: String,
    progress: Option<UnboundedSender<ProgressEvent>>,
    capture: SharedCapture,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).split(b'\n');

    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches('\r');
                if let Some(event) = ProgressEvent::parse_line(line) {
                    if let Some(tx) = &progress {
                        let _ = tx.send(event);
                    }
                    continue;
                }
                debug!(job_id = %job_id, "[executor stdout] {}", line);
                let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
                if !line.trim().is_empty() {
                    captured.last_line = Some(line.trim().to_string());
                }
                captured.push_line(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Error reading executor stdout");
                break;
            }
        }
    }
}

async fn read_stderr<R>(stream: R, job_id: String, capture: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).split(b'\n');

    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                debug!(job_id = %job_id, "[executor stderr] {}", line);
                capture
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_line(&line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Error reading executor stderr");
                break;
            }
        }
    }
}

/// Kills the executor's process group when dropped.
///
/// Covers the paths where the supervising future is cancelled, since
/// `kill_on_drop` reaches only the root process.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }
    }
}

/// Returns `root`'s live descendants, parents before children.
///
/// Zombies are skipped: they are already dead and only wait to be reaped.
pub fn descendants(root: u32) -> Vec<u32> {
    use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if process.status() == ProcessStatus::Zombie {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }

    let mut ordered = Vec::new();
    let mut frontier = vec![root];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !ordered.contains(&kid) {
                    ordered.push(kid);
                    frontier.push(kid);
                }
            }
        }
    }
    ordered
}

/// Returns whether `pid` names a live, non-zombie process.
pub fn is_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

/// Returns live processes whose environment carries `marker` under
/// [`RUN_MARKER_ENV`], however far they moved from the original tree.
pub fn marked_processes(marker: &str) -> Vec<u32> {
    use std::ffi::OsStr;
    use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

    let needle = format!("{}={}", RUN_MARKER_ENV, marker);
    let needle = OsStr::new(&needle);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_environ(UpdateKind::Always),
    );

    let mut marked: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .filter(|(_, process)| process.environ().iter().any(|var| var.as_os_str() == needle))
        .map(|(pid, _)| pid.as_u32())
        .collect();
    marked.sort_unstable();
    marked
}

/// Passes made over the tree to catch processes forked mid-kill.
const KILL_PASSES: usize = 3;

/// SIGKILLs every descendant of `root` (leaves first), then `root`, then
/// its process group. Returns how many descendants were signalled.
#[cfg(unix)]
pub fn kill_tree(root: u32) -> usize {
    let mut killed = 0;
    for _ in 0..KILL_PASSES {
        let tree = descendants(root);
        if tree.is_empty() {
            break;
        }
        for pid in tree.iter().rev() {
            if signal_kill(*pid) {
                killed += 1;
            }
        }
    }
    signal_kill(root);
    kill_group(root);
    killed
}

#[cfg(not(unix))]
pub fn kill_tree(_root: u32) -> usize {
    0
}

#[cfg(unix)]
fn signal_kill(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        Ok(raw) => kill(Pid::from_raw(raw), Signal::SIGKILL).is_ok(),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pgid) {
        // ESRCH just means the group is already gone.
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_splits_command() {
        let config = ExecutorConfig {
            command: "python3 ai_services/scan_worker.py".to_string(),
            mock: false,
            results_dir: None,
        };
        let supervisor = ProcessSupervisor::from_config(&config).unwrap();
        assert_eq!(supervisor.program, "python3");
        assert_eq!(supervisor.args, vec!["ai_services/scan_worker.py"]);
    }

    #[test]
    fn test_from_config_rejects_empty_command() {
        let config = ExecutorConfig {
            command: String::new(),
            mock: false,
            results_dir: None,
        };
        assert!(matches!(
            ProcessSupervisor::from_config(&config),
            Err(SupervisorError::Spawn(_))
        ));
    }

    #[test]
    fn test_timeout_error_message() {
        let err = SupervisorError::Timeout(Duration::from_secs(1800));
        assert_eq!(err.to_string(), "Job timed out after 1800 seconds");

        let err = SupervisorError::Timeout(Duration::from_millis(300));
        assert_eq!(err.to_string(), "Job timed out after 0.3 seconds");
    }

    #[test]
    fn test_capture_keeps_tail() {
        let mut captured = Captured::default();
        let line = "x".repeat(1000);
        for _ in 0..200 {
            captured.push_line(&line);
        }
        captured.push_line("last line");

        assert!(captured.text.len() <= MAX_CAPTURED_BYTES);
        assert!(captured.text.ends_with("last line\n"));
        assert!(captured.dropped_bytes > 0);
    }

    #[test]
    fn test_capture_cuts_on_char_boundary() {
        let mut captured = Captured::default();
        let line = "é".repeat(MAX_CAPTURED_BYTES / 2 + 1);
        captured.push_line(&line);
        assert!(captured.text.len() <= MAX_CAPTURED_BYTES);
        assert!(captured.text.ends_with("é\n"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let supervisor = ProcessSupervisor::new("/nonexistent/scan-executor", Vec::new());
        let err = supervisor
            .run("example.com", "j1", Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        // Only the OS error text; the job failure adds the prefix.
        assert!(!err.to_string().contains("spawn"));
        assert_eq!(
            JobFailure::Spawn(err.to_string()).to_string(),
            format!("failed to start scan executor: {}", err)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_code_and_streams() {
        let supervisor = ProcessSupervisor::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo started; echo \"$0 $1\"; echo oops >&2; exit 3".to_string(),
            ],
        );
        let output = supervisor
            .run("example.com", "j1", Duration::from_secs(10), None)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(!output.is_success());
        assert!(output.stdout.contains("started"));
        assert_eq!(output.result_ref.as_deref(), Some("example.com --job-id=j1"));
        assert_eq!(output.stderr.trim(), "oops");
    }
}
