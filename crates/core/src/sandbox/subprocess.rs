//! Shared subprocess management.
//!
//! [`run_command`] is used by the process and container sandboxes and by
//! the artifact builder. The child is placed in its own process group so
//! that cancellation tears down everything it spawned, not just the direct
//! child.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::provider::{CapturedLogs, SandboxError};

/// Maximum stdout or stderr size captured per stream (10 MiB).
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// How often `/proc/{pid}/status` is sampled for resident memory.
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for output pipes to close after the child is gone.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `PATH` used when the server's own is unset.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Replace the inherited environment with the minimal one tenant code sees:
/// the server's `PATH`, `LANG` and `HOME` pointing at `home`. Callers add
/// their own variables afterwards.
pub fn isolate_env(cmd: &mut Command, home: &Path) {
    cmd.env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.into()))
        .env("HOME", home)
        .env("LANG", "C.UTF-8");
}

/// Limits enforced by [`run_command`] itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLimits {
    /// Kill the process group once resident memory exceeds this many bytes.
    pub memory_limit_bytes: Option<u64>,
    /// Kill the process group once this much wall-clock time has passed.
    pub deadline: Option<Duration>,
}

/// Captured result of a process that exited on its own.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Highest resident set size observed for the direct child.
    pub peak_memory_bytes: Option<u64>,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Cancelled,
    OutOfMemory,
    Deadline,
}

/// Spawn `cmd`, feed it `stdin`, capture its output and enforce `limits`
/// until it exits or `cancel` fires.
///
/// The caller sets program, arguments, environment and working directory.
pub async fn run_command(
    cmd: &mut Command,
    stdin: Option<Vec<u8>>,
    limits: ProcessLimits,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, SandboxError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
    let pid = child.id();
    let mut group_guard = GroupGuard(pid);

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), stdin) {
        tokio::spawn(async move {
            // The child may exit without reading its input.
            let _ = pipe.write_all(&bytes).await;
            drop(pipe);
        });
    }

    let deadline = async move {
        match limits.deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut sampler = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
    sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut peak_memory: Option<u64> = None;

    let outcome = loop {
        tokio::select! {
            status = child.wait() => break Outcome::Exited(status?),
            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = &mut deadline => break Outcome::Deadline,
            _ = sampler.tick() => {
                let Some(rss) = pid.and_then(resident_memory_bytes) else { continue };
                peak_memory = Some(peak_memory.map_or(rss, |p| p.max(rss)));
                if limits.memory_limit_bytes.is_some_and(|limit| rss > limit) {
                    break Outcome::OutOfMemory;
                }
            }
        }
    };

    group_guard.0 = None;

    // Tear down the child's process group. A child that is still running
    // pins the group id, so it is signalled before being reaped. Once the
    // child has been reaped the id is only ours while another member of the
    // group survives.
    match (&outcome, pid) {
        (Outcome::Exited(_), Some(pid)) => {
            if process_group_alive(pid) {
                kill_process_group(pid);
            }
        }
        (_, pid) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.kill().await;
        }
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    match outcome {
        Outcome::Exited(status) => Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration_ms,
            peak_memory_bytes: peak_memory,
        }),
        Outcome::Cancelled => Err(SandboxError::Cancelled {
            logs: CapturedLogs { stdout, stderr },
        }),
        Outcome::Deadline => Err(SandboxError::DeadlineExceeded {
            elapsed_ms: duration_ms,
            logs: CapturedLogs { stdout, stderr },
        }),
        Outcome::OutOfMemory => Err(SandboxError::OutOfMemory {
            limit_mb: limits
                .memory_limit_bytes
                .map_or(0, |b| (b / (1024 * 1024)) as u32),
            peak_bytes: peak_memory,
            logs: CapturedLogs { stdout, stderr },
        }),
    }
}

/// Kills the child's process group when [`run_command`] is dropped while
/// the child is still running.
struct GroupGuard(Option<u32>);

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            kill_process_group(pid);
        }
    }
}

/// Send SIGKILL to every process in the group led by `pid`.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else { return };
    // SAFETY: kill(2) with a negative pid only signals the process group;
    // ESRCH for an already-empty group is expected and ignored.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

/// Whether any process is still a member of the group led by `pid`.
#[cfg(unix)]
fn process_group_alive(pid: u32) -> bool {
    let Ok(pgid) = i32::try_from(pid) else { return false };
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_group_alive(_pid: u32) -> bool {
    false
}

/// Resident set size of `pid` from `/proc/{pid}/status`, if available.
fn resident_memory_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

async fn drain(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    let bytes = match tokio::time::timeout(STREAM_DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => bytes,
        _ => Vec::new(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
