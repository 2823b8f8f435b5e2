//! Child process execution with bounded capture.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::command::ResolvedCommand;
use crate::approval::wait_cancelled;
use crate::error::{Result, SkillError};

/// Readers still holding a pipe after the child exited (a backgrounded
/// grandchild, usually) are abandoned after this long.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of one child run.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Per-run limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunLimits {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `command`, feed `stdin_payload`, and collect output.
///
/// Timeout and cancellation kill the child and surface as
/// [`SkillError::Timeout`] / [`SkillError::Cancelled`].
pub(crate) async fn run_process(
    command: &ResolvedCommand,
    cwd: &Path,
    env: &[(String, String)],
    stdin_payload: Vec<u8>,
    limits: RunLimits,
    cancel: &mut watch::Receiver<bool>,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        SkillError::Runtime(format!(
            "Failed to spawn {}: {}",
            command.program.display(),
            e
        ))
    })?;
    debug!(program = %command.program.display(), pid = ?child.id(), "Spawned skill process");

    let stdout = spawn_reader(child.stdout.take(), limits.max_output_bytes);
    let stderr = spawn_reader(child.stderr.take(), limits.max_output_bytes);

    let stdin = child.stdin.take();
    let writer = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            // A child that never reads stdin closes the pipe; that is fine.
            let _ = stdin.write_all(&stdin_payload).await;
            let _ = stdin.shutdown().await;
        }
    });

    let exit = tokio::select! {
        status = tokio::time::timeout(Duration::from_secs(limits.timeout_secs), child.wait()) => {
            match status {
                Ok(status) => Exit::Status(status),
                Err(_) => Exit::TimedOut,
            }
        }
        _ = wait_cancelled(cancel) => Exit::Cancelled,
    };

    let status = match exit {
        Exit::Status(status) => status,
        Exit::TimedOut => {
            warn!(timeout_secs = limits.timeout_secs, "Skill process timed out, killing");
            abandon(&mut child, [stdout, stderr], writer).await;
            return Err(SkillError::Timeout {
                seconds: limits.timeout_secs,
            });
        }
        Exit::Cancelled => {
            warn!("Skill process cancelled, killing");
            abandon(&mut child, [stdout, stderr], writer).await;
            return Err(SkillError::Cancelled);
        }
    };
    let status = status.map_err(|e| SkillError::Runtime(format!("Failed to wait for process: {}", e)))?;
    writer.abort();

    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) =
        tokio::join!(collect(stdout), collect(stderr));

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Bytes read from one stream so far. Shared with the reader task so a
/// reader abandoned after the drain grace still leaves what it read.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

struct Capture {
    task: JoinHandle<()>,
    buffer: Arc<Mutex<Captured>>,
}

impl Capture {
    fn abort(&self) {
        self.task.abort();
    }
}

fn spawn_reader<R>(reader: Option<R>, limit: usize) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(Captured::default()));
    let sink = Arc::clone(&buffer);
    let task = tokio::spawn(async move {
        if let Some(reader) = reader {
            read_bounded(reader, limit, &sink).await;
        }
    });
    Capture { task, buffer }
}

/// Read to EOF keeping at most `limit` bytes. The rest is drained and
/// dropped so the child never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize, sink: &Mutex<Captured>) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut captured = sink.lock().await;
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.bytes.extend_from_slice(&chunk[..room]);
                    captured.truncated = true;
                } else {
                    captured.bytes.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) => {
                debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}

/// Wait for the reader to hit EOF, at most [`DRAIN_GRACE`]. A pipe still
/// held open by a leftover grandchild is abandoned; the bytes read until
/// then are kept.
async fn collect(mut capture: Capture) -> (String, bool) {
    if tokio::time::timeout(DRAIN_GRACE, &mut capture.task).await.is_err() {
        warn!("Output pipe still open after the process exited, keeping what was read");
        capture.abort();
    }
    let captured = std::mem::take(&mut *capture.buffer.lock().await);
    (String::from_utf8_lossy(&captured.bytes).into_owned(), captured.truncated)
}

async fn abandon(child: &mut tokio::process::Child, captures: [Capture; 2], writer: JoinHandle<()>) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Kill after timeout failed");
    }
    writer.abort();
    for capture in captures {
        capture.abort();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> ResolvedCommand {
        ResolvedCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn limits(timeout_secs: u64, max_output_bytes: usize) -> RunLimits {
        RunLimits {
            timeout_secs,
            max_output_bytes,
        }
    }

    #[tokio::test]
    async fn test_stdin_and_exit_code() {
        let (_tx, mut rx) = watch::channel(false);
        let out = run_process(
            &sh("cat; echo oops >&2; exit 3"),
            Path::new("."),
            &[],
            b"hello".to_vec(),
            limits(10, 1024),
            &mut rx,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_output_ceiling_truncates() {
        let (_tx, mut rx) = watch::channel(false);
        let out = run_process(
            &sh("i=0; while [ $i -lt 200 ]; do echo 0123456789012345678901234567890123456789; i=$((i+1)); done"),
            Path::new("."),
            &[],
            Vec::new(),
            limits(10, 100),
            &mut rx,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), 100);
        assert!(out.stdout_truncated);
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (_tx, mut rx) = watch::channel(false);
        let out = run_process(
            &sh("printf '%s' \"$GREETING\"; pwd >&2"),
            tmp.path(),
            &[("GREETING".to_string(), "hi there".to_string())],
            Vec::new(),
            limits(10, 1024),
            &mut rx,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "hi there");
        let cwd = std::fs::canonicalize(out.stderr.trim()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(tmp.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let (_tx, mut rx) = watch::channel(false);
        let started = std::time::Instant::now();
        let err = run_process(&sh("sleep 5"), Path::new("."), &[], Vec::new(), limits(1, 1024), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::Timeout { seconds: 1 }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancel_kills() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let err = run_process(&sh("sleep 5"), Path::new("."), &[], Vec::new(), limits(10, 1024), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::Cancelled));
    }

    #[tokio::test]
    async fn test_output_survives_pipe_held_by_grandchild() {
        let (_tx, mut rx) = watch::channel(false);
        let started = std::time::Instant::now();
        let out = run_process(
            &sh("sleep 5 & echo '{\"ok\": true}'"),
            Path::new("."),
            &[],
            Vec::new(),
            limits(10, 1024),
            &mut rx,
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), r#"{"ok": true}"#);
        assert!(!out.stdout_truncated);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_runtime_error() {
        let (_tx, mut rx) = watch::channel(false);
        let cmd = ResolvedCommand {
            program: PathBuf::from("/nonexistent/interpreter"),
            args: vec![],
        };
        let err = run_process(&cmd, Path::new("."), &[], Vec::new(), limits(5, 1024), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::Runtime(_)));
    }
}
