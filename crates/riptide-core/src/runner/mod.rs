//! Process runner: spawns a child process, streams its output into bounded
//! buffers, and enforces timeout and cancellation.
//!
//! The kill sequence on timeout or cancellation is SIGTERM, a short grace
//! period, then SIGKILL (plain kill on platforms without signals). Children
//! are spawned with `kill_on_drop` so they never outlive the run, even if
//! the coordinator panics.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::model::OutputStream;
use crate::strategy::ExecutionConfig;

/// Suffix appended to a capped stream so consumers can tell output was cut.
pub const TRUNCATION_SENTINEL: &str = "\n...[truncated]";

/// Callback invoked for every line a child writes, in arrival order per
/// stream. Must not block.
pub type ChunkSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Everything needed to run one task attempt.
pub struct ProcessRequest {
    /// Task id, used in diagnostics.
    pub label: String,
    pub config: ExecutionConfig,
    /// Bytes written to the child's stdin before it is closed.
    pub stdin: Option<Vec<u8>>,
    /// Timeout in milliseconds; zero disables it.
    pub timeout_ms: u64,
    /// Cap applied to each captured stream.
    pub max_output_bytes: usize,
    pub chunk_sink: Option<ChunkSink>,
}

/// The observable result of one attempt.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn ran_to_completion(&self) -> bool {
        !self.timed_out && !self.cancelled
    }

    pub fn success(&self) -> bool {
        self.ran_to_completion() && self.exit_code == Some(0)
    }
}

/// Object-safe seam between the orchestrator and process execution, so
/// tests can substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError>;
}

/// The real runner.
pub struct ProcessRunner {
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            kill_grace: Duration::from_secs(2),
        }
    }

    /// Override the SIGTERM→SIGKILL grace period (tests use a short one).
    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    /// SIGTERM, wait for the grace period, then SIGKILL.
    async fn kill_child(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from a child we spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret == 0 {
                if tokio::time::timeout(self.kill_grace, child.wait())
                    .await
                    .is_ok()
                {
                    debug!(pid, "process exited after SIGTERM");
                    return;
                }
                debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
            } else {
                warn!(pid, "SIGTERM failed, sending SIGKILL");
            }
        }
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill child process");
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, EngineError> {
        let started = Instant::now();

        if cancel.is_cancelled() {
            return Ok(ProcessOutcome {
                exit_code: None,
                stdout: vec![],
                stderr: vec![],
                timed_out: false,
                cancelled: true,
                duration: started.elapsed(),
            });
        }

        let ExecutionConfig {
            program,
            args,
            working_dir,
            env,
        } = &request.config;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(if request.stdin.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::TaskExecution {
            task_id: request.label.clone(),
            exit_code: None,
            message: format!("failed to spawn `{program}`: {e}"),
        })?;

        // Readers first, stdin writer second: a child that produces output
        // while we are still feeding stdin must not deadlock on full pipes.
        let stdout_buf = Arc::new(Mutex::new(BoundedBuffer::new(request.max_output_bytes)));
        let stderr_buf = Arc::new(Mutex::new(BoundedBuffer::new(request.max_output_bytes)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                OutputStream::Stdout,
                Arc::clone(&stdout_buf),
                request.chunk_sink.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                OutputStream::Stderr,
                Arc::clone(&stderr_buf),
                request.chunk_sink.clone(),
            )));
        }

        if let Some(bytes) = request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let label = request.label.clone();
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&bytes).await {
                        warn!(task_id = %label, error = %e, "failed to write task input to stdin");
                    }
                    let _ = stdin.shutdown().await;
                    // Dropping stdin closes the pipe so the child sees EOF.
                });
            }
        }

        let timeout_ms = request.timeout_ms;
        let sleep_fut = async move {
            if timeout_ms == 0 {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await
            }
        };
        tokio::pin!(sleep_fut);

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            res = child.wait() => match res {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(task_id = %request.label, error = %e, "error waiting for child");
                    None
                }
            },
            _ = &mut sleep_fut => {
                timed_out = true;
                None
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                None
            }
        };

        if timed_out || cancelled {
            self.kill_child(&mut child).await;
        }

        // Drain remaining output. The grace bound covers grandchildren that
        // inherited the pipes and survived the kill.
        let _ = tokio::time::timeout(
            self.kill_grace,
            futures::future::join_all(readers),
        )
        .await;

        let take = |buf: &Arc<Mutex<BoundedBuffer>>| {
            buf.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take_bytes()
        };

        Ok(ProcessOutcome {
            exit_code: status.and_then(|s| s.code()),
            stdout: take(&stdout_buf),
            stderr: take(&stderr_buf),
            timed_out,
            cancelled,
            duration: started.elapsed(),
        })
    }
}

/// Read a child stream to EOF, appending raw bytes to the bounded buffer and
/// emitting complete lines through the sink in arrival order.
async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    stream: OutputStream,
    buffer: Arc<Mutex<BoundedBuffer>>,
    sink: Option<ChunkSink>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(&chunk[..n]);
                if let Some(sink) = &sink {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line[..pos]);
                        sink(stream, text.trim_end_matches('\r'));
                    }
                }
            }
            Err(e) => {
                warn!(%stream, error = %e, "error reading child output");
                break;
            }
        }
    }
    if !pending.is_empty() {
        if let Some(sink) = &sink {
            sink(stream, &String::from_utf8_lossy(&pending));
        }
    }
}

/// Byte buffer capped at a fixed size. On overflow the content is truncated
/// at a UTF-8 code point boundary and the sentinel is appended on take, so
/// the final length never exceeds the cap.
struct BoundedBuffer {
    cap: usize,
    data: Vec<u8>,
    truncated: bool,
}

impl BoundedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            data: Vec::new(),
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        if self.data.len() + bytes.len() <= self.cap {
            self.data.extend_from_slice(bytes);
            return;
        }
        self.truncated = true;
        let budget = self.cap.saturating_sub(TRUNCATION_SENTINEL.len());
        if self.data.len() >= budget {
            let cut = floor_char_boundary(&self.data, budget);
            self.data.truncate(cut);
        } else {
            let take = floor_char_boundary(bytes, budget - self.data.len());
            self.data.extend_from_slice(&bytes[..take]);
        }
    }

    fn take_bytes(&mut self) -> Vec<u8> {
        if self.truncated && self.data.len() + TRUNCATION_SENTINEL.len() <= self.cap {
            self.data.extend_from_slice(TRUNCATION_SENTINEL.as_bytes());
        }
        std::mem::take(&mut self.data)
    }
}

/// Largest index `<= idx` that does not split a UTF-8 code point.
fn floor_char_boundary(bytes: &[u8], mut idx: usize) -> usize {
    if idx >= bytes.len() {
        return bytes.len();
    }
    while idx > 0 && (bytes[idx] & 0xC0) == 0x80 {
        idx -= 1;
    }
    idx
}

/// Convenience for building a request around an existing config.
impl ProcessRequest {
    pub fn new(label: impl Into<String>, config: ExecutionConfig) -> Self {
        Self {
            label: label.into(),
            config,
            stdin: None,
            timeout_ms: 0,
            max_output_bytes: crate::model::DEFAULT_MAX_OUTPUT_BYTES,
            chunk_sink: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_under_cap_is_untouched() {
        let mut buf = BoundedBuffer::new(64);
        buf.push(b"hello");
        buf.push(b" world");
        assert_eq!(buf.take_bytes(), b"hello world");
    }

    #[test]
    fn buffer_exactly_at_cap_is_not_truncated() {
        let mut buf = BoundedBuffer::new(5);
        buf.push(b"12345");
        assert_eq!(buf.take_bytes(), b"12345");
    }

    #[test]
    fn overflow_appends_sentinel_within_cap() {
        let cap = 64;
        let mut buf = BoundedBuffer::new(cap);
        buf.push("x".repeat(100).as_bytes());
        let out = buf.take_bytes();
        assert!(out.len() <= cap);
        assert!(out.ends_with(TRUNCATION_SENTINEL.as_bytes()));
        // The retained prefix is all x's.
        let prefix_len = out.len() - TRUNCATION_SENTINEL.len();
        assert!(out[..prefix_len].iter().all(|&b| b == b'x'));
    }

    #[test]
    fn overflow_across_multiple_pushes() {
        let cap = 32;
        let mut buf = BoundedBuffer::new(cap);
        for _ in 0..10 {
            buf.push(b"abcdefgh");
        }
        let out = buf.take_bytes();
        assert!(out.len() <= cap);
        assert!(out.ends_with(TRUNCATION_SENTINEL.as_bytes()));
        // Prefix property: the kept bytes are a prefix of the input stream.
        let expected: Vec<u8> = b"abcdefgh".repeat(10);
        let prefix_len = out.len() - TRUNCATION_SENTINEL.len();
        assert_eq!(&out[..prefix_len], &expected[..prefix_len]);
    }

    #[test]
    fn truncation_does_not_split_code_points() {
        // Sentinel is 15 bytes; with cap 20 the budget is 5 bytes, landing
        // in the middle of the second 3-byte character.
        let cap = 20;
        let mut buf = BoundedBuffer::new(cap);
        buf.push("日本語テスト".as_bytes());
        let out = buf.take_bytes();
        assert!(out.len() <= cap);
        let text = String::from_utf8(out).expect("no split code points");
        assert!(text.ends_with(TRUNCATION_SENTINEL));
        assert!(text.starts_with('日'));
    }

    #[test]
    fn cap_smaller_than_sentinel_omits_it() {
        let mut buf = BoundedBuffer::new(4);
        buf.push(b"abcdefgh");
        let out = buf.take_bytes();
        assert!(out.len() <= 4);
    }

    #[test]
    fn floor_char_boundary_walks_back() {
        let bytes = "aé".as_bytes(); // 0x61 0xC3 0xA9
        assert_eq!(floor_char_boundary(bytes, 3), 3);
        assert_eq!(floor_char_boundary(bytes, 2), 1);
        assert_eq!(floor_char_boundary(bytes, 1), 1);
        assert_eq!(floor_char_boundary(bytes, 0), 0);
        assert_eq!(floor_char_boundary(bytes, 10), 3);
    }

    #[test]
    fn outcome_success_requires_zero_exit_and_completion() {
        let base = ProcessOutcome {
            exit_code: Some(0),
            stdout: vec![],
            stderr: vec![],
            timed_out: false,
            cancelled: false,
            duration: Duration::ZERO,
        };
        assert!(base.success());
        assert!(
            !ProcessOutcome {
                exit_code: Some(1),
                ..base.clone()
            }
            .success()
        );
        assert!(
            !ProcessOutcome {
                timed_out: true,
                ..base.clone()
            }
            .success()
        );
        assert!(
            !ProcessOutcome {
                cancelled: true,
                ..base
            }
            .success()
        );
    }
}
