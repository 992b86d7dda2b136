//! Integration tests for the process runner against real `/bin/sh` children.
#![cfg(unix)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use riptide_core::model::OutputStream;
use riptide_core::runner::{
    ChunkSink, CommandRunner, ProcessRequest, ProcessRunner, TRUNCATION_SENTINEL,
};
use riptide_core::strategy::ExecutionConfig;

fn sh(command: &str) -> ExecutionConfig {
    ExecutionConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), command.to_string()],
        working_dir: None,
        env: HashMap::new(),
    }
}

fn request(command: &str) -> ProcessRequest {
    ProcessRequest::new("test-task", sh(command))
}

#[tokio::test]
async fn captures_stdout_and_stderr_separately() {
    let runner = ProcessRunner::new();
    let outcome = runner
        .run(request("echo out; echo err 1>&2"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.success());
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "out\n");
    assert_eq!(String::from_utf8_lossy(&outcome.stderr), "err\n");
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let runner = ProcessRunner::new();
    let outcome = runner
        .run(request("exit 7"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!outcome.success());
    assert!(outcome.ran_to_completion());
    assert_eq!(outcome.exit_code, Some(7));
}

#[tokio::test]
async fn config_env_reaches_the_child() {
    let runner = ProcessRunner::new();
    let mut config = sh("printf '%s' \"$RIPTIDE_TEST_VAR\"");
    config
        .env
        .insert("RIPTIDE_TEST_VAR".to_string(), "visible".to_string());
    let outcome = runner
        .run(ProcessRequest::new("env-task", config), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "visible");
}

#[tokio::test]
async fn working_dir_is_respected() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ProcessRunner::new();
    let mut config = sh("pwd");
    config.working_dir = Some(dir.path().to_path_buf());
    let outcome = runner
        .run(ProcessRequest::new("pwd-task", config), &CancellationToken::new())
        .await
        .unwrap();

    let reported = String::from_utf8_lossy(&outcome.stdout);
    let canonical = dir.path().canonicalize().unwrap();
    assert_eq!(
        std::path::Path::new(reported.trim()).canonicalize().unwrap(),
        canonical
    );
}

#[tokio::test]
async fn stdin_is_delivered_and_closed() {
    let runner = ProcessRunner::new();
    let mut req = request("cat");
    req.stdin = Some(b"fed through stdin".to_vec());
    let outcome = runner.run(req, &CancellationToken::new()).await.unwrap();

    assert!(outcome.success());
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "fed through stdin");
}

#[tokio::test]
async fn chunks_arrive_in_order_with_stream_kinds() {
    let runner = ProcessRunner::new();
    let chunks: Arc<Mutex<Vec<(OutputStream, String)>>> = Arc::new(Mutex::new(vec![]));
    let sink: ChunkSink = {
        let chunks = Arc::clone(&chunks);
        Arc::new(move |stream, text: &str| {
            chunks.lock().unwrap().push((stream, text.to_string()));
        })
    };

    let mut req = request("echo one; echo two; echo three; echo err 1>&2");
    req.chunk_sink = Some(sink);
    let outcome = runner.run(req, &CancellationToken::new()).await.unwrap();
    assert!(outcome.success());

    let chunks = chunks.lock().unwrap();
    let stdout_lines: Vec<&str> = chunks
        .iter()
        .filter(|(s, _)| *s == OutputStream::Stdout)
        .map(|(_, t)| t.as_str())
        .collect();
    assert_eq!(stdout_lines, vec!["one", "two", "three"]);
    assert!(
        chunks
            .iter()
            .any(|(s, t)| *s == OutputStream::Stderr && t == "err")
    );
}

#[tokio::test]
async fn long_output_is_truncated_with_sentinel() {
    let runner = ProcessRunner::new();
    let mut req = request(
        "i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done",
    );
    req.max_output_bytes = 256;
    let outcome = runner.run(req, &CancellationToken::new()).await.unwrap();

    assert!(outcome.success());
    assert!(outcome.stdout.len() <= 256);
    let text = String::from_utf8(outcome.stdout).unwrap();
    assert!(text.ends_with(TRUNCATION_SENTINEL));
    // The retained prefix is an unmangled prefix of the stream.
    let prefix = &text[..text.len() - TRUNCATION_SENTINEL.len()];
    let full: String = "0123456789\n".repeat(200);
    assert!(full.starts_with(prefix));
}

#[tokio::test]
async fn timeout_kills_the_child() {
    let runner = ProcessRunner::with_kill_grace(Duration::from_millis(200));
    let started = Instant::now();
    let mut req = request("sleep 10");
    req.timeout_ms = 250;
    let outcome = runner.run(req, &CancellationToken::new()).await.unwrap();

    assert!(outcome.timed_out);
    assert!(!outcome.cancelled);
    // Killed by signal: no exit code.
    assert_eq!(outcome.exit_code, None);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "kill took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn timeout_keeps_output_produced_before_the_kill() {
    let runner = ProcessRunner::with_kill_grace(Duration::from_millis(200));
    let mut req = request("echo before; sleep 10");
    req.timeout_ms = 300;
    let outcome = runner.run(req, &CancellationToken::new()).await.unwrap();

    assert!(outcome.timed_out);
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "before\n");
}

#[tokio::test]
async fn cancellation_kills_the_child() {
    let runner = ProcessRunner::with_kill_grace(Duration::from_millis(200));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = runner.run(request("sleep 10"), &cancel).await.unwrap();

    assert!(outcome.cancelled);
    assert!(!outcome.timed_out);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "cancel took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn pre_cancelled_token_spawns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let runner = ProcessRunner::new();
    let outcome = runner
        .run(
            request(&format!("touch {}", marker.display())),
            &cancel,
        )
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert!(!marker.exists());
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let runner = ProcessRunner::new();
    let config = ExecutionConfig {
        program: "/nonexistent/riptide-binary".to_string(),
        args: vec![],
        working_dir: None,
        env: HashMap::new(),
    };
    let err = runner
        .run(ProcessRequest::new("ghost", config), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to spawn"));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn zero_timeout_means_no_timeout() {
    let runner = ProcessRunner::new();
    let mut req = request("sleep 0.2; echo done");
    req.timeout_ms = 0;
    let outcome = runner.run(req, &CancellationToken::new()).await.unwrap();

    assert!(outcome.success());
    assert_eq!(String::from_utf8_lossy(&outcome.stdout), "done\n");
}
