//! Workflow and task value objects.
//!
//! A [`Workflow`] is immutable after validation: the parser subsystem builds
//! it, the engine only reads it. Everything mutable during a run lives in
//! [`crate::state::RunState`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap applied to each captured output stream (10 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// A validated workflow definition.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    /// Default per-task timeout in milliseconds. Zero disables the timeout.
    pub default_timeout_ms: u64,
    /// Retry policy applied to tasks that do not declare their own.
    pub default_retry: RetryPolicy,
    /// Workflow-level declared environment.
    pub environment: HashMap<String, String>,
    /// Workflow-level container defaults, shallow-merged under task configs.
    pub container: Option<ContainerConfig>,
    /// Workflow-level SSH defaults, shallow-merged under task configs.
    pub ssh: Option<SshConfig>,
    /// Tasks in declaration order. Ids are unique (case-insensitive).
    pub tasks: Vec<Task>,
}

impl Workflow {
    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Declaration index of a task id, used as the deterministic tie-breaker
    /// when ordering tasks inside a wave.
    pub fn declaration_index(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }
}

/// A single task within a workflow.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub id: String,
    /// Display name; falls back to the id when empty.
    pub name: String,
    /// Shell command string. May contain `${{ … }}` interpolations.
    pub command: String,
    /// Shell override (e.g. "bash", "pwsh"). None means the platform default.
    pub shell: Option<String>,
    pub working_directory: Option<PathBuf>,
    /// Task-level declared environment; wins over workflow-level per key.
    pub environment: HashMap<String, String>,
    pub depends_on: Vec<String>,
    /// Condition expression source. None means `success()`.
    pub condition: Option<String>,
    /// Retry policy override. None means the workflow default.
    pub retry: Option<RetryPolicy>,
    /// Timeout override in milliseconds. None inherits the workflow default;
    /// zero disables the timeout for this task.
    pub timeout_ms: Option<u64>,
    pub input: Option<InputSpec>,
    pub output: OutputSpec,
    pub container: Option<ContainerConfig>,
    pub ssh: Option<SshConfig>,
    /// When true, a failure of this task does not fail the run.
    pub continue_on_error: bool,
}

impl Task {
    /// Effective timeout for this task, in milliseconds (0 = disabled).
    pub fn effective_timeout_ms(&self, workflow: &Workflow) -> u64 {
        self.timeout_ms.unwrap_or(workflow.default_timeout_ms)
    }

    /// Effective retry policy (task override or workflow default).
    pub fn effective_retry<'a>(&'a self, workflow: &'a Workflow) -> &'a RetryPolicy {
        self.retry.as_ref().unwrap_or(&workflow.default_retry)
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Retry policy for a task. Disabled when `max_retries` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub use_exponential_backoff: bool,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            use_exponential_backoff: false,
            max_delay_ms: 0,
        }
    }

    /// Delay to sleep after the `attempt`-th failed attempt (1-based).
    ///
    /// Fixed policy: `delay_ms` for every attempt. Exponential policy:
    /// `min(delay_ms * 2^(attempt-1), max_delay_ms)`. Attempt 0 yields zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.max_retries == 0 {
            return Duration::ZERO;
        }
        let ms = if self.use_exponential_backoff {
            let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
            self.delay_ms.saturating_mul(factor).min(self.max_delay_ms)
        } else {
            self.delay_ms
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Lifecycle status of a task (or of the whole run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
    TimedOut,
}

impl ExecutionStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Which child output stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        })
    }
}

/// Where a task's stdin comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// Inline text, interpolated against the run state before delivery.
    Text(String),
    /// A file read into memory (size-checked against the output cap).
    File(PathBuf),
    /// The captured stdout of an upstream task.
    Pipe(String),
}

/// How a task's captured output is shaped after exit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputSpec {
    pub kind: OutputKind,
    /// When enabled, captured stderr is carried alongside the output.
    pub capture_stderr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// UTF-8 stdout text (the default).
    #[default]
    Stdout,
    /// Raw stdout bytes.
    Bytes,
    /// Stdout written to a file; the run state records the path.
    File(PathBuf),
}

/// The recorded output of a finished task. The shape follows the task's
/// declared [`OutputSpec`]; `stderr` is present only when capture was enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Stdout {
        stdout: String,
        stderr: Option<String>,
    },
    Bytes {
        raw_bytes: Vec<u8>,
        stderr: Option<String>,
    },
    File {
        file_path: PathBuf,
        stderr: Option<String>,
    },
}

impl TaskOutput {
    /// Textual stdout, when the output shape retains it in memory.
    pub fn stdout_text(&self) -> Option<&str> {
        match self {
            TaskOutput::Stdout { stdout, .. } => Some(stdout),
            TaskOutput::Bytes { raw_bytes, .. } => std::str::from_utf8(raw_bytes).ok(),
            TaskOutput::File { .. } => None,
        }
    }
}

/// Container execution settings. Workflow-level and task-level configs are
/// shallow-merged; task fields win when set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Name or id of the container to `exec` into.
    pub container: Option<String>,
    /// Container runtime binary (default "docker").
    pub runtime: Option<String>,
    /// Value for the `CONTAINER_HOST` variable on the client process.
    pub host: Option<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// Shell to invoke inside the container (default "sh").
    pub shell: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl ContainerConfig {
    /// Shallow-merge a workflow-level config under a task-level config.
    ///
    /// Returns `None` iff neither level supplies a container name.
    pub fn merged(workflow: Option<&Self>, task: Option<&Self>) -> Option<Self> {
        let merged = match (workflow, task) {
            (None, None) => return None,
            (Some(w), None) => w.clone(),
            (None, Some(t)) => t.clone(),
            (Some(w), Some(t)) => Self {
                container: t.container.clone().or_else(|| w.container.clone()),
                runtime: t.runtime.clone().or_else(|| w.runtime.clone()),
                host: t.host.clone().or_else(|| w.host.clone()),
                user: t.user.clone().or_else(|| w.user.clone()),
                workdir: t.workdir.clone().or_else(|| w.workdir.clone()),
                shell: t.shell.clone().or_else(|| w.shell.clone()),
                privileged: t.privileged || w.privileged,
                interactive: t.interactive || w.interactive,
                tty: t.tty || w.tty,
                disabled: t.disabled,
            },
        };
        merged.container.is_some().then_some(merged)
    }
}

/// SSH execution settings, merged like [`ContainerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Shell invoked on the remote side (default "sh").
    pub remote_shell: Option<String>,
    /// Extra `-o` options passed verbatim to the ssh client.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl SshConfig {
    /// Shallow-merge a workflow-level config under a task-level config.
    ///
    /// Returns `None` iff neither level supplies a host.
    pub fn merged(workflow: Option<&Self>, task: Option<&Self>) -> Option<Self> {
        let merged = match (workflow, task) {
            (None, None) => return None,
            (Some(w), None) => w.clone(),
            (None, Some(t)) => t.clone(),
            (Some(w), Some(t)) => Self {
                host: t.host.clone().or_else(|| w.host.clone()),
                user: t.user.clone().or_else(|| w.user.clone()),
                port: t.port.or(w.port),
                identity_file: t.identity_file.clone().or_else(|| w.identity_file.clone()),
                remote_shell: t.remote_shell.clone().or_else(|| w.remote_shell.clone()),
                options: if t.options.is_empty() {
                    w.options.clone()
                } else {
                    t.options.clone()
                },
                disabled: t.disabled,
            },
        };
        merged.host.is_some().then_some(merged)
    }
}
