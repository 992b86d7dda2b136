//! Workflow TOML parser with validation.
//!
//! Parses a `workflow.toml` string into the engine's [`Workflow`] and
//! validates:
//! - At least one task; task ids are unique (case-insensitive) and
//!   commands are non-empty.
//! - `depends_on` references point to declared task ids.
//! - Declared shells are known to the shell provider.
//! - Conditions parse under the expression grammar.
//! - Input specs name exactly one source; pipe sources must be declared
//!   dependencies (so they finish in a strictly earlier wave).
//! - The dependency graph is acyclic.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use riptide_core::error::EngineError;
use riptide_core::expr;
use riptide_core::model::{
    ContainerConfig, InputSpec, OutputKind, OutputSpec, RetryPolicy, SshConfig, Task, Workflow,
};
use riptide_core::shell;

/// One validation finding.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: &'static str,
    pub message: String,
    pub task_id: Option<String>,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.task_id {
            Some(task) => write!(f, "[{}] task `{task}`: {}", self.code, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Errors from parsing or validating a workflow file.
#[derive(Debug, Error)]
pub enum WorkflowFileError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("workflow validation failed with {} finding(s)", .0.len())]
    Invalid(Vec<Diagnostic>),
}

impl WorkflowFileError {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            WorkflowFileError::Toml(e) => vec![Diagnostic {
                code: "toml",
                message: e.to_string(),
                task_id: None,
            }],
            WorkflowFileError::Invalid(list) => list.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TOML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowToml {
    workflow: WorkflowSection,
    #[serde(default)]
    tasks: Vec<TaskToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowSection {
    name: String,
    description: Option<String>,
    #[serde(default)]
    default_timeout_ms: u64,
    retry: Option<RetryToml>,
    #[serde(default)]
    environment: HashMap<String, String>,
    container: Option<ContainerConfig>,
    ssh: Option<SshConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskToml {
    id: String,
    name: Option<String>,
    #[serde(default)]
    command: String,
    shell: Option<String>,
    working_directory: Option<PathBuf>,
    #[serde(default)]
    environment: HashMap<String, String>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(rename = "if")]
    condition: Option<String>,
    retry: Option<RetryToml>,
    timeout_ms: Option<u64>,
    input: Option<InputToml>,
    output: Option<OutputToml>,
    container: Option<ContainerConfig>,
    ssh: Option<SshConfig>,
    #[serde(default)]
    continue_on_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryToml {
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    use_exponential_backoff: bool,
    #[serde(default = "default_max_delay_ms")]
    max_delay_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl From<RetryToml> for RetryPolicy {
    fn from(r: RetryToml) -> Self {
        RetryPolicy {
            max_retries: r.max_retries,
            delay_ms: r.delay_ms,
            use_exponential_backoff: r.use_exponential_backoff,
            max_delay_ms: r.max_delay_ms,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputToml {
    text: Option<String>,
    file: Option<PathBuf>,
    pipe: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputToml {
    /// "stdout" (default) or "bytes".
    to: Option<String>,
    file: Option<PathBuf>,
    #[serde(default)]
    capture_stderr: bool,
}

// ---------------------------------------------------------------------------
// Parse + validate
// ---------------------------------------------------------------------------

/// Parse and validate a workflow TOML string into an engine [`Workflow`].
pub fn parse_workflow_toml(content: &str) -> Result<Workflow, WorkflowFileError> {
    let raw: WorkflowToml = toml::from_str(content)?;
    let mut diagnostics = Vec::new();

    if raw.tasks.is_empty() {
        diagnostics.push(Diagnostic {
            code: "no_tasks",
            message: "workflow must contain at least one task".to_string(),
            task_id: None,
        });
    }

    // Unique ids, case-insensitive.
    let mut seen = HashSet::new();
    for task in &raw.tasks {
        if !seen.insert(task.id.to_lowercase()) {
            diagnostics.push(Diagnostic {
                code: "duplicate_task_id",
                message: "task id is declared more than once (ids are case-insensitive)"
                    .to_string(),
                task_id: Some(task.id.clone()),
            });
        }
    }
    let declared: HashSet<&str> = raw.tasks.iter().map(|t| t.id.as_str()).collect();

    for task in &raw.tasks {
        if task.command.trim().is_empty() {
            diagnostics.push(Diagnostic {
                code: "empty_command",
                message: "task has no command".to_string(),
                task_id: Some(task.id.clone()),
            });
        }

        for dep in &task.depends_on {
            if !declared.contains(dep.as_str()) {
                diagnostics.push(Diagnostic {
                    code: "unknown_dependency",
                    message: format!("depends on unknown task `{dep}`"),
                    task_id: Some(task.id.clone()),
                });
            }
        }

        if let Some(shell_name) = &task.shell {
            if !shell::SUPPORTED_SHELLS.contains(&shell_name.as_str()) {
                diagnostics.push(Diagnostic {
                    code: "unsupported_shell",
                    message: format!(
                        "shell `{shell_name}` is not supported (supported: {})",
                        shell::SUPPORTED_SHELLS.join(", ")
                    ),
                    task_id: Some(task.id.clone()),
                });
            }
        }

        if let Some(condition) = &task.condition {
            if let Err(e) = expr::parse(condition) {
                diagnostics.push(Diagnostic {
                    code: "invalid_condition",
                    message: e.to_string(),
                    task_id: Some(task.id.clone()),
                });
            }
        }

        if let Some(input) = &task.input {
            let sources =
                [input.text.is_some(), input.file.is_some(), input.pipe.is_some()]
                    .iter()
                    .filter(|&&b| b)
                    .count();
            if sources != 1 {
                diagnostics.push(Diagnostic {
                    code: "invalid_input",
                    message: "input must declare exactly one of `text`, `file`, `pipe`"
                        .to_string(),
                    task_id: Some(task.id.clone()),
                });
            }
            if let Some(pipe) = &input.pipe {
                // An upstream in the same wave would race; requiring a
                // declared dependency pins it to a strictly earlier wave.
                if !task.depends_on.contains(pipe) {
                    diagnostics.push(Diagnostic {
                        code: "pipe_source_not_dependency",
                        message: format!(
                            "pipe input references `{pipe}`, which is not in depends_on"
                        ),
                        task_id: Some(task.id.clone()),
                    });
                }
            }
        }

        if let Some(output) = &task.output {
            let to_valid = matches!(output.to.as_deref(), None | Some("stdout") | Some("bytes"));
            if !to_valid || (output.to.is_some() && output.file.is_some()) {
                diagnostics.push(Diagnostic {
                    code: "invalid_output",
                    message: "output `to` must be \"stdout\" or \"bytes\", and cannot be \
                              combined with `file`"
                        .to_string(),
                    task_id: Some(task.id.clone()),
                });
            }
        }
    }

    let workflow = build_workflow(raw);

    // Cycle detection only once the reference graph is sound.
    if diagnostics.is_empty() {
        if let Err(EngineError::CircularDependency { cycle }) = riptide_core::plan(&workflow) {
            diagnostics.push(Diagnostic {
                code: "dependency_cycle",
                message: format!("dependency cycle: {cycle}"),
                task_id: None,
            });
        }
    }

    if diagnostics.is_empty() {
        Ok(workflow)
    } else {
        Err(WorkflowFileError::Invalid(diagnostics))
    }
}

fn build_workflow(raw: WorkflowToml) -> Workflow {
    let tasks = raw.tasks.into_iter().map(build_task).collect();
    Workflow {
        name: raw.workflow.name,
        description: raw.workflow.description,
        default_timeout_ms: raw.workflow.default_timeout_ms,
        default_retry: raw.workflow.retry.map(Into::into).unwrap_or_default(),
        environment: raw.workflow.environment,
        container: raw.workflow.container,
        ssh: raw.workflow.ssh,
        tasks,
    }
}

fn build_task(raw: TaskToml) -> Task {
    let input = raw.input.and_then(|i| {
        if let Some(text) = i.text {
            Some(InputSpec::Text(text))
        } else if let Some(file) = i.file {
            Some(InputSpec::File(file))
        } else {
            i.pipe.map(InputSpec::Pipe)
        }
    });
    let output = raw
        .output
        .map(|o| OutputSpec {
            kind: if let Some(file) = o.file {
                OutputKind::File(file)
            } else if o.to.as_deref() == Some("bytes") {
                OutputKind::Bytes
            } else {
                OutputKind::Stdout
            },
            capture_stderr: o.capture_stderr,
        })
        .unwrap_or_default();

    Task {
        name: raw.name.unwrap_or_else(|| raw.id.clone()),
        id: raw.id,
        command: raw.command,
        shell: raw.shell,
        working_directory: raw.working_directory,
        environment: raw.environment,
        depends_on: raw.depends_on,
        condition: raw.condition,
        retry: raw.retry.map(Into::into),
        timeout_ms: raw.timeout_ms,
        input,
        output,
        container: raw.container,
        ssh: raw.ssh,
        continue_on_error: raw.continue_on_error,
    }
}
