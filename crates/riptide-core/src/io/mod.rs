//! Input materialization and output shaping.
//!
//! Inputs become the bytes written to the child's stdin: inline text is
//! interpolated first, files are size-checked against the output cap, and
//! pipes read the captured stdout of an upstream task. Outputs are shaped
//! after exit according to the task's declared output kind.

use std::path::Path;

use tracing::warn;

use crate::error::EngineError;
use crate::expr::{EvalContext, interpolate};
use crate::model::{InputSpec, OutputKind, OutputSpec, Task, TaskOutput};
use crate::runner::ProcessOutcome;

/// Materialize a task's stdin bytes, if it declares an input.
pub async fn resolve_input(
    task: &Task,
    ctx: &EvalContext<'_>,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, EngineError> {
    match &task.input {
        None => Ok(None),
        Some(InputSpec::Text(template)) => {
            let text = interpolate(template, ctx)?;
            Ok(Some(text.into_bytes()))
        }
        Some(InputSpec::File(path)) => {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| EngineError::InputIo {
                    task_id: task.id.clone(),
                    reason: format!("cannot stat `{}`: {e}", path.display()),
                })?;
            if meta.len() > max_bytes as u64 {
                return Err(EngineError::InputTooLarge {
                    task_id: task.id.clone(),
                    size: meta.len(),
                    limit: max_bytes as u64,
                });
            }
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| EngineError::InputIo {
                    task_id: task.id.clone(),
                    reason: format!("cannot read `{}`: {e}", path.display()),
                })?;
            Ok(Some(bytes))
        }
        Some(InputSpec::Pipe(source)) => {
            // The validator guarantees the source is a declared dependency,
            // so a missing output means it did not finish in an earlier wave.
            let stdout = ctx.snapshot.stdout_of(source).ok_or_else(|| {
                EngineError::InputIo {
                    task_id: task.id.clone(),
                    reason: format!("pipe source `{source}` has no captured stdout"),
                }
            })?;
            Ok(Some(stdout.as_bytes().to_vec()))
        }
    }
}

/// Shape a successful attempt's captured output per the task's output spec.
pub async fn shape_output(task: &Task, outcome: &ProcessOutcome) -> Result<TaskOutput, EngineError> {
    let stderr = captured_stderr(&task.output, outcome);
    match &task.output.kind {
        OutputKind::Stdout => Ok(TaskOutput::Stdout {
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stderr,
        }),
        OutputKind::Bytes => Ok(TaskOutput::Bytes {
            raw_bytes: outcome.stdout.clone(),
            stderr,
        }),
        OutputKind::File(path) => {
            reject_traversal(path)?;
            match write_output_file(path, &outcome.stdout).await {
                Ok(()) => Ok(TaskOutput::File {
                    file_path: path.clone(),
                    stderr,
                }),
                Err(e) => {
                    // IO failure falls back to inline stdout so the run can
                    // still observe the output.
                    warn!(
                        task_id = %task.id,
                        path = %path.display(),
                        error = %e,
                        "failed to write output file, keeping stdout inline"
                    );
                    Ok(TaskOutput::Stdout {
                        stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                        stderr,
                    })
                }
            }
        }
    }
}

/// Inline stdout shape, used when recording failed attempts.
pub fn inline_output(spec: &OutputSpec, outcome: &ProcessOutcome) -> TaskOutput {
    TaskOutput::Stdout {
        stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
        stderr: captured_stderr(spec, outcome),
    }
}

fn captured_stderr(spec: &OutputSpec, outcome: &ProcessOutcome) -> Option<String> {
    spec.capture_stderr
        .then(|| String::from_utf8_lossy(&outcome.stderr).into_owned())
}

/// Reject any output path with a parent-directory component.
fn reject_traversal(path: &Path) -> Result<(), EngineError> {
    let escapes = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes {
        Err(EngineError::PathTraversal {
            path: path.display().to_string(),
        })
    } else {
        Ok(())
    }
}

async fn write_output_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, bytes).await
}
