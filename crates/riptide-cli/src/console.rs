//! Console subscribers: render the event stream to stdout, either as
//! human-readable lines or as JSON lines for machine consumers.

use riptide_core::events::{Event, EventSubscriber};
use riptide_core::model::OutputStream;

/// Emits each event as one JSON object per line.
pub struct JsonLinesSubscriber;

impl EventSubscriber for JsonLinesSubscriber {
    fn on_event(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
        }
    }
}

/// Prints one line per event. Output chunks are prefixed with the task id so
/// interleaved concurrent tasks stay readable.
pub struct ConsoleSubscriber {
    /// Suppress per-line task output (summaries still print).
    pub quiet: bool,
}

impl ConsoleSubscriber {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl EventSubscriber for ConsoleSubscriber {
    fn on_event(&self, event: &Event) {
        match event {
            Event::WorkflowStarted { meta } => {
                println!("==> workflow `{}` started (run {})", meta.workflow_name, meta.run_id);
            }
            Event::WorkflowCompleted { meta } => {
                println!("==> workflow `{}` succeeded", meta.workflow_name);
            }
            Event::WorkflowFailed { meta, error } => match error {
                Some(error) => {
                    println!("==> workflow `{}` failed: {error}", meta.workflow_name);
                }
                None => println!("==> workflow `{}` failed", meta.workflow_name),
            },
            Event::WorkflowCancelled { meta } => {
                println!("==> workflow `{}` cancelled", meta.workflow_name);
            }
            Event::TaskStarted { task, .. } => {
                if task.attempt > 1 {
                    println!("[{}] attempt {} started", task.task_id, task.attempt);
                } else {
                    println!("[{}] started", task.task_id);
                }
            }
            Event::TaskCompleted { task, .. } => {
                println!("[{}] succeeded ({} ms)", task.task_id, task.duration_ms);
            }
            Event::TaskFailed { task, .. } => {
                let detail = task.error_message.as_deref().unwrap_or("failed");
                println!("[{}] failed: {detail}", task.task_id);
            }
            Event::TaskSkipped { task, .. } => {
                println!("[{}] skipped", task.task_id);
            }
            Event::TaskTimedOut { task, .. } => {
                println!("[{}] timed out ({} ms)", task.task_id, task.duration_ms);
            }
            Event::TaskCancelled { task, .. } => {
                println!("[{}] cancelled", task.task_id);
            }
            Event::TaskOutputChunk {
                task_id,
                stream,
                text,
                ..
            } => {
                if !self.quiet {
                    match stream {
                        OutputStream::Stdout => println!("[{task_id}] {text}"),
                        OutputStream::Stderr => eprintln!("[{task_id}] {text}"),
                    }
                }
            }
        }
    }
}
