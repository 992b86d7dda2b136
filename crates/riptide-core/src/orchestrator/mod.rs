//! Task orchestrator: runs a single task from condition gating through its
//! attempt loop to a terminal status.
//!
//! The condition is evaluated exactly once, immediately before the first
//! attempt, against a snapshot of all prior waves. Attempts are
//! `1 + max_retries`; the backoff sleep between attempts is cancellable.
//! `TimedOut` and `Cancelled` outcomes are never retried. Every state
//! change is reported through the event bus, and the orchestrator is the
//! single writer of task records on the run state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::environment::EnvLayers;
use crate::error::EngineError;
use crate::events::{Event, EventBus, EventMeta, TaskEventInfo};
use crate::expr::{EvalContext, FunctionRegistry, eval_condition, interpolate, is_literal_always};
use crate::io;
use crate::model::{ExecutionStatus, Task, TaskOutput, Workflow};
use crate::runner::{ChunkSink, CommandRunner, ProcessRequest};
use crate::state::RunState;
use crate::strategy::{StrategyContext, StrategySet};

/// The terminal result handed back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFinish {
    pub task_id: String,
    pub status: ExecutionStatus,
}

/// Everything a task execution needs, cloneable into a spawned task.
pub struct TaskRun {
    pub workflow: Arc<Workflow>,
    pub task_id: String,
    pub run_id: Uuid,
    pub state: Arc<RunState>,
    pub bus: Arc<EventBus>,
    pub strategies: Arc<StrategySet>,
    pub registry: Arc<FunctionRegistry>,
    pub runner: Arc<dyn CommandRunner>,
    pub additional_env: Arc<HashMap<String, String>>,
    pub working_dir: Option<PathBuf>,
    pub max_output_bytes: usize,
    pub run_always_on_cancel: bool,
    pub cancel: CancellationToken,
}

struct Reporter<'a> {
    run: &'a TaskRun,
    task: &'a Task,
    started: Instant,
}

impl Reporter<'_> {
    fn meta(&self) -> EventMeta {
        EventMeta::now(&self.run.workflow.name, self.run.run_id)
    }

    fn info(
        &self,
        attempt: u32,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> TaskEventInfo {
        TaskEventInfo {
            task_id: self.task.id.clone(),
            attempt,
            status,
            exit_code,
            duration_ms: self.started.elapsed().as_millis() as u64,
            error_message: error,
        }
    }

    fn attempt_started(&self, attempt: u32) {
        self.run.state.set_running(&self.task.id, attempt);
        self.run.bus.publish(Event::TaskStarted {
            meta: self.meta(),
            task: self.info(attempt, ExecutionStatus::Running, None, None),
        });
    }

    /// Record the terminal status, emit the matching event, and produce the
    /// coordinator-facing result.
    fn finish(
        &self,
        attempt: u32,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        output: Option<TaskOutput>,
        error: Option<String>,
    ) -> TaskFinish {
        let counts_as_failure = matches!(
            status,
            ExecutionStatus::Failed | ExecutionStatus::TimedOut
        ) && !self.task.continue_on_error;

        self.run.state.finish(
            &self.task.id,
            status,
            exit_code,
            output,
            error.clone(),
            counts_as_failure,
        );

        let meta = self.meta();
        let info = self.info(attempt, status, exit_code, error);
        let event = match status {
            ExecutionStatus::Succeeded => Event::TaskCompleted { meta, task: info },
            ExecutionStatus::Skipped => Event::TaskSkipped { meta, task: info },
            ExecutionStatus::TimedOut => Event::TaskTimedOut { meta, task: info },
            ExecutionStatus::Cancelled => Event::TaskCancelled { meta, task: info },
            _ => Event::TaskFailed { meta, task: info },
        };
        self.run.bus.publish(event);

        TaskFinish {
            task_id: self.task.id.clone(),
            status,
        }
    }
}

/// Run one task to a terminal status.
pub async fn run_task(run: TaskRun) -> TaskFinish {
    let Some(task) = run.workflow.task(&run.task_id) else {
        // Planned ids come from the same workflow; this is unreachable in
        // practice but must not bring the wave down.
        warn!(task_id = %run.task_id, "planned task not found in workflow");
        return TaskFinish {
            task_id: run.task_id.clone(),
            status: ExecutionStatus::Failed,
        };
    };
    let reporter = Reporter {
        run: &run,
        task,
        started: Instant::now(),
    };

    let condition = task.condition.as_deref().unwrap_or("success()");
    let literal_always = is_literal_always(task.condition.as_deref());
    let immune_to_cancel = literal_always && run.run_always_on_cancel;

    // Cancellation gate: once the run is cancelled, only literally-always
    // tasks may still start, and only when the coordinator allows it.
    if run.cancel.is_cancelled() && !immune_to_cancel {
        return reporter.finish(0, ExecutionStatus::Cancelled, None, None, None);
    }

    // An immune task gets a detached token so the runner, the input read,
    // and the backoff sleep do not observe the run-wide cancel.
    let cancel = if immune_to_cancel {
        CancellationToken::new()
    } else {
        run.cancel.clone()
    };

    // Declared environment visible to expressions: workflow < additional
    // < task, never the ambient host env.
    let expr_env = EnvLayers {
        workflow: &run.workflow.environment,
        additional: &run.additional_env,
        task: &task.environment,
    }
    .resolve_isolated();
    let snapshot = run.state.snapshot();
    let ectx = EvalContext {
        snapshot: &snapshot,
        depends_on: &task.depends_on,
        env: &expr_env,
        vars: &run.additional_env,
        registry: &run.registry,
    };

    // Condition, evaluated exactly once.
    let should_run = match eval_condition(condition, &ectx) {
        Ok(b) => b,
        Err(e) if literal_always => {
            // An `always()` task runs on a condition error; the error is
            // only worth a warning.
            warn!(task_id = %task.id, error = %e, "condition error on always() task, running anyway");
            true
        }
        Err(e) => {
            return reporter.finish(
                0,
                ExecutionStatus::Failed,
                None,
                None,
                Some(e.to_string()),
            );
        }
    };
    if !should_run {
        debug!(task_id = %task.id, condition, "condition false, skipping");
        return reporter.finish(0, ExecutionStatus::Skipped, None, None, None);
    }

    // Interpolate the command and build the invocation once; it does not
    // change between attempts.
    let command = match interpolate(&task.command, &ectx) {
        Ok(c) => c,
        Err(e) => {
            return reporter.finish(0, ExecutionStatus::Failed, None, None, Some(e.to_string()));
        }
    };
    let Some(strategy) = run.strategies.select(&run.workflow, task) else {
        return reporter.finish(
            0,
            ExecutionStatus::Failed,
            None,
            None,
            Some("no execution strategy can handle this task".to_string()),
        );
    };
    let sctx = StrategyContext {
        workflow: &run.workflow,
        additional_env: &run.additional_env,
        working_dir: run.working_dir.as_deref(),
    };
    let config = match strategy.build_config(&command, task, &sctx) {
        Ok(c) => c,
        Err(e) => {
            return reporter.finish(0, ExecutionStatus::Failed, None, None, Some(e.to_string()));
        }
    };
    debug!(
        task_id = %task.id,
        strategy = strategy.name(),
        program = %config.program,
        "dispatching task"
    );

    // Inputs are resolved once as well; the read observes cancellation.
    let stdin = tokio::select! {
        res = io::resolve_input(task, &ectx, run.max_output_bytes) => match res {
            Ok(bytes) => bytes,
            Err(e) => {
                return reporter.finish(0, ExecutionStatus::Failed, None, None, Some(e.to_string()));
            }
        },
        _ = cancel.cancelled() => {
            return reporter.finish(0, ExecutionStatus::Cancelled, None, None, None);
        }
    };

    let retry = task.effective_retry(&run.workflow).clone();
    let attempts = 1 + retry.max_retries;
    let timeout_ms = task.effective_timeout_ms(&run.workflow);

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = retry.delay_for_attempt(attempt - 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return reporter.finish(attempt - 1, ExecutionStatus::Cancelled, None, None, None);
                }
            }
        }

        reporter.attempt_started(attempt);

        let sink: ChunkSink = {
            let bus = Arc::clone(&run.bus);
            let workflow_name = run.workflow.name.clone();
            let run_id = run.run_id;
            let task_id = task.id.clone();
            Arc::new(move |stream, text: &str| {
                bus.publish(Event::TaskOutputChunk {
                    meta: EventMeta::now(&workflow_name, run_id),
                    task_id: task_id.clone(),
                    attempt,
                    stream,
                    text: text.to_string(),
                });
            })
        };
        let request = ProcessRequest {
            label: task.id.clone(),
            config: config.clone(),
            stdin: stdin.clone(),
            timeout_ms,
            max_output_bytes: run.max_output_bytes,
            chunk_sink: Some(sink),
        };

        let outcome = match run.runner.run(request, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_retryable() && attempt < attempts {
                    warn!(task_id = %task.id, attempt, error = %e, "attempt errored, will retry");
                    continue;
                }
                return reporter.finish(
                    attempt,
                    ExecutionStatus::Failed,
                    None,
                    None,
                    Some(e.to_string()),
                );
            }
        };

        if outcome.cancelled {
            return reporter.finish(attempt, ExecutionStatus::Cancelled, None, None, None);
        }
        if outcome.timed_out {
            let err = EngineError::TaskTimeout {
                task_id: task.id.clone(),
                timeout_ms,
            };
            let output = io::inline_output(&task.output, &outcome);
            return reporter.finish(
                attempt,
                ExecutionStatus::TimedOut,
                outcome.exit_code,
                Some(output),
                Some(err.to_string()),
            );
        }
        if outcome.exit_code == Some(0) {
            return match io::shape_output(task, &outcome).await {
                Ok(output) => reporter.finish(
                    attempt,
                    ExecutionStatus::Succeeded,
                    outcome.exit_code,
                    Some(output),
                    None,
                ),
                Err(e) => reporter.finish(
                    attempt,
                    ExecutionStatus::Failed,
                    outcome.exit_code,
                    Some(io::inline_output(&task.output, &outcome)),
                    Some(e.to_string()),
                ),
            };
        }

        if attempt < attempts {
            warn!(
                task_id = %task.id,
                attempt,
                exit_code = ?outcome.exit_code,
                "attempt failed, retrying"
            );
            continue;
        }

        let err = EngineError::TaskExecution {
            task_id: task.id.clone(),
            exit_code: outcome.exit_code,
            message: match outcome.exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            },
        };
        let output = io::inline_output(&task.output, &outcome);
        return reporter.finish(
            attempt,
            ExecutionStatus::Failed,
            outcome.exit_code,
            Some(output),
            Some(err.to_string()),
        );
    }

    // The loop always returns; attempts >= 1.
    reporter.finish(attempts, ExecutionStatus::Failed, None, None, None)
}
