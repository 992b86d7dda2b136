//! Run coordinator: drives the wave schedule to completion.
//!
//! Waves are strictly serialized; tasks inside a wave fan out concurrently,
//! bounded by `max_parallel`. Completion writes of wave *w* happen before
//! any condition read of wave *w*+1 because the coordinator awaits the
//! whole wave before moving on. Cancellation is cooperative: the single
//! token is observed by running processes, retry sleeps, input reads, and
//! the wave launch loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{Event, EventBus, EventMeta, TaskEventInfo};
use crate::expr::{FunctionRegistry, is_literal_always};
use crate::model::{DEFAULT_MAX_OUTPUT_BYTES, ExecutionStatus, Workflow};
use crate::orchestrator::{TaskFinish, TaskRun, run_task};
use crate::planner;
use crate::runner::{CommandRunner, ProcessRunner};
use crate::state::{RunState, TaskRecord};
use crate::strategy::StrategySet;

/// Knobs for a run.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Fan-out bound inside a wave. Defaults to the number of logical CPUs.
    pub max_parallel: usize,
    /// Cap applied to each captured output stream.
    pub max_output_bytes: usize,
    /// Whether literally-`always()` tasks still run after cancellation.
    /// The default is false: cleanup runs on failure, not on cancel.
    pub run_always_on_cancel: bool,
    /// Fallback working directory for tasks that declare none.
    pub working_dir: Option<PathBuf>,
    /// Ambient additional variables layered between workflow and task env.
    pub additional_env: HashMap<String, String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            run_always_on_cancel: false,
            working_dir: None,
            additional_env: HashMap::new(),
        }
    }
}

/// The aggregate result of a run. The run never throws: planner and task
/// errors all land here and on the event stream.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub tasks: HashMap<String, TaskRecord>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl RunResult {
    pub fn task_status(&self, task_id: &str) -> Option<ExecutionStatus> {
        self.tasks.get(task_id).map(|r| r.status)
    }
}

/// Executes validated workflows.
pub struct RunCoordinator {
    config: CoordinatorConfig,
    bus: Arc<EventBus>,
    strategies: Arc<StrategySet>,
    registry: Arc<FunctionRegistry>,
    runner: Arc<dyn CommandRunner>,
}

impl RunCoordinator {
    pub fn new(config: CoordinatorConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus: Arc::new(bus),
            strategies: Arc::new(StrategySet::builtin()),
            registry: Arc::new(FunctionRegistry::with_builtins()),
            runner: Arc::new(ProcessRunner::new()),
        }
    }

    /// Substitute the process runner (tests use a scripted one).
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Substitute the strategy set.
    pub fn with_strategies(mut self, strategies: StrategySet) -> Self {
        self.strategies = Arc::new(strategies);
        self
    }

    /// Substitute the expression function registry.
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Run the workflow to completion.
    pub async fn execute(&self, workflow: Workflow, cancel: CancellationToken) -> RunResult {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let workflow = Arc::new(workflow);

        let plan = match planner::plan(&workflow) {
            Ok(plan) => plan,
            Err(e) => {
                // No process is spawned for a cyclic workflow; the failure
                // is reported before any task event.
                let message = e.to_string();
                self.bus.publish(Event::WorkflowFailed {
                    meta: EventMeta::now(&workflow.name, run_id),
                    error: Some(message.clone()),
                });
                return RunResult {
                    run_id,
                    workflow_name: workflow.name.clone(),
                    status: ExecutionStatus::Failed,
                    tasks: HashMap::new(),
                    error: Some(message),
                    duration: started.elapsed(),
                };
            }
        };

        info!(
            workflow = %workflow.name,
            run_id = %run_id,
            waves = plan.waves.len(),
            tasks = workflow.tasks.len(),
            "starting run"
        );
        let state = Arc::new(RunState::new(workflow.tasks.iter().map(|t| t.id.clone())));
        self.bus.publish(Event::WorkflowStarted {
            meta: EventMeta::now(&workflow.name, run_id),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let additional_env = Arc::new(self.config.additional_env.clone());

        for (index, wave) in plan.waves.iter().enumerate() {
            debug!(wave = index, tasks = ?wave.tasks, always = wave.always, "starting wave");
            let (tx, mut rx) = mpsc::channel::<TaskFinish>(wave.tasks.len().max(1));

            for task_id in &wave.tasks {
                // After cancellation no new task starts, except literal
                // always() cleanup when configured to run.
                if cancel.is_cancelled() {
                    let allowed = self.config.run_always_on_cancel
                        && workflow
                            .task(task_id)
                            .is_some_and(|t| is_literal_always(t.condition.as_deref()));
                    if !allowed {
                        self.cancel_unstarted(&workflow, &state, run_id, task_id);
                        continue;
                    }
                }

                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let run = TaskRun {
                    workflow: Arc::clone(&workflow),
                    task_id: task_id.clone(),
                    run_id,
                    state: Arc::clone(&state),
                    bus: Arc::clone(&self.bus),
                    strategies: Arc::clone(&self.strategies),
                    registry: Arc::clone(&self.registry),
                    runner: Arc::clone(&self.runner),
                    additional_env: Arc::clone(&additional_env),
                    working_dir: self.config.working_dir.clone(),
                    max_output_bytes: self.config.max_output_bytes,
                    run_always_on_cancel: self.config.run_always_on_cancel,
                    cancel: cancel.clone(),
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let finish = run_task(run).await;
                    drop(permit);
                    let _ = tx.send(finish).await;
                });
            }
            drop(tx);

            // Wave barrier. Cancellation propagates through the runner, so
            // this drains even mid-cancel: every launched task reaches a
            // terminal state before the next wave is considered.
            while let Some(finish) = rx.recv().await {
                debug!(task_id = %finish.task_id, status = %finish.status, "task finished");
            }
        }

        if cancel.is_cancelled() {
            state.mark_run_cancelled();
        }

        let snapshot = state.snapshot();
        let status = snapshot.overall_status();
        let error = match status {
            ExecutionStatus::Failed => Some(self.failure_summary(&workflow, &snapshot.records)),
            _ => None,
        };

        let meta = EventMeta::now(&workflow.name, run_id);
        match status {
            ExecutionStatus::Cancelled => self.bus.publish(Event::WorkflowCancelled { meta }),
            ExecutionStatus::Failed => self.bus.publish(Event::WorkflowFailed {
                meta,
                error: error.clone(),
            }),
            _ => self.bus.publish(Event::WorkflowCompleted { meta }),
        }

        info!(
            workflow = %workflow.name,
            run_id = %run_id,
            status = %status,
            "run finished"
        );
        RunResult {
            run_id,
            workflow_name: workflow.name.clone(),
            status,
            tasks: snapshot.records,
            error,
            duration: started.elapsed(),
        }
    }

    /// Record and report a task that the cancelled run never started.
    fn cancel_unstarted(
        &self,
        workflow: &Workflow,
        state: &RunState,
        run_id: Uuid,
        task_id: &str,
    ) {
        state.finish(task_id, ExecutionStatus::Cancelled, None, None, None, false);
        self.bus.publish(Event::TaskCancelled {
            meta: EventMeta::now(&workflow.name, run_id),
            task: TaskEventInfo {
                task_id: task_id.to_string(),
                attempt: 0,
                status: ExecutionStatus::Cancelled,
                exit_code: None,
                duration_ms: 0,
                error_message: None,
            },
        });
    }

    /// Declaration-ordered list of run-failing tasks for the terminal event.
    fn failure_summary(
        &self,
        workflow: &Workflow,
        records: &HashMap<String, TaskRecord>,
    ) -> String {
        let failed: Vec<&str> = workflow
            .tasks
            .iter()
            .filter(|t| {
                !t.continue_on_error
                    && records.get(&t.id).is_some_and(|r| {
                        matches!(
                            r.status,
                            ExecutionStatus::Failed | ExecutionStatus::TimedOut
                        )
                    })
            })
            .map(|t| t.id.as_str())
            .collect();
        format!("tasks failed: {}", failed.join(", "))
    }
}

/// Map a finished run to the conventional CLI exit code: 0 succeeded,
/// 1 failed, 2 cancelled, 3 failed with only timeouts.
///
/// Only outcomes that tainted the run decide between 1 and 3: a tolerated
/// (`continue_on_error`) failure alongside a tainting timeout still maps
/// to 3.
pub fn exit_code_for(result: &RunResult) -> i32 {
    match result.status {
        ExecutionStatus::Succeeded => 0,
        ExecutionStatus::Cancelled => 2,
        ExecutionStatus::Failed => {
            let tainting = |status: ExecutionStatus| {
                result
                    .tasks
                    .values()
                    .any(|r| r.counts_as_failure && r.status == status)
            };
            if tainting(ExecutionStatus::TimedOut) && !tainting(ExecutionStatus::Failed) {
                3
            } else {
                1
            }
        }
        _ => 1,
    }
}

