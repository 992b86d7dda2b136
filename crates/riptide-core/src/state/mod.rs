//! Run state: the authoritative record of task outcomes during a run.
//!
//! The coordinator owns the [`RunState`]; tasks mutate it only through the
//! orchestrator, which serializes writes behind a single mutex. Condition
//! evaluation reads a [`RunSnapshot`] so it always sees a consistent view
//! of all prior waves.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::model::{ExecutionStatus, TaskOutput};

/// The recorded outcome of a single task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Option<TaskOutput>,
    /// Number of attempts that were started.
    pub attempts: u32,
    pub error: Option<String>,
    /// Whether this outcome tainted the run. False for tolerated
    /// (`continue_on_error`) failures.
    pub counts_as_failure: bool,
}

impl TaskRecord {
    fn pending() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            exit_code: None,
            output: None,
            attempts: 0,
            error: None,
            counts_as_failure: false,
        }
    }
}

#[derive(Debug, Default)]
struct StateInner {
    records: HashMap<String, TaskRecord>,
    has_failure: bool,
    run_cancelled: bool,
}

/// Mutable run state. All writes go through the orchestrator; readers take
/// snapshots.
#[derive(Debug, Default)]
pub struct RunState {
    inner: Mutex<StateInner>,
}

impl RunState {
    /// Create a state with every listed task in `Pending`.
    pub fn new<I, S>(task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let records = task_ids
            .into_iter()
            .map(|id| (id.into(), TaskRecord::pending()))
            .collect();
        Self {
            inner: Mutex::new(StateInner {
                records,
                has_failure: false,
                run_cancelled: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a task as running its `attempt`-th attempt (1-based).
    pub fn set_running(&self, task_id: &str, attempt: u32) {
        let mut inner = self.lock();
        if let Some(record) = inner.records.get_mut(task_id) {
            record.status = ExecutionStatus::Running;
            record.attempts = attempt;
        }
    }

    /// Record a terminal outcome for a task.
    ///
    /// `counts_as_failure` reflects the task's `continue_on_error` flag: a
    /// tolerated failure is recorded but does not taint the run.
    pub fn finish(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        output: Option<TaskOutput>,
        error: Option<String>,
        counts_as_failure: bool,
    ) {
        let mut inner = self.lock();
        if counts_as_failure {
            inner.has_failure = true;
        }
        if let Some(record) = inner.records.get_mut(task_id) {
            record.status = status;
            record.exit_code = exit_code;
            record.output = output;
            record.error = error;
            record.counts_as_failure = counts_as_failure;
        }
    }

    /// Flag the run as cancelled. Set once by the coordinator when the
    /// cancellation signal is observed.
    pub fn mark_run_cancelled(&self) {
        self.lock().run_cancelled = true;
    }

    /// Take a consistent snapshot of all records and derived flags.
    pub fn snapshot(&self) -> RunSnapshot {
        let inner = self.lock();
        RunSnapshot {
            records: inner.records.clone(),
            has_failure: inner.has_failure,
            run_cancelled: inner.run_cancelled,
        }
    }
}

/// An immutable view of the run state at a point in time.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub records: HashMap<String, TaskRecord>,
    has_failure: bool,
    run_cancelled: bool,
}

impl RunSnapshot {
    pub fn status(&self, task_id: &str) -> Option<ExecutionStatus> {
        self.records.get(task_id).map(|r| r.status)
    }

    pub fn exit_code(&self, task_id: &str) -> Option<i32> {
        self.records.get(task_id).and_then(|r| r.exit_code)
    }

    /// Captured stdout text of a task, when its output shape retains it.
    pub fn stdout_of(&self, task_id: &str) -> Option<&str> {
        self.records
            .get(task_id)
            .and_then(|r| r.output.as_ref())
            .and_then(|o| o.stdout_text())
    }

    /// No task has failed the run (and the run is not cancelled).
    pub fn all_succeeded(&self) -> bool {
        !self.has_failure && !self.run_cancelled
    }

    pub fn has_failure(&self) -> bool {
        self.has_failure
    }

    pub fn is_run_cancelled(&self) -> bool {
        self.run_cancelled
    }

    /// Every listed dependency ended `Succeeded`.
    pub fn dependencies_succeeded(&self, ids: &[String]) -> bool {
        ids.iter()
            .all(|id| self.status(id) == Some(ExecutionStatus::Succeeded))
    }

    /// At least one listed dependency ended `Failed` or `TimedOut`.
    pub fn dependencies_failed(&self, ids: &[String]) -> bool {
        ids.iter().any(|id| {
            matches!(
                self.status(id),
                Some(ExecutionStatus::Failed) | Some(ExecutionStatus::TimedOut)
            )
        })
    }

    /// Aggregate status of the run given what has been recorded so far.
    pub fn overall_status(&self) -> ExecutionStatus {
        if self.run_cancelled {
            ExecutionStatus::Cancelled
        } else if self.has_failure {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        }
    }
}
