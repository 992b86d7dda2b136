//! Engine error kinds.
//!
//! One tagged union instead of an exception hierarchy: every failure the
//! engine can report is a variant here, carried on events and in the run
//! result. The run itself never propagates these to the caller as a panic
//! or early return.

use thiserror::Error;

/// Errors raised by the execution engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The dependency graph contains a cycle. `cycle` is a concrete path
    /// such as `a → b → a`.
    #[error("circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    /// A condition or interpolation could not be evaluated.
    #[error("failed to evaluate expression `{expr}`: {reason}")]
    ExpressionEvaluation { expr: String, reason: String },

    /// An input file exceeded the size cap.
    #[error("input for task `{task_id}` is too large: {size} bytes (limit {limit})")]
    InputTooLarge { task_id: String, size: u64, limit: u64 },

    /// An input could not be materialized.
    #[error("input for task `{task_id}` could not be resolved: {reason}")]
    InputIo { task_id: String, reason: String },

    /// A task attempt failed (spawn failure or non-zero exit). Eligible for
    /// retry within the task's retry budget.
    #[error("task `{task_id}` failed: {message}")]
    TaskExecution {
        task_id: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// A task hit its timeout. Never retried.
    #[error("task `{task_id}` timed out after {timeout_ms} ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    /// The requested shell is not known to the shell provider.
    #[error("unsupported shell `{name}` (supported: {supported})")]
    UnsupportedShell { name: String, supported: String },

    /// An output file path escapes the working tree.
    #[error("output path `{path}` contains a parent-directory component")]
    PathTraversal { path: String },
}

impl EngineError {
    /// Whether a failed attempt with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TaskExecution { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_task_execution_is_retryable() {
        let exec = EngineError::TaskExecution {
            task_id: "t".into(),
            exit_code: Some(1),
            message: "exit 1".into(),
        };
        assert!(exec.is_retryable());

        let timeout = EngineError::TaskTimeout {
            task_id: "t".into(),
            timeout_ms: 250,
        };
        assert!(!timeout.is_retryable());

        let shell = EngineError::UnsupportedShell {
            name: "tcsh".into(),
            supported: "bash, sh".into(),
        };
        assert!(!shell.is_retryable());
    }

    #[test]
    fn display_carries_cycle_path() {
        let err = EngineError::CircularDependency {
            cycle: "a → b → a".into(),
        };
        assert!(err.to_string().contains("a → b → a"));
    }
}
