//! Local shell strategy: the fallback backend that always handles.

use super::{ExecutionConfig, ExecutionStrategy, StrategyContext};
use crate::environment::EnvLayers;
use crate::error::EngineError;
use crate::model::{Task, Workflow};
use crate::shell;

/// Runs the command through a local shell in the task's working directory,
/// with the full merged environment (host underneath the declared layers).
pub struct LocalStrategy;

impl ExecutionStrategy for LocalStrategy {
    fn name(&self) -> &str {
        "local"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn can_handle(&self, _workflow: &Workflow, _task: &Task) -> bool {
        true
    }

    fn build_config(
        &self,
        command: &str,
        task: &Task,
        ctx: &StrategyContext<'_>,
    ) -> Result<ExecutionConfig, EngineError> {
        let invocation = shell::invocation_for(task.shell.as_deref(), command)?;
        let env = EnvLayers {
            workflow: &ctx.workflow.environment,
            additional: ctx.additional_env,
            task: &task.environment,
        }
        .resolve_local();
        let working_dir = task
            .working_directory
            .clone()
            .or_else(|| ctx.working_dir.map(|p| p.to_path_buf()));

        Ok(ExecutionConfig {
            program: invocation.executable,
            args: invocation.args,
            working_dir,
            env,
        })
    }
}
