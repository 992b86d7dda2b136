//! Container-exec strategy.
//!
//! Builds `<runtime> exec [-i] [-t] [--privileged] [-u user] [-w dir]
//! [-e K=V]… <container> <shell> <shell-args> <cmd>`. Only declared
//! variables are passed with `-e`; the host environment never crosses into
//! the container. When the effective config names a host, the client
//! process gets `CONTAINER_HOST` so the runtime CLI targets it.

use std::collections::HashMap;

use super::{ExecutionConfig, ExecutionStrategy, StrategyContext};
use crate::environment::EnvLayers;
use crate::error::EngineError;
use crate::model::{ContainerConfig, Task, Workflow};
use crate::shell;

const DEFAULT_RUNTIME: &str = "docker";
const DEFAULT_CONTAINER_SHELL: &str = "sh";

pub struct ContainerStrategy;

impl ContainerStrategy {
    fn effective(workflow: &Workflow, task: &Task) -> Option<ContainerConfig> {
        ContainerConfig::merged(workflow.container.as_ref(), task.container.as_ref())
            .filter(|c| !c.disabled)
    }
}

impl ExecutionStrategy for ContainerStrategy {
    fn name(&self) -> &str {
        "container"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_handle(&self, workflow: &Workflow, task: &Task) -> bool {
        Self::effective(workflow, task).is_some()
    }

    fn build_config(
        &self,
        command: &str,
        task: &Task,
        ctx: &StrategyContext<'_>,
    ) -> Result<ExecutionConfig, EngineError> {
        let cfg = Self::effective(ctx.workflow, task).ok_or_else(|| {
            EngineError::TaskExecution {
                task_id: task.id.clone(),
                exit_code: None,
                message: "container strategy selected without an effective container config"
                    .to_string(),
            }
        })?;
        let container = cfg.container.as_deref().unwrap_or_default();

        let mut args = vec!["exec".to_string()];
        if cfg.interactive {
            args.push("-i".to_string());
        }
        if cfg.tty {
            args.push("-t".to_string());
        }
        if cfg.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(user) = &cfg.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        if let Some(workdir) = &cfg.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        // Declared variables only, sorted for a deterministic argv.
        let declared = EnvLayers {
            workflow: &ctx.workflow.environment,
            additional: ctx.additional_env,
            task: &task.environment,
        }
        .resolve_isolated();
        let mut pairs: Vec<_> = declared.into_iter().collect();
        pairs.sort();
        for (k, v) in pairs {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }

        args.push(container.to_string());

        let shell_name = task
            .shell
            .as_deref()
            .or(cfg.shell.as_deref())
            .unwrap_or(DEFAULT_CONTAINER_SHELL);
        let invocation = shell::build_invocation(shell_name, command)?;
        args.push(invocation.executable);
        args.extend(invocation.args);

        let mut env = HashMap::new();
        if let Some(host) = &cfg.host {
            env.insert("CONTAINER_HOST".to_string(), host.clone());
        }

        Ok(ExecutionConfig {
            program: cfg.runtime.clone().unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
            args,
            working_dir: None,
            env,
        })
    }
}
