//! SSH strategy.
//!
//! Builds `ssh [-o opt]… [-i identity] [-p port] [user@]host "<env> <shell>
//! -c '<cmd>'"`. Declared variables are prefixed onto the remote command as
//! assignments; the local host environment is never forwarded.

use std::collections::HashMap;

use super::{ExecutionConfig, ExecutionStrategy, StrategyContext};
use crate::environment::EnvLayers;
use crate::error::EngineError;
use crate::model::{SshConfig, Task, Workflow};
use crate::shell;

const DEFAULT_REMOTE_SHELL: &str = "sh";

pub struct SshStrategy;

impl SshStrategy {
    fn effective(workflow: &Workflow, task: &Task) -> Option<SshConfig> {
        SshConfig::merged(workflow.ssh.as_ref(), task.ssh.as_ref()).filter(|c| !c.disabled)
    }
}

impl ExecutionStrategy for SshStrategy {
    fn name(&self) -> &str {
        "ssh"
    }

    fn priority(&self) -> u32 {
        10
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
                message: "ssh strategy selected without an effective ssh config".to_string(),
            }
        })?;
        let host = cfg.host.as_deref().unwrap_or_default();

        let mut args = Vec::new();
        for option in &cfg.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(identity) = &cfg.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().into_owned());
        }
        if let Some(port) = cfg.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        let target = match &cfg.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        args.push(target);

        // Declared variables only, as assignments on the remote command.
        let declared = EnvLayers {
            workflow: &ctx.workflow.environment,
            additional: ctx.additional_env,
            task: &task.environment,
        }
        .resolve_isolated();
        let mut pairs: Vec<_> = declared.into_iter().collect();
        pairs.sort();
        let assignments: Vec<String> = pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={}", shell::posix_quote(&v)))
            .collect();

        let remote_shell = cfg.remote_shell.as_deref().unwrap_or(DEFAULT_REMOTE_SHELL);
        let quoted = shell::posix_quote(command);
        let remote_command = if assignments.is_empty() {
            format!("{remote_shell} -c {quoted}")
        } else {
            format!("{} {remote_shell} -c {quoted}", assignments.join(" "))
        };
        args.push(remote_command);

        Ok(ExecutionConfig {
            program: "ssh".to_string(),
            args,
            working_dir: None,
            env: HashMap::new(),
        })
    }
}
