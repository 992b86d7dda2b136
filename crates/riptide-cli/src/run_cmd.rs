//! `riptide run` command: execute a workflow file to completion.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use riptide_core::coordinator::{CoordinatorConfig, RunCoordinator, exit_code_for};
use riptide_core::events::EventBus;
use riptide_core::model::Workflow;

use crate::console::{ConsoleSubscriber, JsonLinesSubscriber};

/// Options collected from the command line.
pub struct RunOptions {
    pub max_parallel: Option<usize>,
    pub env: Vec<String>,
    pub always_on_cancel: bool,
    pub quiet: bool,
    pub json: bool,
}

/// Parse repeated `--env KEY=VALUE` flags.
pub fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --env value `{pair}` (expected KEY=VALUE)");
        };
        if key.is_empty() {
            bail!("invalid --env value `{pair}` (empty key)");
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Run a validated workflow and return the process exit code.
pub async fn run_workflow(workflow: Workflow, options: RunOptions) -> Result<i32> {
    let additional_env =
        parse_env_pairs(&options.env).context("failed to parse --env flags")?;

    let mut config = CoordinatorConfig {
        run_always_on_cancel: options.always_on_cancel,
        additional_env,
        ..CoordinatorConfig::default()
    };
    if let Some(max_parallel) = options.max_parallel {
        config.max_parallel = max_parallel.max(1);
    }

    tracing::info!(
        workflow = %workflow.name,
        tasks = workflow.tasks.len(),
        max_parallel = config.max_parallel,
        "executing workflow"
    );

    let mut bus = EventBus::new();
    if options.json {
        bus.subscribe(Arc::new(JsonLinesSubscriber));
    } else {
        bus.subscribe(Arc::new(ConsoleSubscriber::new(options.quiet)));
    }

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nCancelling run (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let coordinator = RunCoordinator::new(config, bus);
    let result = coordinator.execute(workflow, cancel).await;

    // The JSON stream stays machine-readable; the summary is console-only.
    if !options.json {
        println!();
        println!(
            "Run {} finished: {} in {} ms",
            result.run_id,
            result.status,
            result.duration.as_millis()
        );
        let mut ids: Vec<_> = result.tasks.keys().collect();
        ids.sort();
        for id in ids {
            if let Some(status) = result.task_status(id) {
                println!("  {id}: {status}");
            }
        }
    }

    Ok(exit_code_for(&result))
}
