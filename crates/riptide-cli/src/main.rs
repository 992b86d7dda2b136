mod console;
mod run_cmd;
mod workflow_file;

use clap::{Parser, Subcommand};

use riptide_core::model::Workflow;

/// Exit code for parse/validation failures.
const EXIT_VALIDATION: i32 = 64;

#[derive(Parser)]
#[command(name = "riptide", about = "Declarative workflow runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and execute a workflow file
    Run {
        /// Path to the workflow TOML file
        file: String,
        /// Maximum number of tasks running concurrently (default: CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Additional KEY=VALUE variables, visible to tasks and expressions
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Run always() cleanup tasks even after cancellation
        #[arg(long)]
        always_on_cancel: bool,
        /// Suppress per-line task output (events and summary still print)
        #[arg(long, short)]
        quiet: bool,
        /// Emit events as JSON lines instead of human-readable output
        #[arg(long)]
        json: bool,
    },
    /// Parse and validate a workflow file without executing it
    Validate {
        /// Path to the workflow TOML file
        file: String,
    },
    /// Print the wave schedule without executing
    Plan {
        /// Path to the workflow TOML file
        file: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("riptide=warn")),
        )
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run {
            file,
            max_parallel,
            env,
            always_on_cancel,
            quiet,
            json,
        } => match load_workflow(&file) {
            Ok(workflow) => {
                let options = run_cmd::RunOptions {
                    max_parallel,
                    env,
                    always_on_cancel,
                    quiet,
                    json,
                };
                match run_cmd::run_workflow(workflow, options).await {
                    Ok(code) => code,
                    Err(e) => {
                        eprintln!("{e:#}");
                        EXIT_VALIDATION
                    }
                }
            }
            Err(code) => code,
        },
        Commands::Validate { file } => match load_workflow(&file) {
            Ok(workflow) => {
                println!(
                    "{}: ok ({} task(s))",
                    workflow.name,
                    workflow.tasks.len()
                );
                0
            }
            Err(code) => code,
        },
        Commands::Plan { file } => match load_workflow(&file) {
            Ok(workflow) => cmd_plan(&workflow),
            Err(code) => code,
        },
    };

    std::process::exit(code);
}

/// Load and validate a workflow file, printing diagnostics on failure.
fn load_workflow(path: &str) -> Result<Workflow, i32> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("cannot read `{path}`: {e}");
            return Err(EXIT_VALIDATION);
        }
    };
    match workflow_file::parse_workflow_toml(&content) {
        Ok(workflow) => Ok(workflow),
        Err(e) => {
            eprintln!("`{path}` is not a valid workflow:");
            for diagnostic in e.diagnostics() {
                eprintln!("  {diagnostic}");
            }
            Err(EXIT_VALIDATION)
        }
    }
}

/// Print the wave schedule.
fn cmd_plan(workflow: &Workflow) -> i32 {
    match riptide_core::plan(workflow) {
        Ok(plan) => {
            println!("{}: {} wave(s)", workflow.name, plan.waves.len());
            for (index, wave) in plan.waves.iter().enumerate() {
                let tag = if wave.always { " [always]" } else { "" };
                println!("  wave {index}{tag}: {}", wave.tasks.join(", "));
            }
            0
        }
        Err(e) => {
            eprintln!("{e}");
            EXIT_VALIDATION
        }
    }
}
