//! cstar - workplan orchestration CLI.
//!
//! Validates workplans and blueprints, renders execution plans, and
//! drives workplan runs on local, batch-scheduler, or managed backends.

mod commands;
mod render;
mod template;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use cstar_core::{LauncherKind, RunMode};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Orchestrate scientific-simulation workplans.
#[derive(Parser)]
#[command(name = "cstar")]
#[command(about = "Plan and execute simulation workplans")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Workplan operations
    #[command(subcommand)]
    Workplan(WorkplanCommand),

    /// Blueprint operations
    #[command(subcommand)]
    Blueprint(BlueprintCommand),

    /// Starter-document generation
    #[command(subcommand)]
    Template(TemplateCommand),
}

#[derive(Subcommand)]
enum WorkplanCommand {
    /// Validate a workplan document
    Check {
        /// Path to a workplan file
        path: PathBuf,
    },

    /// Execute a workplan
    ///
    /// Pass a previously used run id to re-attach to a prior run.
    Run {
        /// Path to a workplan file
        path: PathBuf,

        /// Override the output directory from the environment
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Unique identifier for this execution
        #[arg(long)]
        run_id: Option<String>,

        /// Launcher backend: local, slurm, or managed
        #[arg(long, default_value = "local", value_parser = parse_launcher)]
        launcher: LauncherKind,

        /// Run mode: monitor or schedule
        #[arg(long, default_value = "monitor", value_parser = parse_mode)]
        mode: RunMode,
    },

    /// Report the status of a run
    Status {
        /// Path to a workplan file
        path: PathBuf,

        /// Unique identifier of a specific execution
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Render the execution DAG to Graphviz DOT
    Plan {
        /// Path to a workplan file
        path: PathBuf,

        /// Output file (defaults next to the workplan)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum BlueprintCommand {
    /// Validate a blueprint document
    Check {
        /// Path to a blueprint file
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Write a starter document and its JSON schema
    Generate {
        /// Document kind: workplan or blueprint
        #[arg(long = "template-type", default_value = "workplan", value_parser = template::parse_kind)]
        template_type: template::TemplateKind,

        /// Output path (defaults to ./<kind>.yaml)
        out: Option<PathBuf>,
    },
}

fn parse_launcher(s: &str) -> Result<LauncherKind, String> {
    match s.to_lowercase().as_str() {
        "local" => Ok(LauncherKind::Local),
        "slurm" => Ok(LauncherKind::Slurm),
        "managed" => Ok(LauncherKind::Managed),
        _ => Err(format!(
            "invalid launcher '{s}', expected: local, slurm, managed"
        )),
    }
}

fn parse_mode(s: &str) -> Result<RunMode, String> {
    match s.to_lowercase().as_str() {
        "monitor" => Ok(RunMode::Monitor),
        "schedule" => Ok(RunMode::Schedule),
        _ => Err(format!("invalid mode '{s}', expected: monitor, schedule")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Workplan(WorkplanCommand::Check { path }) => commands::workplan_check(&path),
        Command::Workplan(WorkplanCommand::Run {
            path,
            output_dir,
            run_id,
            launcher,
            mode,
        }) => commands::workplan_run(&path, output_dir, run_id, launcher, mode).await,
        Command::Workplan(WorkplanCommand::Status { path, run_id }) => {
            commands::workplan_status(&path, run_id).await
        }
        Command::Workplan(WorkplanCommand::Plan { path, out }) => {
            commands::workplan_plan(&path, out)
        }
        Command::Blueprint(BlueprintCommand::Check { path }) => commands::blueprint_check(&path),
        Command::Template(TemplateCommand::Generate { template_type, out }) => {
            template::generate(template_type, out)
        }
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
