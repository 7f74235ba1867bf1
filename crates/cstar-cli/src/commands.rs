//! Command implementations for the cstar CLI.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cstar_core::serialization::PersistenceMode;
use cstar_core::{env, load, Blueprint, LauncherKind, RunLayout, RunMode, Workplan};
use cstar_orch::{
    load_run_status, prepare_workplan, Driver, Launcher, LocalLauncher, ManagedLauncher,
    Orchestrator, Planner, SlurmLauncher, StateStore,
};

use crate::render;

/// Validate a workplan document.
pub fn workplan_check(path: &Path) -> eyre::Result<ExitCode> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    match load::<Workplan>(path, PersistenceMode::Auto)
        .map_err(eyre::Report::from)
        .and_then(|wp| wp.validate(base_dir).map_err(eyre::Report::from))
    {
        Ok(()) => {
            println!("The workplan is valid");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("The workplan is invalid: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Validate a blueprint document.
pub fn blueprint_check(path: &Path) -> eyre::Result<ExitCode> {
    match load::<Blueprint>(path, PersistenceMode::Auto) {
        Ok(_) => {
            println!("The blueprint is valid");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("The blueprint is invalid: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Resolve the run id: the flag wins, then the environment, then a
/// fresh time-ordered id.
fn resolve_run_id(run_id: Option<String>) -> String {
    run_id
        .or_else(|| env::optional(env::ENV_RUNID))
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
}

fn build_launcher(
    kind: LauncherKind,
    run_id: &str,
    layout: &RunLayout,
    store: &Arc<StateStore>,
) -> Arc<dyn Launcher> {
    match kind {
        LauncherKind::Local => Arc::new(LocalLauncher::new(
            run_id.to_string(),
            layout.clone(),
            Arc::clone(store),
        )),
        LauncherKind::Slurm => Arc::new(SlurmLauncher::new(
            run_id.to_string(),
            layout.clone(),
            Arc::clone(store),
        )),
        LauncherKind::Managed => {
            Arc::new(ManagedLauncher::new(run_id.to_string(), Arc::clone(store)))
        }
    }
}

/// Execute a workplan and report the outcome.
pub async fn workplan_run(
    path: &Path,
    output_dir: Option<PathBuf>,
    run_id: Option<String>,
    launcher_kind: LauncherKind,
    mode: RunMode,
) -> eyre::Result<ExitCode> {
    let run_id = resolve_run_id(run_id);
    env::configure_environment(output_dir.as_deref(), Some(&run_id));
    env::check_environment(launcher_kind).wrap_err("environment is not configured for this run")?;

    let layout = RunLayout::from_env()?;
    let run_id = env::run_id()?;
    info!(run_id = %run_id, root = %layout.root().display(), "starting workplan run");

    let (workplan, host_path) = prepare_workplan(path, &layout)
        .await
        .wrap_err("unable to prepare the workplan")?;
    info!(host = %host_path.display(), "emitted host workplan");

    for var in &workplan.runtime_vars {
        if env::optional(var).is_none() {
            eyre::bail!("unable to run workplan: runtime variable `{var}` is not set");
        }
    }

    let planner = Planner::new(workplan)?;
    let store = Arc::new(StateStore::open(&layout.state_db()).await?);
    let launcher = build_launcher(launcher_kind, &run_id, &layout, &store);

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping before the next cycle");
            signal_token.cancel();
        }
    });

    let mut driver = Driver::new(Orchestrator::new(planner, launcher), store, run_id.clone())
        .with_poll_interval(env::poll_interval()?)
        .with_cancellation(token);

    let report = driver.drive(mode).await?;
    render::print_run_report(&run_id, &report);

    if report.succeeded() {
        println!("Workplan run has completed.");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Workplan run has completed unsuccessfully.");
        Ok(ExitCode::FAILURE)
    }
}

/// Report the persisted status sets for a run.
pub async fn workplan_status(path: &Path, run_id: Option<String>) -> eyre::Result<ExitCode> {
    let run_id = resolve_run_id(run_id);
    let layout = RunLayout::new(&env::state_home(), &run_id);

    let workplan: Workplan = load(path, PersistenceMode::Auto)?;

    // Prefer the emitted host plan: a transformed run tracks derived
    // steps, not the user's originals.
    let host_path = layout.host_workplan(&workplan.name);
    let workplan = if host_path.exists() {
        load(&host_path, PersistenceMode::Auto)?
    } else {
        workplan
    };

    let store = StateStore::open(&layout.state_db()).await?;
    let summary = load_run_status(&store, &run_id, &workplan).await?;
    render::print_status_summary(&run_id, &summary);

    Ok(ExitCode::SUCCESS)
}

/// Render the execution DAG for inspection.
pub fn workplan_plan(path: &Path, out: Option<PathBuf>) -> eyre::Result<ExitCode> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let workplan: Workplan = load(path, PersistenceMode::Auto)?;
    workplan.validate(base_dir)?;

    let out_path = out.unwrap_or_else(|| {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workplan");
        path.with_file_name(format!("{stem}.dot"))
    });

    let planner = Planner::new(workplan)?;
    std::fs::write(&out_path, planner.to_dot())?;

    println!("Execution plan written to: {}", out_path.display());
    println!("Render it with: dot -Tpng {} -o plan.png", out_path.display());
    Ok(ExitCode::SUCCESS)
}
