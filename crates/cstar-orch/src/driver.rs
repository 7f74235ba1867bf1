//! Run preparation and the drive loop.
//!
//! `prepare_workplan` turns a user workplan into the per-run host plan:
//! the blueprint is copied into the run directory, transforms rewrite
//! the step list, and the result is emitted as
//! `<state_home>/<run_id>/<name>-host.yaml`. `Driver::drive` then
//! repeats orchestrator cycles until the open set is null, persisting
//! each cycle's observations so a later invocation with the same run id
//! can report or resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cstar_core::env::{self, EnvError};
use cstar_core::serialization::{store, PersistenceMode, SerializationError};
use cstar_core::workplan::ModelError;
use cstar_core::{RunLayout, RunMode, Status, Workplan};

use crate::orchestrator::{OrchestrateError, Orchestrator};
use crate::retrieval::{select_retriever, RetrievalError, Retriever, Source};
use crate::store::{StateStore, StoreError};
use crate::transforms::{TransformError, WorkplanTransformer};

#[derive(Debug, Error)]
pub enum DriveError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Orchestrate(#[from] OrchestrateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Final per-step statuses of a drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub statuses: BTreeMap<String, Status>,
}

impl RunReport {
    /// Steps that reached `Done`.
    pub fn complete(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s == Status::Done)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Steps in any other state.
    pub fn incomplete(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, s)| **s != Status::Done)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// True when every step completed successfully.
    pub fn succeeded(&self) -> bool {
        self.incomplete().is_empty()
    }
}

/// Prepare a workplan for execution under a run layout.
///
/// Validates the document, pins relative blueprint paths, copies the
/// source blueprint into the run directory, applies the transformation
/// pipeline, and emits the host workplan. Returns the transformed plan
/// and the path it was emitted to.
pub async fn prepare_workplan(
    path: &Path,
    layout: &RunLayout,
) -> Result<(Workplan, PathBuf), DriveError> {
    let mut workplan: Workplan = cstar_core::load(path, PersistenceMode::Auto)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    workplan.validate(base_dir)?;

    for step in &mut workplan.steps {
        if step.blueprint.is_relative() {
            step.blueprint = base_dir.join(&step.blueprint);
        }
    }

    std::fs::create_dir_all(layout.root())?;
    if let Some(first) = workplan.steps.first() {
        let source = Source::new(first.blueprint.to_string_lossy());
        select_retriever(&source)
            .retrieve(&layout.blueprint_copy(), &source)
            .await?;
    }

    let transformed = WorkplanTransformer::standard().apply(&workplan)?;
    let host_path = layout.host_workplan(&workplan.name);
    store(&host_path, &transformed, PersistenceMode::Yaml)?;

    info!(workplan = %workplan.name, host = %host_path.display(),
          steps = transformed.steps.len(), "prepared workplan");
    Ok((transformed, host_path))
}

/// Repeats orchestrator cycles to completion.
#[derive(Debug)]
pub struct Driver {
    orchestrator: Orchestrator,
    store: Arc<StateStore>,
    run_id: String,
    poll: Duration,
    token: CancellationToken,
}

impl Driver {
    pub fn new(orchestrator: Orchestrator, store: Arc<StateStore>, run_id: String) -> Self {
        Self {
            orchestrator,
            store,
            run_id,
            poll: env::DEFAULT_POLL_INTERVAL,
            token: CancellationToken::new(),
        }
    }

    /// Override the delay between cycles.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Use an externally owned cancellation token; cancelling it stops
    /// the loop before the next cycle.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Drive the DAG until no further progress is possible.
    ///
    /// A `Schedule` drive hands the whole DAG to the backend first and
    /// then watches it to completion in `Monitor` mode.
    pub async fn drive(&mut self, mode: RunMode) -> Result<RunReport, DriveError> {
        self.drive_mode(mode).await?;

        if mode == RunMode::Schedule && !self.token.is_cancelled() {
            debug!("schedule submission complete; monitoring to completion");
            self.drive_mode(RunMode::Monitor).await?;
        }

        let statuses = self.orchestrator.statuses();
        for (name, status) in &statuses {
            self.store
                .record_observation(&self.run_id, name, *status)
                .await?;
        }

        Ok(RunReport { statuses })
    }

    async fn drive_mode(&mut self, mode: RunMode) -> Result<(), DriveError> {
        loop {
            if self.token.is_cancelled() {
                info!(run_id = %self.run_id, "drive cancelled");
                return Ok(());
            }

            let acted = self.orchestrator.run(mode).await?;
            for (name, status) in &acted {
                self.store
                    .record_observation(&self.run_id, name, *status)
                    .await?;
            }

            if self.orchestrator.open_set(mode).is_none() {
                return Ok(());
            }

            tokio::select! {
                () = self.token.cancelled() => {}
                () = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

/// The two sets a status query reports: steps still underway (or never
/// started) and steps that completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusSummary {
    pub incomplete: Vec<String>,
    pub complete: Vec<String>,
}

/// Load the persisted status sets for a run of a workplan.
pub async fn load_run_status(
    store: &StateStore,
    run_id: &str,
    workplan: &Workplan,
) -> Result<RunStatusSummary, DriveError> {
    let observed = store.observations(run_id).await?;

    let mut incomplete = Vec::new();
    let mut complete = Vec::new();
    for step in &workplan.steps {
        match observed.get(&step.name) {
            Some(Status::Done) => complete.push(step.name.clone()),
            _ => incomplete.push(step.name.clone()),
        }
    }

    // Transformed runs may track derived steps absent from the user's
    // plan; report them too.
    for (name, status) in &observed {
        if workplan.step(name).is_none() {
            match status {
                Status::Done => complete.push(name.clone()),
                _ => incomplete.push(name.clone()),
            }
        }
    }

    Ok(RunStatusSummary {
        incomplete,
        complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use cstar_core::{LauncherKind, Step};

    use crate::launch::{LaunchError, Launcher};
    use crate::planner::Planner;
    use crate::task::{Handle, Task};

    /// Completes every step on its first status query.
    #[derive(Debug, Default)]
    struct InstantLauncher;

    #[async_trait]
    impl Launcher for InstantLauncher {
        fn kind(&self) -> LauncherKind {
            LauncherKind::Local
        }

        async fn launch(&self, step: &Step, _deps: &[Handle]) -> Result<Task, LaunchError> {
            Ok(Task::new(
                step.clone(),
                Handle::Managed {
                    task_id: step.name.clone(),
                    job_name: None,
                },
                Status::Submitted,
            ))
        }

        async fn query_status(&self, _step: &Step, _handle: &Handle) -> Result<Status, LaunchError> {
            Ok(Status::Done)
        }

        async fn cancel(&self, mut task: Task) -> Task {
            task.status = Status::Cancelled;
            task
        }
    }

    fn step(name: &str, deps: &[&str], blueprint: &Path) -> Step {
        Step {
            name: name.to_string(),
            application: "sleep".to_string(),
            blueprint: blueprint.to_path_buf(),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            blueprint_overrides: serde_yaml::Mapping::new(),
            compute_overrides: Default::default(),
            workflow_overrides: Default::default(),
            parent: None,
        }
    }

    fn workplan(steps: Vec<Step>) -> Workplan {
        Workplan {
            name: "drive-test".to_string(),
            description: "driver tests".to_string(),
            steps,
            state: Default::default(),
            compute_environment: Default::default(),
            runtime_vars: Default::default(),
        }
    }

    async fn test_store(dir: &TempDir) -> Arc<StateStore> {
        Arc::new(
            StateStore::open(&dir.path().join("state.db"))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn drives_a_chain_to_completion() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let bp = PathBuf::from("blueprint.yaml");

        let planner = Planner::new(workplan(vec![
            step("a", &[], &bp),
            step("b", &["a"], &bp),
        ]))
        .unwrap();

        let orchestrator = Orchestrator::new(planner, Arc::new(InstantLauncher));
        let mut driver = Driver::new(orchestrator, Arc::clone(&store), "run-1".to_string())
            .with_poll_interval(Duration::from_millis(1));

        let report = driver.drive(RunMode::Monitor).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.complete(), vec!["a", "b"]);
        assert!(report.incomplete().is_empty());

        let observed = store.observations("run-1").await.unwrap();
        assert_eq!(observed["a"], Status::Done);
        assert_eq!(observed["b"], Status::Done);
    }

    #[tokio::test]
    async fn schedule_drive_monitors_to_completion() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let bp = PathBuf::from("blueprint.yaml");

        let planner = Planner::new(workplan(vec![
            step("a", &[], &bp),
            step("b", &["a"], &bp),
            step("c", &["b"], &bp),
        ]))
        .unwrap();

        let orchestrator = Orchestrator::new(planner, Arc::new(InstantLauncher));
        let mut driver = Driver::new(orchestrator, store, "run-2".to_string())
            .with_poll_interval(Duration::from_millis(1));

        let report = driver.drive(RunMode::Schedule).await.unwrap();
        assert!(report.succeeded(), "{:?}", report.statuses);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let bp = PathBuf::from("blueprint.yaml");

        let planner = Planner::new(workplan(vec![step("a", &[], &bp)])).unwrap();
        let orchestrator = Orchestrator::new(planner, Arc::new(InstantLauncher));

        let token = CancellationToken::new();
        token.cancel();

        let mut driver = Driver::new(orchestrator, store, "run-3".to_string())
            .with_cancellation(token)
            .with_poll_interval(Duration::from_millis(1));

        let report = driver.drive(RunMode::Monitor).await.unwrap();
        assert_eq!(report.statuses["a"], Status::Unsubmitted);
    }

    #[tokio::test]
    async fn prepare_emits_host_plan_and_blueprint_copy() {
        let dir = TempDir::new().unwrap();

        let bp_path = dir.path().join("blueprint.yaml");
        std::fs::write(
            &bp_path,
            "name: bp\napplication: sleep\nruntime_params:\n  start_date: '2012-01-01 00:00:00'\n  end_date: '2012-02-01 00:00:00'\n  output_dir: .\n  initial_conditions:\n    location: /data/ic.nc\n",
        )
        .unwrap();

        let wp_path = dir.path().join("plan.yaml");
        let wp = workplan(vec![step("a", &[], Path::new("blueprint.yaml"))]);
        store(&wp_path, &wp, PersistenceMode::Yaml).unwrap();

        let layout = RunLayout::new(dir.path(), "prep-run");
        let (prepared, host_path) = prepare_workplan(&wp_path, &layout).await.unwrap();

        assert_eq!(prepared.steps.len(), 1);
        assert!(host_path.ends_with("prep-run/drive-test-host.yaml"));
        assert!(host_path.exists());
        assert!(layout.blueprint_copy().exists());
        assert!(prepared.steps[0].blueprint.is_absolute());
    }

    #[tokio::test]
    async fn status_summary_splits_the_two_sets() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;
        let bp = PathBuf::from("blueprint.yaml");

        store
            .record_observation("run-4", "a", Status::Done)
            .await
            .unwrap();
        store
            .record_observation("run-4", "b", Status::Running)
            .await
            .unwrap();

        let wp = workplan(vec![
            step("a", &[], &bp),
            step("b", &["a"], &bp),
            step("c", &["b"], &bp),
        ]);

        let summary = load_run_status(&store, "run-4", &wp).await.unwrap();
        assert_eq!(summary.complete, vec!["a"]);
        assert_eq!(summary.incomplete, vec!["b", "c"]);
    }
}
