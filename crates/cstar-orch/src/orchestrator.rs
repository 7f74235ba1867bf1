//! The orchestrator: drives a planned DAG through a launcher.
//!
//! One `run(mode)` call advances the DAG by one cycle. Within a cycle
//! all open nodes are processed concurrently (submit or status query),
//! results are applied to the planner as a group, and an observed
//! failure triggers a cancel fan-out over the cycle's running tasks.
//! In `Schedule` mode a cycle keeps expanding the open set as
//! submissions land, so an entire DAG can be handed to the backend in a
//! single cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use cstar_core::{RunMode, Status, Step};

use crate::launch::Launcher;
use crate::planner::Planner;
use crate::task::{Handle, Task};

#[derive(Debug, Error)]
pub enum OrchestrateError {
    /// An invariant breach: a node was asked to process without a step
    /// record. Fatal for the run.
    #[error("unable to process: invalid node identifier `{0}`")]
    ExpectationFailed(String),
}

/// What processing a node produced this wave.
enum NodeOutcome {
    /// Not all prerequisites are submitted yet; re-evaluate next cycle.
    Deferred,
    /// The node's task was created or re-observed.
    Observed(Task),
    /// The backend rejected the submission.
    SubmitFailed(String),
}

/// Manages the execution of a planned workplan.
pub struct Orchestrator {
    planner: Planner,
    launcher: Arc<dyn Launcher>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(planner: Planner, launcher: Arc<dyn Launcher>) -> Self {
        Self { planner, launcher }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Current status of every node.
    pub fn statuses(&self) -> BTreeMap<String, Status> {
        self.planner.statuses()
    }

    /// The open set under `mode`; `None` means no further progress is
    /// possible.
    pub fn open_set(&self, mode: RunMode) -> Option<BTreeSet<String>> {
        self.planner.open_set(mode)
    }

    /// Resolve the task handles of a step's dependencies.
    ///
    /// `None` means at least one prerequisite has not been submitted
    /// yet; an empty list means the step has no dependencies.
    fn locate_dependencies(&self, step: &Step) -> Option<Vec<Handle>> {
        let mut handles = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            handles.push(self.planner.task(dep)?.handle.clone());
        }
        Some(handles)
    }

    /// Write a status to a node, keeping the per-node status sequence
    /// monotone: terminal statuses are sticky, and a node never moves to
    /// a lower status except into `Cancelled`.
    fn record_status(&mut self, name: &str, status: Status) {
        if let Some(current) = self.planner.status(name) {
            let regresses = status < current && status != Status::Cancelled;
            if (current.is_terminal() && current != status) || regresses {
                debug!(node = name, %current, observed = %status,
                       "ignoring status regression");
                return;
            }
        }
        self.planner.set_status(name, status);
    }

    /// Submit or re-observe a single node.
    async fn process_node(
        &self,
        name: &str,
        step: Step,
        task: Option<Task>,
        dependencies: Option<Vec<Handle>>,
    ) -> NodeOutcome {
        let Some(dependencies) = dependencies else {
            return NodeOutcome::Deferred;
        };

        if let Some(mut task) = task {
            match self.launcher.query_status(&step, &task.handle).await {
                Ok(status) => {
                    if task.status != status {
                        debug!(node = name, from = %task.status, to = %status, "task status changed");
                    }
                    task.status = status;
                }
                Err(err) => {
                    // Transient; the node keeps its prior status and is
                    // re-queried next cycle.
                    debug!(node = name, %err, "status query failed");
                }
            }
            return NodeOutcome::Observed(task);
        }

        match self.launcher.launch(&step, &dependencies).await {
            Ok(task) => {
                info!(node = name, pid = task.handle.pid(), "launched step");
                NodeOutcome::Observed(task)
            }
            Err(err) => NodeOutcome::SubmitFailed(err.to_string()),
        }
    }

    /// Execute tasks that are ready and query status on running tasks.
    ///
    /// Returns the status of every node acted on this cycle. When the
    /// open set is null (failure observed or traversal complete) the
    /// current status of every node is returned instead and nothing is
    /// launched.
    pub async fn run(&mut self, mode: RunMode) -> Result<BTreeMap<String, Status>, OrchestrateError> {
        let mut acted: BTreeMap<String, Status> = BTreeMap::new();
        let mut processed: BTreeSet<String> = BTreeSet::new();
        let mut observed_tasks: Vec<Task> = Vec::new();

        loop {
            let Some(open) = self.planner.open_set(mode) else {
                if acted.is_empty() {
                    return Ok(self.planner.statuses());
                }
                break;
            };

            let wave: Vec<String> = open
                .into_iter()
                .filter(|name| !processed.contains(name))
                .collect();
            if wave.is_empty() {
                break;
            }
            processed.extend(wave.iter().cloned());

            // Gather node inputs before fanning out; the planner is not
            // touched while the wave is in flight.
            let mut inputs = Vec::with_capacity(wave.len());
            for name in &wave {
                let step = self
                    .planner
                    .step(name)
                    .cloned()
                    .ok_or_else(|| OrchestrateError::ExpectationFailed(name.clone()))?;
                let task = self.planner.task(name).cloned();
                let dependencies = self.locate_dependencies(&step);
                inputs.push((name.clone(), step, task, dependencies));
            }

            let this = &*self;
            let outcomes = join_all(inputs.into_iter().map(|(name, step, task, deps)| {
                async move {
                    let outcome = this.process_node(&name, step, task, deps).await;
                    (name, outcome)
                }
            }))
            .await;

            let mut failure_observed = false;
            for (name, outcome) in outcomes {
                match outcome {
                    NodeOutcome::Deferred => {
                        acted.insert(
                            name.clone(),
                            self.planner.status(&name).unwrap_or(Status::Unsubmitted),
                        );
                    }
                    NodeOutcome::Observed(task) => {
                        let status = task.status;
                        self.record_status(&name, status);
                        self.planner.set_task(&name, task.clone());
                        observed_tasks.push(task);
                        let recorded = self.planner.status(&name).unwrap_or(status);
                        acted.insert(name.clone(), recorded);
                        if status == Status::Failed {
                            warn!(node = %name, "failed node");
                            failure_observed = true;
                        } else if status == Status::Done {
                            info!(node = %name, "closed node");
                        }
                    }
                    NodeOutcome::SubmitFailed(reason) => {
                        warn!(node = %name, %reason, "failed node");
                        self.record_status(&name, Status::Failed);
                        acted.insert(name.clone(), Status::Failed);
                        failure_observed = true;
                    }
                }
            }

            if failure_observed {
                let cancelled = self.cancel_running(&observed_tasks).await;
                for (name, status) in cancelled {
                    acted.insert(name, status);
                }
                break;
            }

            // Monitor mode runs one wave per cycle; Schedule mode keeps
            // expanding as submissions satisfy downstream in-edges.
            if mode == RunMode::Monitor {
                break;
            }
        }

        Ok(acted)
    }

    /// Fan out cancellation over this cycle's running tasks.
    async fn cancel_running(&mut self, observed: &[Task]) -> Vec<(String, Status)> {
        let cancellations: Vec<Task> = observed
            .iter()
            .filter(|t| t.status.is_running())
            .cloned()
            .collect();

        let launcher = Arc::clone(&self.launcher);
        let results = join_all(
            cancellations
                .into_iter()
                .map(|task| {
                    let launcher = Arc::clone(&launcher);
                    async move { launcher.cancel(task).await }
                }),
        )
        .await;

        let mut out = Vec::with_capacity(results.len());
        for task in results {
            let name = task.name().to_string();
            let status = task.status;
            self.record_status(&name, status);
            self.planner.set_task(&name, task);
            out.push((name, status));
        }
        out
    }
}
