//! Dependency planner.
//!
//! Turns a workplan into a DAG over step names and answers the two
//! queries the orchestrator schedules by: the open set (nodes whose
//! in-edges are satisfied under the run mode) and the closed set (nodes
//! the mode treats as settled). The planner owns every node record; the
//! orchestrator mutates node status and task attributes through it.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;
use tracing::error;

use cstar_core::{RunMode, Status, Step, Workplan};

use crate::task::Task;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },
    #[error("workplan contains a dependency cycle through `{0}`")]
    Cycle(String),
}

/// Per-step node record. Created at planner construction, mutated only
/// by the orchestrator, destroyed with the planner.
#[derive(Debug, Clone)]
struct Node {
    name: String,
    status: Status,
    step: Step,
    task: Option<Task>,
}

/// DAG over the steps of a single workplan.
#[derive(Debug)]
pub struct Planner {
    workplan: Workplan,
    graph: DiGraph<Node, ()>,
    index: BTreeMap<String, NodeIndex>,
}

impl Planner {
    /// Build the execution graph for a workplan.
    ///
    /// Adds one node per step and one edge per dependency, then rejects
    /// unresolved names and cycles.
    pub fn new(workplan: Workplan) -> Result<Self, PlanError> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();

        for step in &workplan.steps {
            let idx = graph.add_node(Node {
                name: step.name.clone(),
                status: Status::Unsubmitted,
                step: step.clone(),
                task: None,
            });
            index.insert(step.name.clone(), idx);
        }

        for step in &workplan.steps {
            let target = index[&step.name];
            for dep in &step.depends_on {
                let source =
                    *index
                        .get(dep)
                        .ok_or_else(|| PlanError::UnknownDependency {
                            step: step.name.clone(),
                            dependency: dep.clone(),
                        })?;
                graph.add_edge(source, target, ());
            }
        }

        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            let name = graph[cycle.node_id()].name.clone();
            return Err(PlanError::Cycle(name));
        }

        Ok(Self {
            workplan,
            graph,
            index,
        })
    }

    pub fn workplan(&self) -> &Workplan {
        &self.workplan
    }

    /// All step names in the plan.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// The planned steps in a dependency-honoring execution order.
    pub fn flatten(&self) -> Vec<Step> {
        let sorted = petgraph::algo::toposort(&self.graph, None)
            .unwrap_or_else(|_| self.graph.node_indices().collect());
        sorted
            .into_iter()
            .map(|idx| self.graph[idx].step.clone())
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<Status> {
        self.index.get(name).map(|idx| self.graph[*idx].status)
    }

    pub fn set_status(&mut self, name: &str, status: Status) {
        if let Some(idx) = self.index.get(name) {
            self.graph[*idx].status = status;
        }
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.index.get(name).map(|idx| &self.graph[*idx].step)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.index
            .get(name)
            .and_then(|idx| self.graph[*idx].task.as_ref())
    }

    pub fn set_task(&mut self, name: &str, task: Task) {
        if let Some(idx) = self.index.get(name) {
            self.graph[*idx].task = Some(task);
        }
    }

    /// Current status of every node.
    pub fn statuses(&self) -> BTreeMap<String, Status> {
        self.graph
            .node_weights()
            .map(|n| (n.name.clone(), n.status))
            .collect()
    }

    /// Nodes the mode treats as settled.
    ///
    /// In `Monitor` mode only terminal nodes are closed. In `Schedule`
    /// mode submitted and running nodes count too: the backend enforces
    /// ordering natively, so the orchestrator need not wait on them.
    pub fn closed_set(&self, mode: RunMode) -> BTreeSet<String> {
        self.graph
            .node_weights()
            .filter(|n| {
                n.status.is_terminal()
                    || (mode == RunMode::Schedule
                        && matches!(n.status, Status::Submitted | Status::Running))
            })
            .map(|n| n.name.clone())
            .collect()
    }

    /// Nodes ready for some processing action this cycle.
    ///
    /// - `Some(set)`: nodes whose in-edges are all satisfied under the
    ///   mode's predicate (possibly empty while predecessors settle).
    /// - `None`: no further progress is possible, either because every
    ///   node is closed or because a closed node holds a failure status.
    pub fn open_set(&self, mode: RunMode) -> Option<BTreeSet<String>> {
        let closed = self.closed_set(mode);

        let failures: BTreeMap<&str, Status> = self
            .graph
            .node_weights()
            .filter(|n| closed.contains(&n.name) && n.status.is_failure())
            .map(|n| (n.name.as_str(), n.status))
            .collect();
        if !failures.is_empty() {
            error!(?failures, "exiting due to task failures");
            return None;
        }

        let working: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| !closed.contains(&self.graph[*idx].name))
            .collect();
        if working.is_empty() {
            return None;
        }

        let mut open = BTreeSet::new();
        for idx in working {
            let satisfied = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .all(|pred| {
                    let status = self.graph[pred].status;
                    match mode {
                        RunMode::Schedule => status.is_running() || status.is_terminal(),
                        RunMode::Monitor => status.is_terminal(),
                    }
                });
            if satisfied {
                open.insert(self.graph[idx].name.clone());
            }
        }

        Some(open)
    }

    /// Render the DAG as Graphviz DOT for inspection.
    pub fn to_dot(&self) -> String {
        let dot = Dot::with_attr_getters(
            &self.graph,
            &[Config::EdgeNoLabel, Config::NodeNoLabel],
            &|_, _| String::new(),
            &|_, (_, node)| format!("label = \"{} ({})\"", node.name, node.status.as_str()),
        );
        format!("{dot:?}")
    }
}
