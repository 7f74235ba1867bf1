//! Core enumerations shared across the orchestrator.
//!
//! The status lattice and its predicate sets drive every scheduling
//! decision; the variant order is the severity order and must not change.

use serde::{Deserialize, Serialize};

/// Application name handled by the simulation worker converter.
pub const APP_ROMS_MARBL: &str = "roms_marbl";

/// Application name for the placeholder sleep converter.
pub const APP_SLEEP: &str = "sleep";

/// The state of a launched task.
///
/// Variants are ordered: a status never moves to a lower variant except
/// for the transition of any non-terminal status to `Cancelled`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No submission has been attempted.
    Unsubmitted,
    /// Handed to a launcher; no status observed yet.
    Submitted,
    /// The backend reports the task as active.
    Running,
    /// The backend reports the task as nearing completion.
    Ending,
    /// The task terminated without error.
    Done,
    /// The task terminated due to cancellation.
    Cancelled,
    /// The task terminated due to a failure.
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsubmitted => "unsubmitted",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Ending => "ending",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Parse the `as_str` form back into a status.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unsubmitted" => Some(Self::Unsubmitted),
            "submitted" => Some(Self::Submitted),
            "running" => Some(Self::Running),
            "ending" => Some(Self::Ending),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for statuses that end a task's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    /// True for terminal statuses that indicate the task did not succeed.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed)
    }

    /// True for statuses of a task that is in flight.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Submitted | Self::Running | Self::Ending)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blocking behavior during plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// An in-edge is satisfied only once the predecessor is terminal.
    #[default]
    Monitor,
    /// An in-edge is satisfied once the predecessor is submitted; ordering
    /// is delegated to the backend's native dependency support.
    Schedule,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Schedule => "schedule",
        }
    }
}

/// Validation state of a workplan document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkplanState {
    #[default]
    Draft,
    Validated,
}

impl WorkplanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Validated => "validated",
        }
    }
}

/// The class of launcher driving a run.
///
/// Used as the first key of the command-converter registry and to select
/// the required environment variables before a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    #[default]
    Local,
    Slurm,
    Managed,
}

impl LauncherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Slurm => "slurm",
            Self::Managed => "managed",
        }
    }
}
