//! Launcher contract and its reference implementations.
//!
//! A launcher owns the submit/query/cancel lifecycle against one
//! backend. Submissions are idempotent per `(run_id, step_name, submit)`
//! via the durable store; handles are stable across process restarts
//! within the same run id, which is what makes resume work.

pub mod local;
pub mod managed;
pub mod slurm;

use async_trait::async_trait;
use thiserror::Error;

use cstar_core::env::EnvError;
use cstar_core::serialization::SerializationError;
use cstar_core::{LauncherKind, Status, Step};

use crate::convert::ConvertError;
use crate::store::StoreError;
use crate::task::{Handle, Task};

#[derive(Debug, Error)]
pub enum LaunchError {
    /// The backend rejected a submission. The node becomes `Failed`.
    #[error("submission rejected for step `{step}`: {reason}")]
    Submit { step: String, reason: String },
    /// A transient failure observing status; retried next cycle.
    #[error("status query failed for `{pid}`: {reason}")]
    Query { pid: String, reason: String },
    #[error("handle kind mismatch: expected a {expected} handle")]
    WrongHandle { expected: &'static str },
    #[error(transparent)]
    Config(#[from] EnvError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract required to drive tasks on a compute backend.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// The launcher class, used for converter lookup and env gating.
    fn kind(&self) -> LauncherKind;

    /// Submit a step, given the handles of its already-submitted
    /// dependencies. Returns a `Submitted` task with a backend handle.
    ///
    /// A cached hit for `(run_id, step_name, submit)` returns the prior
    /// handle without re-submitting.
    async fn launch(&self, step: &Step, dependencies: &[Handle]) -> Result<Task, LaunchError>;

    /// Map the backend's current state for a handle into the canonical
    /// status lattice. Safe to call at any rate.
    async fn query_status(&self, step: &Step, handle: &Handle) -> Result<Status, LaunchError>;

    /// Best-effort termination. On success the returned task carries
    /// `Cancelled`; on failure the attempt is logged and the task is
    /// returned unchanged. Never errors.
    async fn cancel(&self, task: Task) -> Task;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_messages_name_the_step() {
        let err = LaunchError::Submit {
            step: "a".to_string(),
            reason: "queue unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "submission rejected for step `a`: queue unavailable"
        );
    }
}
