//! Managed task-service launcher.
//!
//! Submits steps to a managed task API over HTTP. Configuration
//! (endpoint, account, queue, max walltime) is read from the environment
//! at submit time so a long-lived orchestrator picks up rotations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use cstar_core::env::{
    optional, require, ENV_MANAGED_ACCOUNT, ENV_MANAGED_ENDPOINT, ENV_MANAGED_MAX_WALLTIME,
    ENV_MANAGED_QUEUE,
};
use cstar_core::{LauncherKind, Status, Step};

use crate::convert::get_converter;
use crate::launch::{LaunchError, Launcher};
use crate::store::{Phase, StateStore};
use crate::task::{Handle, Task};

/// A launcher that executes steps through a managed task service.
#[derive(Debug)]
pub struct ManagedLauncher {
    run_id: String,
    store: Arc<StateStore>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStateResponse {
    state: String,
}

/// Map a managed-service task state into the canonical lattice.
///
/// `CRASHED` and `FAILED` both map to `Failed`; `PAUSED` counts as held,
/// which schedules like a running task.
fn convert_managed_state(raw: &str) -> Status {
    match raw.trim().to_ascii_uppercase().as_str() {
        "SCHEDULED" | "PENDING" | "RUNNING" | "HELD" | "ENDING" | "PAUSED" => Status::Running,
        "COMPLETED" => Status::Done,
        "CANCELLED" | "CANCELLING" => Status::Cancelled,
        "FAILED" | "CRASHED" => Status::Failed,
        _ => Status::Unsubmitted,
    }
}

impl ManagedLauncher {
    pub fn new(run_id: String, store: Arc<StateStore>) -> Self {
        Self {
            run_id,
            store,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint() -> Result<String, LaunchError> {
        Ok(require(ENV_MANAGED_ENDPOINT)?.trim_end_matches('/').to_string())
    }

    async fn submit(&self, step: &Step, dependencies: &[Handle]) -> Result<Handle, LaunchError> {
        let converter = get_converter(LauncherKind::Managed, &step.application)?;
        let command = converter(step);

        let endpoint = Self::endpoint()?;
        let account = require(ENV_MANAGED_ACCOUNT)?;
        let queue = require(ENV_MANAGED_QUEUE)?;
        let walltime = optional(ENV_MANAGED_MAX_WALLTIME);

        let dep_ids: Vec<&str> = dependencies.iter().map(Handle::pid).collect();
        let body = serde_json::json!({
            "name": step.safe_name(),
            "command": command,
            "account": account,
            "queue": queue,
            "max_walltime": walltime,
            "depends_on": dep_ids,
        });

        let short: String = command.replace('\n', "").chars().take(40).collect();
        debug!(step = %step.name, command = %short, "submitting managed task");

        let response = self
            .client
            .post(format!("{endpoint}/api/tasks"))
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| LaunchError::Submit {
                step: step.name.clone(),
                reason: e.to_string(),
            })?;

        let created: TaskResponse = response.json().await.map_err(|e| LaunchError::Submit {
            step: step.name.clone(),
            reason: format!("malformed submission response: {e}"),
        })?;

        debug!(step = %step.name, task_id = %created.id, "submission created task");
        Ok(Handle::Managed {
            task_id: created.id,
            job_name: Some(step.safe_name()),
        })
    }
}

#[async_trait]
impl Launcher for ManagedLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::Managed
    }

    async fn launch(&self, step: &Step, dependencies: &[Handle]) -> Result<Task, LaunchError> {
        if let Some(handle) = self
            .store
            .cached_submission(&self.run_id, &step.name, Phase::Submit)
            .await?
        {
            debug!(step = %step.name, task_id = handle.pid(), "cached submission hit");
            return Ok(Task::new(step.clone(), handle, Status::Submitted));
        }

        let handle = self.submit(step, dependencies).await?;
        let handle = self
            .store
            .record_submission(&self.run_id, &step.name, Phase::Submit, &handle)
            .await?;

        Ok(Task::new(step.clone(), handle, Status::Submitted))
    }

    async fn query_status(&self, step: &Step, handle: &Handle) -> Result<Status, LaunchError> {
        let task_id = match handle {
            Handle::Managed { task_id, .. } => task_id,
            _ => return Err(LaunchError::WrongHandle { expected: "managed" }),
        };

        let endpoint = Self::endpoint()?;
        let response = self
            .client
            .get(format!("{endpoint}/api/tasks/{task_id}"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| LaunchError::Query {
                pid: task_id.clone(),
                reason: e.to_string(),
            })?;

        let state: TaskStateResponse = response.json().await.map_err(|e| LaunchError::Query {
            pid: task_id.clone(),
            reason: format!("malformed status response: {e}"),
        })?;

        let status = convert_managed_state(&state.state);
        debug!(step = %step.name, %task_id, raw = %state.state, %status, "managed task status");
        Ok(status)
    }

    async fn cancel(&self, mut task: Task) -> Task {
        let task_id = match &task.handle {
            Handle::Managed { task_id, .. } => task_id.clone(),
            _ => return task,
        };

        let endpoint = match Self::endpoint() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(%task_id, %err, "unable to cancel the task");
                return task;
            }
        };

        let result = self
            .client
            .post(format!("{endpoint}/api/tasks/{task_id}/cancel"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => {
                debug!(%task_id, "task cancelled");
                task.status = Status::Cancelled;
            }
            Err(err) => {
                warn!(%task_id, %err, "unable to cancel the task");
            }
        }

        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_follows_the_corrected_table() {
        assert_eq!(convert_managed_state("SCHEDULED"), Status::Running);
        assert_eq!(convert_managed_state("PENDING"), Status::Running);
        assert_eq!(convert_managed_state("RUNNING"), Status::Running);
        assert_eq!(convert_managed_state("PAUSED"), Status::Running);
        assert_eq!(convert_managed_state("COMPLETED"), Status::Done);
        assert_eq!(convert_managed_state("CANCELLED"), Status::Cancelled);
        assert_eq!(convert_managed_state("CANCELLING"), Status::Cancelled);
        assert_eq!(convert_managed_state("FAILED"), Status::Failed);
        assert_eq!(convert_managed_state("CRASHED"), Status::Failed);
        assert_eq!(convert_managed_state("UNKNOWN"), Status::Unsubmitted);
    }

    #[test]
    fn state_mapping_is_case_insensitive() {
        assert_eq!(convert_managed_state("completed"), Status::Done);
        assert_eq!(convert_managed_state(" running "), Status::Running);
    }
}
