//! Live-execution records: process handles and tasks.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cstar_core::{Status, Step};

/// Backend identity of a submitted task.
///
/// Handles are serialized into the durable submission store, so every
/// variant must round-trip through serde. The variant tag doubles as the
/// launcher class that produced the handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Handle {
    /// A detached local process.
    Local {
        pid: String,
        /// Process creation time as a posix timestamp (seconds).
        create_time: f64,
        /// File holding the wrapper's exit code once the command ends.
        status_file: PathBuf,
        /// File capturing stdout+stderr.
        output_file: PathBuf,
    },
    /// A batch-scheduler job.
    Slurm {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
    },
    /// A managed-service task.
    Managed {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_name: Option<String>,
    },
}

impl Handle {
    /// The backend-identifying id string (process id or job id).
    pub fn pid(&self) -> &str {
        match self {
            Self::Local { pid, .. } => pid,
            Self::Slurm { job_id, .. } => job_id,
            Self::Managed { task_id, .. } => task_id,
        }
    }
}

/// A launched step: the step record, its current status, and the handle
/// identifying the backing process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub status: Status,
    pub step: Step,
    pub handle: Handle,
}

impl Task {
    pub fn new(step: Step, handle: Handle, status: Status) -> Self {
        Self {
            status,
            step,
            handle,
        }
    }

    /// The owning step's name.
    pub fn name(&self) -> &str {
        &self.step.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_through_json() {
        let handle = Handle::Slurm {
            job_id: "123456".to_string(),
            job_name: Some("step-a".to_string()),
        };
        let encoded = serde_json::to_string(&handle).unwrap();
        let decoded: Handle = serde_json::from_str(&encoded).unwrap();
        assert_eq!(handle, decoded);
        assert!(encoded.contains("\"kind\":\"slurm\""));
    }

    #[test]
    fn local_handle_round_trips() {
        let handle = Handle::Local {
            pid: "4242".to_string(),
            create_time: 1_700_000_000.25,
            status_file: PathBuf::from("/state/run/a/logs/a.status"),
            output_file: PathBuf::from("/state/run/a/logs/a.out"),
        };
        let encoded = serde_json::to_string(&handle).unwrap();
        let decoded: Handle = serde_json::from_str(&encoded).unwrap();
        assert_eq!(handle, decoded);
    }

    #[test]
    fn pid_exposes_backend_id() {
        let handle = Handle::Managed {
            task_id: "f3b2".to_string(),
            job_name: None,
        };
        assert_eq!(handle.pid(), "f3b2");
    }
}
