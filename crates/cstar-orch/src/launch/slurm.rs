//! Batch-scheduler launcher.
//!
//! Steps are submitted as batch allocations through `sbatch`; dependency
//! ordering is declared to the scheduler with `--dependency=afterok:`,
//! so in Schedule mode the whole DAG can be handed over in one cycle.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use cstar_core::env::{optional, require, ENV_SLURM_ACCOUNT, ENV_SLURM_MAX_WALLTIME, ENV_SLURM_QUEUE};
use cstar_core::serialization::{load, PersistenceMode};
use cstar_core::{Blueprint, LauncherKind, RunLayout, Status, Step};

use crate::convert::get_converter;
use crate::launch::{LaunchError, Launcher};
use crate::store::{Phase, StateStore};
use crate::task::{Handle, Task};

/// A launcher that executes steps on a SLURM-enabled cluster.
#[derive(Debug)]
pub struct SlurmLauncher {
    run_id: String,
    layout: RunLayout,
    store: Arc<StateStore>,
}

/// Map a raw scheduler job state into the canonical lattice.
fn convert_slurm_state(raw: &str) -> Status {
    // `sacct` suffixes cancellations with the requesting user.
    let state = raw.trim().to_ascii_uppercase();
    if state.starts_with("CANCELLED") {
        return Status::Cancelled;
    }
    match state.as_str() {
        "PENDING" | "RUNNING" | "HELD" | "ENDING" => Status::Running,
        "COMPLETED" => Status::Done,
        "FAILED" => Status::Failed,
        _ => Status::Unsubmitted,
    }
}

/// Render the batch script submitted for a step.
fn build_batch_script(
    step: &Step,
    command: &str,
    account: &str,
    queue: &str,
    walltime: Option<&str>,
    cpus: u32,
    output_file: &Path,
) -> String {
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!("#SBATCH --job-name={}\n", step.safe_name()));
    script.push_str(&format!("#SBATCH --account={account}\n"));
    script.push_str(&format!("#SBATCH --partition={queue}\n"));
    script.push_str(&format!("#SBATCH --ntasks={cpus}\n"));
    script.push_str(&format!("#SBATCH --output={}\n", output_file.display()));
    if let Some(walltime) = walltime {
        script.push_str(&format!("#SBATCH --time={walltime}\n"));
    }
    script.push('\n');
    script.push_str(command);
    script.push('\n');
    script
}

impl SlurmLauncher {
    pub fn new(run_id: String, layout: RunLayout, store: Arc<StateStore>) -> Self {
        Self {
            run_id,
            layout,
            store,
        }
    }

    /// The account configured for scheduler jobs.
    fn configured_account() -> Result<String, LaunchError> {
        Ok(require(ENV_SLURM_ACCOUNT)?)
    }

    /// The queue configured for scheduler jobs.
    fn configured_queue() -> Result<String, LaunchError> {
        Ok(require(ENV_SLURM_QUEUE)?)
    }

    /// The optional max-walltime for scheduler jobs.
    fn configured_walltime() -> Option<String> {
        optional(ENV_SLURM_MAX_WALLTIME)
    }

    async fn submit(&self, step: &Step, dependencies: &[Handle]) -> Result<Handle, LaunchError> {
        let converter = get_converter(LauncherKind::Slurm, &step.application)?;
        let command = converter(step);

        let blueprint: Blueprint = load(&step.blueprint, PersistenceMode::Auto)?;
        let cpus = blueprint.cpus_needed.unwrap_or(1);

        self.layout.ensure_step_dirs(&step.name)?;
        let script_path = self.layout.step_script(&step.name);
        let output_file = self.layout.step_output(&step.name);

        let script = build_batch_script(
            step,
            &command,
            &Self::configured_account()?,
            &Self::configured_queue()?,
            Self::configured_walltime().as_deref(),
            cpus,
            &output_file,
        );
        std::fs::write(&script_path, script)?;

        let mut sbatch = Command::new("sbatch");
        sbatch.arg("--parsable");
        let dep_ids: Vec<&str> = dependencies.iter().map(Handle::pid).collect();
        if !dep_ids.is_empty() {
            sbatch.arg(format!("--dependency=afterok:{}", dep_ids.join(":")));
        }
        sbatch.arg(&script_path);

        let short: String = command.replace('\n', "").chars().take(40).collect();
        debug!(step = %step.name, command = %short, "submitting batch job");

        let output = sbatch.output().await.map_err(|e| LaunchError::Submit {
            step: step.name.clone(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(LaunchError::Submit {
                step: step.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // --parsable prints `jobid[;cluster]`.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout.trim().split(';').next().unwrap_or_default().to_string();
        if job_id.is_empty() {
            return Err(LaunchError::Submit {
                step: step.name.clone(),
                reason: "scheduler did not return a job id".to_string(),
            });
        }

        debug!(step = %step.name, %job_id, "submission created job");
        Ok(Handle::Slurm {
            job_id,
            job_name: Some(step.safe_name()),
        })
    }
}

#[async_trait]
impl Launcher for SlurmLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::Slurm
    }

    async fn launch(&self, step: &Step, dependencies: &[Handle]) -> Result<Task, LaunchError> {
        if let Some(handle) = self
            .store
            .cached_submission(&self.run_id, &step.name, Phase::Submit)
            .await?
        {
            debug!(step = %step.name, job_id = handle.pid(), "cached submission hit");
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
        let job_id = match handle {
            Handle::Slurm { job_id, .. } => job_id,
            _ => return Err(LaunchError::WrongHandle { expected: "slurm" }),
        };

        let output = Command::new("sacct")
            .args(["-j", job_id, "--format=State", "--noheader", "--parsable2", "-X"])
            .output()
            .await
            .map_err(|e| LaunchError::Query {
                pid: job_id.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(LaunchError::Query {
                pid: job_id.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw = stdout.lines().next().unwrap_or_default();
        let status = convert_slurm_state(raw);
        debug!(step = %step.name, %job_id, raw, %status, "scheduler job status");
        Ok(status)
    }

    async fn cancel(&self, mut task: Task) -> Task {
        let job_id = match &task.handle {
            Handle::Slurm { job_id, .. } => job_id.clone(),
            _ => return task,
        };

        match Command::new("scancel").arg(&job_id).output().await {
            Ok(output) if output.status.success() => {
                debug!(%job_id, "job cancelled");
                task.status = Status::Cancelled;
            }
            Ok(output) => {
                warn!(
                    %job_id,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "unable to cancel the task"
                );
            }
            Err(err) => {
                warn!(%job_id, %err, "unable to cancel the task");
            }
        }

        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            application: "sleep".to_string(),
            blueprint: PathBuf::from("blueprint.yaml"),
            depends_on: Default::default(),
            blueprint_overrides: serde_yaml::Mapping::new(),
            compute_overrides: Default::default(),
            workflow_overrides: Default::default(),
            parent: None,
        }
    }

    #[test]
    fn state_mapping_follows_the_table() {
        assert_eq!(convert_slurm_state("PENDING"), Status::Running);
        assert_eq!(convert_slurm_state("RUNNING"), Status::Running);
        assert_eq!(convert_slurm_state("HELD"), Status::Running);
        assert_eq!(convert_slurm_state("ENDING"), Status::Running);
        assert_eq!(convert_slurm_state("COMPLETED"), Status::Done);
        assert_eq!(convert_slurm_state("CANCELLED"), Status::Cancelled);
        assert_eq!(convert_slurm_state("CANCELLED by 1234"), Status::Cancelled);
        assert_eq!(convert_slurm_state("FAILED"), Status::Failed);
        assert_eq!(convert_slurm_state("BOOT_FAIL"), Status::Unsubmitted);
        assert_eq!(convert_slurm_state(""), Status::Unsubmitted);
    }

    #[test]
    fn batch_script_declares_job_metadata() {
        let script = build_batch_script(
            &step("Step A"),
            "cstar-worker --blueprint blueprint.yaml",
            "abc123",
            "wholenode",
            Some("00:10:00"),
            16,
            Path::new("/state/run/step-a/logs/step-a.out"),
        );

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=step-a\n"));
        assert!(script.contains("#SBATCH --account=abc123\n"));
        assert!(script.contains("#SBATCH --partition=wholenode\n"));
        assert!(script.contains("#SBATCH --ntasks=16\n"));
        assert!(script.contains("#SBATCH --time=00:10:00\n"));
        assert!(script.contains("#SBATCH --output=/state/run/step-a/logs/step-a.out\n"));
        assert!(script.ends_with("cstar-worker --blueprint blueprint.yaml\n"));
    }

    #[test]
    fn batch_script_omits_walltime_when_unset() {
        let script = build_batch_script(
            &step("a"),
            "true",
            "abc123",
            "wholenode",
            None,
            1,
            Path::new("/out"),
        );
        assert!(!script.contains("--time="));
    }
}
