//! Environment gate and per-run environment configuration.
//!
//! Every variable the orchestrator reads is named here. The gate runs
//! before any submission side effect: a missing variable fails the run
//! up front instead of mid-flight.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::slug::slugify;
use crate::types::LauncherKind;

/// Unique identifier for an execution of a workplan.
pub const ENV_RUNID: &str = "CSTAR_RUNID";

/// Root directory for per-run state.
pub const ENV_STATE_HOME: &str = "CSTAR_STATE_HOME";

/// Output directory override; doubles as the state root fallback.
pub const ENV_OUTDIR: &str = "CSTAR_OUTDIR";

/// Delay (in seconds) between orchestrator cycles.
pub const ENV_ORCH_DELAYS: &str = "CSTAR_ORCH_DELAYS";

/// Time span selector for the time-splitting transform.
pub const ENV_ORCH_TRX_FREQ: &str = "CSTAR_ORCH_TRX_FREQ";

/// Overridden key to apply when converting steps into commands.
pub const ENV_CMD_CONVERTER_OVERRIDE: &str = "CSTAR_CMD_CONVERTER_OVERRIDE";

/// Account used by the batch scheduler.
pub const ENV_SLURM_ACCOUNT: &str = "CSTAR_SLURM_ACCOUNT";

/// Queue (partition) used by the batch scheduler.
pub const ENV_SLURM_QUEUE: &str = "CSTAR_SLURM_QUEUE";

/// Maximum walltime allowed by the batch scheduler.
pub const ENV_SLURM_MAX_WALLTIME: &str = "CSTAR_SLURM_MAX_WALLTIME";

/// Account used by the managed task service.
pub const ENV_MANAGED_ACCOUNT: &str = "CSTAR_MANAGED_ACCOUNT";

/// Queue used by the managed task service.
pub const ENV_MANAGED_QUEUE: &str = "CSTAR_MANAGED_QUEUE";

/// Maximum walltime for managed tasks.
pub const ENV_MANAGED_MAX_WALLTIME: &str = "CSTAR_MANAGED_MAX_WALLTIME";

/// Base URL of the managed task service API.
pub const ENV_MANAGED_ENDPOINT: &str = "CSTAR_MANAGED_ENDPOINT";

/// Default delay between orchestrator cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("unable to run workplan: `{0}` not found in environment")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Read a required, non-empty environment variable.
pub fn require(key: &'static str) -> Result<String, EnvError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(EnvError::Missing(key)),
    }
}

/// Read an optional environment variable, treating empty as unset.
pub fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Verify the environment is configured for the selected launcher.
///
/// Fails with the first missing variable before any side effect.
pub fn check_environment(kind: LauncherKind) -> Result<(), EnvError> {
    let mut required: Vec<&'static str> = vec![ENV_RUNID];
    match kind {
        LauncherKind::Local => {}
        LauncherKind::Slurm => {
            required.extend([ENV_SLURM_ACCOUNT, ENV_SLURM_QUEUE]);
        }
        LauncherKind::Managed => {
            required.extend([ENV_MANAGED_ACCOUNT, ENV_MANAGED_QUEUE, ENV_MANAGED_ENDPOINT]);
        }
    }

    for key in required {
        require(key)?;
    }

    Ok(())
}

/// Configure the per-run environment.
///
/// Normalizes the output directory to an absolute path and slugifies the
/// run id before pinning both into the process environment.
pub fn configure_environment(output_dir: Option<&Path>, run_id: Option<&str>) {
    if let Some(dir) = output_dir {
        let absolute = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(dir))
                .unwrap_or_else(|_| dir.to_path_buf())
        };
        debug!(outdir = %absolute.display(), "pinning output directory");
        std::env::set_var(ENV_OUTDIR, absolute.as_os_str());
    }

    if let Some(id) = run_id {
        let slug = slugify(id);
        debug!(run_id = %slug, "pinning run id");
        std::env::set_var(ENV_RUNID, slug);
    }
}

/// The slugified run id for the current execution.
pub fn run_id() -> Result<String, EnvError> {
    require(ENV_RUNID)
}

/// Root directory under which per-run state is kept.
///
/// `CSTAR_STATE_HOME` wins, then `CSTAR_OUTDIR`, then the platform data
/// directory.
pub fn state_home() -> PathBuf {
    if let Some(home) = optional(ENV_STATE_HOME) {
        return PathBuf::from(home);
    }
    if let Some(outdir) = optional(ENV_OUTDIR) {
        return PathBuf::from(outdir);
    }
    dirs::data_local_dir()
        .map(|d| d.join("cstar"))
        .unwrap_or_else(|| PathBuf::from(".cstar"))
}

/// The delay between orchestrator cycles.
pub fn poll_interval() -> Result<Duration, EnvError> {
    match optional(ENV_ORCH_DELAYS) {
        None => Ok(DEFAULT_POLL_INTERVAL),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| EnvError::Invalid {
                key: ENV_ORCH_DELAYS,
                value: raw,
            }),
    }
}
