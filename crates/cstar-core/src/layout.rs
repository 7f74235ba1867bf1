//! Per-run filesystem layout.
//!
//! All artifacts for a run live under `<state_home>/<run_id>/`:
//!
//! ```text
//! <state_home>/<run_id>/
//!   blueprint.yaml                      # copy of the original
//!   <workplan-name>-host.yaml           # emitted, possibly transformed
//!   state.db                            # durable submission cache
//!   <step-name>/work/script.sh          # per-step artifacts
//!   <step-name>/logs/<step-name>.out    # captured stdout+stderr
//!   <step-name>/logs/<step-name>.status # local launcher exit code
//! ```

use std::path::{Path, PathBuf};

use crate::env;
use crate::slug::slugify;

/// Paths for a single run's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    /// Layout rooted at `<state_home>/<run_id>/`.
    pub fn new(state_home: &Path, run_id: &str) -> Self {
        Self {
            root: state_home.join(slugify(run_id)),
        }
    }

    /// Layout for the current environment's state home and run id.
    pub fn from_env() -> Result<Self, env::EnvError> {
        let run_id = env::run_id()?;
        Ok(Self::new(&env::state_home(), &run_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy of the original blueprint made at run preparation.
    pub fn blueprint_copy(&self) -> PathBuf {
        self.root.join("blueprint.yaml")
    }

    /// The emitted (possibly transformed) workplan for this run.
    pub fn host_workplan(&self, workplan_name: &str) -> PathBuf {
        self.root
            .join(format!("{}-host.yaml", slugify(workplan_name)))
    }

    /// The durable submission cache database.
    pub fn state_db(&self) -> PathBuf {
        self.root.join("state.db")
    }

    /// Per-step working directory (scripts, scratch files).
    pub fn step_work_dir(&self, step_name: &str) -> PathBuf {
        self.root.join(slugify(step_name)).join("work")
    }

    /// Per-step log directory.
    pub fn step_logs_dir(&self, step_name: &str) -> PathBuf {
        self.root.join(slugify(step_name)).join("logs")
    }

    /// The script artifact submitted for a step.
    pub fn step_script(&self, step_name: &str) -> PathBuf {
        self.step_work_dir(step_name).join("script.sh")
    }

    /// Captured stdout+stderr for a step.
    pub fn step_output(&self, step_name: &str) -> PathBuf {
        self.step_logs_dir(step_name)
            .join(format!("{}.out", slugify(step_name)))
    }

    /// Exit-code file written by the local launcher's wrapper.
    pub fn step_status(&self, step_name: &str) -> PathBuf {
        self.step_logs_dir(step_name)
            .join(format!("{}.status", slugify(step_name)))
    }

    /// Create the run root and the per-step directories for a step.
    pub fn ensure_step_dirs(&self, step_name: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.step_work_dir(step_name))?;
        std::fs::create_dir_all(self.step_logs_dir(step_name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RunLayout {
        RunLayout::new(Path::new("/state"), "My Run")
    }

    #[test]
    fn root_is_slugged_run_id_under_state_home() {
        assert_eq!(layout().root(), Path::new("/state/my-run"));
    }

    #[test]
    fn host_workplan_name_follows_convention() {
        assert_eq!(
            layout().host_workplan("Linear Plan"),
            PathBuf::from("/state/my-run/linear-plan-host.yaml")
        );
    }

    #[test]
    fn step_paths_follow_convention() {
        let l = layout();
        assert_eq!(
            l.step_script("Step A"),
            PathBuf::from("/state/my-run/step-a/work/script.sh")
        );
        assert_eq!(
            l.step_output("Step A"),
            PathBuf::from("/state/my-run/step-a/logs/step-a.out")
        );
        assert_eq!(
            l.step_status("Step A"),
            PathBuf::from("/state/my-run/step-a/logs/step-a.status")
        );
    }

    #[test]
    fn state_db_lives_at_run_root() {
        assert_eq!(layout().state_db(), PathBuf::from("/state/my-run/state.db"));
    }

    #[test]
    fn ensure_step_dirs_creates_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let l = RunLayout::new(dir.path(), "run");
        l.ensure_step_dirs("a").unwrap();
        assert!(l.step_work_dir("a").is_dir());
        assert!(l.step_logs_dir("a").is_dir());
    }
}
