//! Local-process launcher.
//!
//! Commands run detached in their own session, wrapped so that the
//! combined stdout+stderr lands in the step's log file and the exit code
//! is persisted to a status file. Status queries read the status file
//! first and fall back to a pid liveness check that verifies the process
//! creation time, so a recycled pid is never mistaken for a live task.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use cstar_core::{LauncherKind, RunLayout, Status, Step};

use crate::convert::get_converter;
use crate::launch::{LaunchError, Launcher};
use crate::store::{Phase, StateStore};
use crate::task::{Handle, Task};

/// Tolerance when matching a pid's creation time against the recorded
/// handle, in seconds.
const CREATE_TIME_TOLERANCE: f64 = 1.0;

/// How long cancel waits for SIGTERM to land before escalating.
const TERM_GRACE: Duration = Duration::from_secs(3);

/// A launcher that executes steps in detached local processes.
pub struct LocalLauncher {
    run_id: String,
    layout: RunLayout,
    store: Arc<StateStore>,
    /// Children spawned by this process, kept for opportunistic reaping.
    /// Resumed runs have no entry here and rely on the status file.
    children: Mutex<HashMap<String, std::process::Child>>,
}

impl std::fmt::Debug for LocalLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLauncher")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Wrap a command so its output and exit code are persisted:
/// `( cmd ) > output 2>&1; echo $? > status`.
fn wrap_command(cmd: &str, output_file: &Path, status_file: &Path) -> String {
    format!(
        "( {cmd} ) > {output} 2>&1; echo $? > {status}",
        output = output_file.display(),
        status = status_file.display(),
    )
}

/// Read a status file, tolerating absent, empty, or partial content.
///
/// Returns `None` when no terminal verdict can be read yet.
fn read_status_file(path: &Path) -> Option<Status> {
    let content = std::fs::read_to_string(path).ok()?;
    let exit_code: i32 = content.trim().parse().ok()?;
    Some(if exit_code == 0 {
        Status::Done
    } else {
        Status::Failed
    })
}

/// The creation time of a live process, as a posix timestamp.
fn process_create_time(pid: i32) -> Option<f64> {
    let process = procfs::process::Process::new(pid).ok()?;
    let stat = process.stat().ok()?;
    let boot = procfs::boot_time_secs().ok()?;
    let tps = procfs::ticks_per_second();
    Some(boot as f64 + stat.starttime as f64 / tps as f64)
}

/// True when `pid` is alive and was created at the recorded time.
fn is_same_process(pid: i32, create_time: f64) -> bool {
    process_create_time(pid)
        .map(|t| (t - create_time).abs() < CREATE_TIME_TOLERANCE)
        .unwrap_or(false)
}

impl LocalLauncher {
    pub fn new(run_id: String, layout: RunLayout, store: Arc<StateStore>) -> Self {
        Self {
            run_id,
            layout,
            store,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Reap any finished children so they don't linger as zombies.
    fn reap_children(&self) {
        if let Ok(mut children) = self.children.lock() {
            children.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        }
    }

    fn local_handle<'h>(handle: &'h Handle) -> Result<LocalView<'h>, LaunchError> {
        match handle {
            Handle::Local {
                pid,
                create_time,
                status_file,
                output_file,
            } => Ok(LocalView {
                pid,
                create_time: *create_time,
                status_file,
                output_file,
            }),
            _ => Err(LaunchError::WrongHandle { expected: "local" }),
        }
    }

    fn submit(&self, step: &Step) -> Result<Handle, LaunchError> {
        let converter = get_converter(LauncherKind::Local, &step.application)?;
        let cmd = converter(step);

        let step_name = &step.name;
        self.layout.ensure_step_dirs(step_name)?;
        let script_path = self.layout.step_script(step_name);
        let output_file = self.layout.step_output(step_name);
        let status_file = self.layout.step_status(step_name);
        std::fs::write(&script_path, &cmd)?;

        let wrapped = wrap_command(
            &format!("sh {}", script_path.display()),
            &output_file,
            &status_file,
        );
        debug!(step = %step_name, cmd = %wrapped, "creating local process");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&wrapped)
            .current_dir(self.layout.step_work_dir(step_name))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe and runs before exec in the
        // forked child.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }

        let child = command.spawn().map_err(|e| LaunchError::Submit {
            step: step_name.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id() as i32;
        // If the process already finished, fall back to "now"; the status
        // file is authoritative in that case.
        let create_time = process_create_time(pid)
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as f64 / 1000.0);

        if let Ok(mut children) = self.children.lock() {
            children.insert(pid.to_string(), child);
        }

        info!(step = %step_name, pid, "local run created process");

        Ok(Handle::Local {
            pid: pid.to_string(),
            create_time,
            status_file,
            output_file,
        })
    }
}

struct LocalView<'h> {
    pid: &'h str,
    create_time: f64,
    status_file: &'h Path,
    output_file: &'h Path,
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::Local
    }

    async fn launch(&self, step: &Step, _dependencies: &[Handle]) -> Result<Task, LaunchError> {
        if let Some(handle) = self
            .store
            .cached_submission(&self.run_id, &step.name, Phase::Submit)
            .await?
        {
            debug!(step = %step.name, pid = handle.pid(), "cached submission hit");
            return Ok(Task::new(step.clone(), handle, Status::Submitted));
        }

        let handle = self.submit(step)?;
        let handle = self
            .store
            .record_submission(&self.run_id, &step.name, Phase::Submit, &handle)
            .await?;

        Ok(Task::new(step.clone(), handle, Status::Submitted))
    }

    async fn query_status(&self, step: &Step, handle: &Handle) -> Result<Status, LaunchError> {
        let view = Self::local_handle(handle)?;
        self.reap_children();

        if let Some(status) = read_status_file(view.status_file) {
            debug!(step = %step.name, pid = view.pid, %status, "status file verdict");
            return Ok(status);
        }

        let pid: i32 = view.pid.parse().map_err(|_| LaunchError::Query {
            pid: view.pid.to_string(),
            reason: "handle pid is not numeric".to_string(),
        })?;

        if is_same_process(pid, view.create_time) {
            return Ok(Status::Running);
        }

        // The process may have exited between the two checks; give the
        // status file a second look before declaring it vanished.
        if let Some(status) = read_status_file(view.status_file) {
            return Ok(status);
        }

        warn!(step = %step.name, pid, output = %view.output_file.display(),
              "process vanished without writing a status file");
        Ok(Status::Failed)
    }

    async fn cancel(&self, mut task: Task) -> Task {
        let view = match Self::local_handle(&task.handle) {
            Ok(view) => view,
            Err(_) => return task,
        };

        if read_status_file(view.status_file).is_some() {
            debug!(pid = view.pid, "task already complete; nothing to cancel");
            return task;
        }

        let pid: i32 = match view.pid.parse() {
            Ok(pid) => pid,
            Err(_) => return task,
        };
        if !is_same_process(pid, view.create_time) {
            return task;
        }

        let pgid = Pid::from_raw(pid);
        if let Err(err) = killpg(pgid, Signal::SIGTERM) {
            warn!(pid, %err, "unable to cancel the task");
            return task;
        }

        let deadline = tokio::time::Instant::now() + TERM_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !is_same_process(pid, view.create_time) {
                task.status = Status::Cancelled;
                self.reap_children();
                return task;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Err(err) = killpg(pgid, Signal::SIGKILL) {
            warn!(pid, %err, "unable to kill the task");
            return task;
        }

        task.status = Status::Cancelled;
        self.reap_children();
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sleep_step(name: &str) -> Step {
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

    async fn launcher(dir: &TempDir) -> LocalLauncher {
        let layout = RunLayout::new(dir.path(), "test-run");
        let store = Arc::new(StateStore::open(&layout.state_db()).await.unwrap());
        LocalLauncher::new("test-run".to_string(), layout, store)
    }

    #[test]
    fn wrap_command_persists_output_and_exit_code() {
        let wrapped = wrap_command(
            "echo hi",
            Path::new("/logs/a.out"),
            Path::new("/logs/a.status"),
        );
        assert_eq!(wrapped, "( echo hi ) > /logs/a.out 2>&1; echo $? > /logs/a.status");
    }

    #[test]
    fn status_file_parses_exit_codes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.status");

        assert_eq!(read_status_file(&path), None, "absent file is not terminal");

        std::fs::write(&path, "0\n").unwrap();
        assert_eq!(read_status_file(&path), Some(Status::Done));

        std::fs::write(&path, "137\n").unwrap();
        assert_eq!(read_status_file(&path), Some(Status::Failed));

        std::fs::write(&path, "").unwrap();
        assert_eq!(read_status_file(&path), None, "partial write is not terminal");

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_status_file(&path), None);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let handle = Handle::Slurm {
            job_id: "1".to_string(),
            job_name: None,
        };
        assert!(LocalLauncher::local_handle(&handle).is_err());
    }

    #[tokio::test]
    async fn launch_runs_to_done() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir).await;
        let step = sleep_step("quick");

        let task = launcher.launch(&step, &[]).await.unwrap();
        assert_eq!(task.status, Status::Submitted);

        let mut status = Status::Submitted;
        for _ in 0..140 {
            status = launcher.query_status(&step, &task.handle).await.unwrap();
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(status, Status::Done);

        let status_file = dir.path().join("test-run/quick/logs/quick.status");
        assert_eq!(std::fs::read_to_string(status_file).unwrap().trim(), "0");

        let output_file = dir.path().join("test-run/quick/logs/quick.out");
        let output = std::fs::read_to_string(output_file).unwrap();
        assert!(output.contains("quick started"));
    }

    #[tokio::test]
    async fn second_launch_reuses_cached_handle() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir).await;
        let step = sleep_step("cached");

        let first = launcher.launch(&step, &[]).await.unwrap();
        let second = launcher.launch(&step, &[]).await.unwrap();
        assert_eq!(first.handle, second.handle);
    }

    #[tokio::test]
    async fn cancel_terminates_a_running_task() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir).await;
        let step = sleep_step("doomed");

        let task = launcher.launch(&step, &[]).await.unwrap();
        // Give the shell a moment to start.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cancelled = launcher.cancel(task).await;
        assert_eq!(cancelled.status, Status::Cancelled);
    }

    #[tokio::test]
    async fn cancel_preserves_completed_tasks() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(&dir).await;
        let step = sleep_step("done-already");

        let layout = RunLayout::new(dir.path(), "test-run");
        layout.ensure_step_dirs("done-already").unwrap();
        std::fs::write(layout.step_status("done-already"), "0\n").unwrap();

        let task = Task::new(
            step,
            Handle::Local {
                pid: "1".to_string(),
                create_time: 0.0,
                status_file: layout.step_status("done-already"),
                output_file: layout.step_output("done-already"),
            },
            Status::Running,
        );

        let after = launcher.cancel(task).await;
        assert_eq!(after.status, Status::Running, "observed status is preserved");
    }
}
