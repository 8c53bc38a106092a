use super::{clear_markers, wrapper_line, Backend, BackendError, Handle, JobSpec, JobStatus};
use crate::{
    config::LocalConfig,
    paths::{self, Completion, STDERR, STDOUT},
};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, killpg, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{getpgid, Pid},
};
use std::{
    fs::{self, File},
    os::unix::{fs::PermissionsExt, process::CommandExt},
    path::Path,
    process::{Command, Stdio},
};
use tracing::{debug, info, instrument, warn};

/// name of the generated wrapper script inside the run directory
pub const SCRIPT: &str = "qlk_run.sh";

/// Backend that spawns runs as detached local processes
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: LocalConfig,
}

impl LocalBackend {
    pub fn load(config: LocalConfig) -> Self {
        Self { config }
    }

    fn launch_line(&self, job: &JobSpec) -> String {
        match &self.config.launcher {
            Some(launcher) => format!("{launcher} -n {} {}", job.resources.tasks(), job.command),
            None => job.command.to_string(),
        }
    }

    fn script(&self, job: &JobSpec) -> String {
        format!(
            "#!{}\n\n{}",
            self.config.shell.display(),
            wrapper_line(job.work_dir, &self.launch_line(job))
        )
    }
}

fn expect_pid(handle: &Handle) -> Result<Pid, BackendError> {
    match handle {
        Handle::Process(pid) => Ok(Pid::from_raw(*pid)),
        Handle::Job(id) => Err(BackendError::Poll(format!(
            "scheduler job {id} handed to the local backend"
        ))),
    }
}

/// Check if `pid` still exists. Reaps it if it is our own exited child.
fn is_alive(pid: Pid) -> Result<bool, BackendError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => return Ok(true),
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(false),
        Ok(status) => {
            debug!(pid = pid.as_raw(), status = ?status, "Unexpected wait status");
            return Ok(true);
        }
        // spawned by another invocation, fall back to signal 0
        Err(Errno::ECHILD) => {}
        Err(errno) => return Err(BackendError::Poll(format!("waitpid({pid}) failed: {errno}"))),
    }

    match kill(pid, None) {
        // exists, possibly owned by someone else
        Ok(()) | Err(Errno::EPERM) => {}
        Err(Errno::ESRCH) => return Ok(false),
        Err(errno) => return Err(BackendError::Poll(format!("kill({pid}, 0) failed: {errno}"))),
    }

    // runs are spawned as group leaders, a pid outside its own group was recycled
    match getpgid(Some(pid)) {
        Ok(pgid) if pgid == pid => Ok(true),
        Ok(pgid) => {
            debug!(pid = pid.as_raw(), pgid = pgid.as_raw(), "Pid was reused outside of its process group");

            Ok(false)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(BackendError::Poll(format!("getpgid({pid}) failed: {errno}"))),
    }
}

impl Backend for LocalBackend {
    #[instrument(skip(self, job), fields(run = job.name), level = "debug")]
    fn submit(&self, job: &JobSpec) -> Result<Handle, BackendError> {
        clear_markers(job.work_dir)?;

        let script_path = job.work_dir.join(SCRIPT);
        fs::write(&script_path, self.script(job))?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;

        let stdout = File::create(job.work_dir.join(STDOUT))?;
        let stderr = File::create(job.work_dir.join(STDERR))?;

        // own process group, so cancel reaches the solver and not only the shell
        let child = Command::new(&self.config.shell)
            .arg(&script_path)
            .current_dir(job.work_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|error| {
                BackendError::Submission(format!(
                    "failed to spawn {}: {error}",
                    self.config.shell.display()
                ))
            })?;

        let pid = child.id() as i32;
        info!(run = job.name, pid, "Spawned local run");

        Ok(Handle::Process(pid))
    }

    #[instrument(skip(self), level = "debug")]
    fn poll(&self, handle: &Handle, work_dir: &Path) -> Result<JobStatus, BackendError> {
        let pid = expect_pid(handle)?;

        match paths::read_completion(work_dir) {
            Completion::Exited(code) => return Ok(JobStatus::from_exit_code(code)),
            Completion::Unreadable => return Ok(JobStatus::Unknown),
            Completion::Pending => {}
        }

        if is_alive(pid)? {
            return Ok(JobStatus::Running);
        }

        // the wrapper may have finished between the marker check and the liveness check
        match paths::read_completion(work_dir) {
            Completion::Exited(code) => Ok(JobStatus::from_exit_code(code)),
            Completion::Unreadable | Completion::Pending => {
                warn!(pid = pid.as_raw(), work_dir = ?work_dir, "Process exited without completion marker");

                Ok(JobStatus::Unknown)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn cancel(&self, handle: &Handle, work_dir: &Path) -> Result<(), BackendError> {
        let pid = match handle {
            Handle::Process(pid) => Pid::from_raw(*pid),
            Handle::Job(id) => {
                return Err(BackendError::Command {
                    command: String::from("kill"),
                    message: format!("scheduler job {id} handed to the local backend"),
                })
            }
        };

        // a finished wrapper leaves its pid free for reuse
        if let Completion::Exited(_) | Completion::Unreadable = paths::read_completion(work_dir) {
            debug!(pid = pid.as_raw(), "Run already finished, not signalling");

            return Ok(());
        }

        match killpg(pid, Signal::SIGTERM) {
            Ok(()) => {
                info!(pid = pid.as_raw(), "Sent SIGTERM to process group");
                // reap if it is our child and already gone
                let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));

                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "Process group already gone");

                Ok(())
            }
            Err(errno) => Err(BackendError::Command {
                command: String::from("kill"),
                message: format!("killpg({pid}, SIGTERM) failed: {errno}"),
            }),
        }
    }
}
