use super::{
    clear_markers, parser, run_command, wrapper_line, Backend, BackendError, Handle, JobSpec,
    JobStatus,
};
use crate::{
    config::SlurmConfig,
    paths::{self, Completion, STDERR, STDOUT},
};
use std::{fmt::Write as _, fs, path::Path, time::Duration};
use tracing::{debug, info, instrument, warn};

/// name of the generated batch script inside the run directory
pub const SCRIPT: &str = "qlk_run.sbatch";

/// Backend submitting every run as its own Slurm job
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    config: SlurmConfig,
}

impl SlurmBackend {
    pub fn load(config: SlurmConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.command_timeout)
    }

    /// Render the sbatch script for a single run
    pub fn batch_script(&self, job: &JobSpec) -> String {
        let resources = job.resources;
        let tasks = resources.tasks();
        let mut script = format!("#!{} -l\n", self.config.shell.display());

        // writing into a String cannot fail
        let mut directive = |name: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(script, "#SBATCH --{name}={value}");
        };

        directive("job-name", &job.name);
        if let Some(partition) = &self.config.partition {
            directive("partition", partition);
        }
        if let Some(qos) = &self.config.qos {
            directive("qos", qos);
        }
        if let Some(account) = &self.config.account {
            directive("account", account);
        }
        directive("time", &resources.walltime);
        directive("nodes", &self.config.nodes(resources, tasks));
        directive("ntasks", &tasks);
        directive("cpus-per-task", &resources.cpus_per_task);
        directive("output", &STDOUT);
        directive("error", &STDERR);

        let _ = write!(
            script,
            "\nexport OMP_NUM_THREADS={}\n\n{}",
            resources.cpus_per_task,
            wrapper_line(
                job.work_dir,
                &format!("{} -n {tasks} {}", self.config.launcher, job.command)
            )
        );

        script
    }
}

fn expect_job_id(handle: &Handle) -> Result<&str, BackendError> {
    match handle {
        Handle::Job(id) => Ok(id),
        Handle::Process(pid) => Err(BackendError::Poll(format!(
            "local process {pid} handed to the slurm backend"
        ))),
    }
}

/// Status of a job that squeue no longer (or never) lists, decided by its markers
fn status_from_markers(work_dir: &Path, job_id: &str) -> JobStatus {
    match paths::read_completion(work_dir) {
        Completion::Exited(code) => JobStatus::from_exit_code(code),
        Completion::Unreadable => JobStatus::Failed(None),
        Completion::Pending => {
            warn!(job_id, work_dir = ?work_dir, "Job vanished from the queue without completing");

            JobStatus::Failed(None)
        }
    }
}

impl Backend for SlurmBackend {
    #[instrument(skip(self, job), fields(run = job.name), level = "debug")]
    fn submit(&self, job: &JobSpec) -> Result<Handle, BackendError> {
        clear_markers(job.work_dir)?;
        fs::write(job.work_dir.join(SCRIPT), self.batch_script(job))?;

        let mut command = self.config.sbatch.command();
        command.arg(SCRIPT).current_dir(job.work_dir);

        let output = run_command(command, self.timeout())
            .map_err(|error| BackendError::Submission(error.to_string()))?;

        if !output.status.success() {
            return Err(BackendError::Submission(format!(
                "{} exited with {}: {}",
                self.config.sbatch,
                output.status,
                output.stderr.trim()
            )));
        }

        match parser::parse_sbatch_output(&output.stdout) {
            Some(job_id) => {
                info!(run = job.name, job_id, "Queued run");

                Ok(Handle::Job(job_id))
            }
            None => Err(BackendError::Submission(format!(
                "unable to find a job id in sbatch output: {}",
                output.stdout.trim()
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn poll(&self, handle: &Handle, work_dir: &Path) -> Result<JobStatus, BackendError> {
        let job_id = expect_job_id(handle)?;

        let mut command = self.config.squeue.command();
        command.args(["--noheader", "--format=%i %T", "--jobs", job_id]);

        let output = run_command(command, self.timeout())
            .map_err(|error| BackendError::Poll(error.to_string()))?;

        let listed = if output.status.success() {
            parser::parse_squeue_output(&output.stdout, job_id)
        } else if parser::is_invalid_job_id(&output.stderr) {
            None
        } else {
            return Err(BackendError::Poll(format!(
                "{} exited with {}: {}",
                self.config.squeue,
                output.status,
                output.stderr.trim()
            )));
        };

        debug!(job_id, state = ?listed, "Queried job state");

        let status = match listed {
            None => status_from_markers(work_dir, job_id),
            Some(state) if state.is_pending() => JobStatus::Pending,
            Some(state) if state.is_active() => JobStatus::Running,
            Some(state) if state.is_terminal() => match paths::read_completion(work_dir) {
                Completion::Exited(code) => JobStatus::from_exit_code(code),
                // the marker may lag behind on shared filesystems
                Completion::Pending | Completion::Unreadable
                    if state == parser::SlurmState::Completed =>
                {
                    JobStatus::Unknown
                }
                Completion::Pending | Completion::Unreadable => JobStatus::Failed(None),
            },
            Some(state) => {
                warn!(job_id, state = ?state, "Unrecognized slurm state");

                JobStatus::Unknown
            }
        };

        Ok(status)
    }

    #[instrument(skip(self), level = "debug")]
    fn cancel(&self, handle: &Handle, _work_dir: &Path) -> Result<(), BackendError> {
        let job_id = match handle {
            Handle::Job(id) => id,
            Handle::Process(pid) => {
                return Err(BackendError::Command {
                    command: self.config.scancel.to_string(),
                    message: format!("local process {pid} handed to the slurm backend"),
                })
            }
        };

        let mut command = self.config.scancel.command();
        command.arg(job_id);

        // an already finished job makes scancel fail, which is fine
        match run_command(command, self.timeout()) {
            Ok(output) if output.status.success() => info!(job_id, "Cancelled job"),
            Ok(output) => debug!(
                job_id,
                stderr = output.stderr.trim(),
                "scancel failed, job most likely already finished"
            ),
            Err(error) => warn!(job_id, error = ?error, "Failed to run scancel"),
        }

        Ok(())
    }
}
