pub mod local;
pub mod parser;
pub mod slurm;

use crate::{
    config::{BackendConfig, ResourceConfig},
    paths::{self, DONE_MARKER, EXIT_CODE},
    process,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

pub use crate::process::CommandOutput;

#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Submission failed: {0}")]
    Submission(String),
    #[error("Status query failed: {0}")]
    Poll(String),
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("IO error: {0}")]
    Io(String),
}

impl From<io::Error> for BackendError {
    fn from(error: io::Error) -> Self {
        BackendError::Io(error.to_string())
    }
}

/// Backend specific identifier of a submitted job, only ever interpreted by the
/// backend variant that issued it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Handle {
    /// process (group) id of a locally spawned wrapper
    Process(i32),
    /// scheduler job id
    Job(String),
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(pid) => write!(f, "pid {pid}"),
            Self::Job(id) => write!(f, "job {id}"),
        }
    }
}

/// Outcome of a single status query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done(i32),
    Failed(Option<i32>),
    /// the backend could not tell, e.g. the process is gone without leaving an exit code
    Unknown,
}

impl JobStatus {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Done(code)
        } else {
            Self::Failed(Some(code))
        }
    }
}

/// Everything a backend needs to start one run
#[derive(Debug, Clone, Copy)]
pub struct JobSpec<'a> {
    pub name: &'a str,
    pub work_dir: &'a Path,
    /// solver invocation as shell words, without any launcher
    pub command: &'a str,
    pub resources: &'a ResourceConfig,
}

pub trait Backend {
    /// start the job and return immediately with its handle
    fn submit(&self, job: &JobSpec) -> Result<Handle, BackendError>;

    /// query the current status, never waits for the job to finish
    fn poll(&self, handle: &Handle, work_dir: &Path) -> Result<JobStatus, BackendError>;

    /// request termination, a job that already finished is not an error
    fn cancel(&self, handle: &Handle, work_dir: &Path) -> Result<(), BackendError>;
}

/// All available backends
/// (enum dispatch, there is a closed set of variants selected by config)
#[derive(Debug, Clone)]
pub enum Backends {
    Local(local::LocalBackend),
    Slurm(slurm::SlurmBackend),
}

impl Backends {
    pub fn load(config: &BackendConfig) -> Self {
        match config {
            BackendConfig::Bash(local) => Self::Local(local::LocalBackend::load(local.clone())),
            BackendConfig::Slurm(slurm) => Self::Slurm(slurm::SlurmBackend::load(slurm.clone())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "bash",
            Self::Slurm(_) => "slurm",
        }
    }
}

impl Backend for Backends {
    fn submit(&self, job: &JobSpec) -> Result<Handle, BackendError> {
        match self {
            Self::Local(backend) => backend.submit(job),
            Self::Slurm(backend) => backend.submit(job),
        }
    }

    fn poll(&self, handle: &Handle, work_dir: &Path) -> Result<JobStatus, BackendError> {
        match self {
            Self::Local(backend) => backend.poll(handle, work_dir),
            Self::Slurm(backend) => backend.poll(handle, work_dir),
        }
    }

    fn cancel(&self, handle: &Handle, work_dir: &Path) -> Result<(), BackendError> {
        match self {
            Self::Local(backend) => backend.cancel(handle, work_dir),
            Self::Slurm(backend) => backend.cancel(handle, work_dir),
        }
    }
}

/// The shell sequence every backend executes. The exit code and the marker are
/// written regardless of the solver's success, polling relies on both.
pub fn wrapper_line(work_dir: &Path, command: &str) -> String {
    format!(
        "cd {} && {command} ; echo $? > {EXIT_CODE} ; touch {DONE_MARKER}\n",
        paths::shell_quote(&work_dir.to_string_lossy())
    )
}

/// Remove markers left over from an earlier submission of the same run
pub fn clear_markers(work_dir: &Path) -> Result<(), BackendError> {
    paths::remove_if_exists(&work_dir.join(DONE_MARKER))?;
    paths::remove_if_exists(&work_dir.join(EXIT_CODE))?;

    Ok(())
}

/// Run a short lived external command to completion, killing it after `timeout`
pub fn run_command(mut command: Command, timeout: Duration) -> Result<CommandOutput, BackendError> {
    let name = command.get_program().to_string_lossy().into_owned();

    debug!(command = ?command, "Running external command");

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| BackendError::Command {
            command: name.clone(),
            message: error.to_string(),
        })?;

    match process::wait_with_timeout(child, timeout)? {
        Some(output) => {
            debug!(command = %name, status = ?output.status, "External command finished");

            Ok(output)
        }
        None => Err(BackendError::Timeout {
            command: name,
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, path::PathBuf};

    #[test]
    fn wrapper_line_writes_markers() {
        let line = wrapper_line(&PathBuf::from("/runs/a b"), "exit 3");
        assert_eq!(
            line,
            "cd '/runs/a b' && exit 3 ; echo $? > EXIT_CODE ; touch DONE_MARKER\n"
        );
    }

    #[test]
    fn exit_codes_map_to_status() {
        assert_eq!(JobStatus::from_exit_code(0), JobStatus::Done(0));
        assert_eq!(JobStatus::from_exit_code(2), JobStatus::Failed(Some(2)));
    }

    #[test]
    fn handles_serialize_tagged() {
        let yaml = serde_yaml::to_string(&Handle::Job(String::from("4242"))).unwrap();
        assert_eq!(
            serde_yaml::from_str::<Handle>(&yaml).unwrap(),
            Handle::Job(String::from("4242"))
        );
        assert_eq!(Handle::Process(12).to_string(), "pid 12");
    }

    #[test]
    fn run_command_collects_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 4"]);

        let output = run_command(command, Duration::from_secs(10)).unwrap();
        assert_eq!(output.status.code(), Some(4));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[test]
    fn run_command_drains_large_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "head -c 150000 /dev/zero | tr '\\0' q"]);

        let output = run_command(command, Duration::from_secs(10)).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 150_000);
    }

    #[test]
    fn run_command_times_out() {
        let mut command = Command::new("sleep");
        command.arg("10");

        match run_command(command, Duration::from_millis(100)) {
            Err(BackendError::Timeout { command, .. }) => assert_eq!(command, "sleep"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn run_command_reports_missing_programs() {
        let command = Command::new("/nonexistent/qlk-scheduler");

        assert!(matches!(
            run_command(command, Duration::from_secs(1)),
            Err(BackendError::Command { .. })
        ));
    }

    #[test]
    fn stale_markers_are_removed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(DONE_MARKER), "").unwrap();
        fs::write(tmp.path().join(EXIT_CODE), "0").unwrap();

        clear_markers(tmp.path()).unwrap();
        assert!(!tmp.path().join(DONE_MARKER).exists());
        // nothing left to remove
        clear_markers(tmp.path()).unwrap();
    }
}
