use crate::{
    backends::{Backend, BackendError, Backends, Handle, JobSpec, JobStatus},
    config::{ResourceConfig, RetryPolicy},
    input::{InputError, InputPackage, Packages},
    paths::{self, DEBUG_DIR, INPUT_DIR, OUTPUT_DIR, PRIMITIVE_DIR, RUN_RECORD},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Created,
    Prepared,
    Submitted,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    /// Known to the backend and not finished yet
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Created => "Created",
            Self::Prepared => "Prepared",
            Self::Submitted => "Submitted",
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        })
    }
}

#[derive(Error, Debug, Clone)]
pub enum RunError {
    #[error("Working directory conflict at {path:?}: {message}")]
    Path { path: PathBuf, message: String },
    #[error("Input generation failed: {0}")]
    InputGeneration(#[from] InputError),
    #[error("{0}")]
    Submission(BackendError),
    #[error("{0}")]
    Poll(BackendError),
    #[error("Gave up after {attempts} consecutive {what}")]
    RetryBudgetExhausted { what: &'static str, attempts: u32 },
    #[error("Invalid run state: expected {expected}, found {found}")]
    InvalidState { expected: &'static str, found: RunState },
    #[error("Run record error: {0}")]
    Record(String),
    /// error message restored from a run record of an earlier invocation
    #[error("{0}")]
    Recorded(String),
}

/// Persisted state of a run, written after every backend interaction
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub name: String,
    pub backend: String,
    pub state: RunState,
    pub handle: Option<Handle>,
    pub exit_code: Option<i32>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    // retry budget counters, carried across invocations
    #[serde(default)]
    pub poll_errors: u32,
    #[serde(default)]
    pub unknown_polls: u32,
}

/// A single simulation case and its lifecycle
#[derive(Debug)]
pub struct Run {
    name: String,
    work_dir: PathBuf,
    package: Packages,
    command: String,
    state: RunState,
    handle: Option<Handle>,
    exit_code: Option<i32>,
    error: Option<RunError>,
    submitted_at: Option<DateTime<Utc>>,
    poll_errors: u32,
    unknown_polls: u32,
}

impl Run {
    /// `runs_dir` is the parent of the run directory, the directory itself is named after the case
    pub fn new(name: impl Into<String>, runs_dir: &Path, package: Packages, command: impl Into<String>) -> Self {
        let name = name.into();

        Self {
            work_dir: runs_dir.join(paths::case_dir_name(&name)),
            name,
            package,
            command: command.into(),
            state: RunState::Created,
            handle: None,
            exit_code: None,
            error: None,
            submitted_at: None,
            poll_errors: 0,
            unknown_polls: 0,
        }
    }

    /// Rebuild a run from the record an earlier invocation left in its directory.
    /// Without a record the run starts out as `Created`.
    pub fn restore(
        name: impl Into<String>,
        runs_dir: &Path,
        package: Packages,
        command: impl Into<String>,
        backend: &Backends,
    ) -> Result<Self, RunError> {
        let mut run = Self::new(name, runs_dir, package, command);
        let record = match read_record(&run.work_dir)? {
            Some(record) => record,
            None => return Ok(run),
        };

        if record.backend != backend.kind() {
            warn!(
                run = %run.name,
                "Run was submitted with the {} backend but is now tracked by {}",
                record.backend,
                backend.kind()
            );
        }

        debug!(run = %run.name, state = %record.state, "Restored run");

        run.state = record.state;
        run.handle = record.handle;
        run.exit_code = record.exit_code;
        run.submitted_at = record.submitted_at;
        run.error = record.error.map(RunError::Recorded);
        run.poll_errors = record.poll_errors;
        run.unknown_polls = record.unknown_polls;

        Ok(run)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn record(&self, backend: &Backends) -> RunRecord {
        RunRecord {
            name: self.name.clone(),
            backend: backend.kind().to_string(),
            state: self.state,
            handle: self.handle.clone(),
            exit_code: self.exit_code,
            submitted_at: self.submitted_at,
            error: self.error.as_ref().map(ToString::to_string),
            poll_errors: self.poll_errors,
            unknown_polls: self.unknown_polls,
        }
    }

    /// Create the run directory and materialize the input package into it.
    /// Re-running on a prepared run rewrites changed inputs and keeps it `Prepared`.
    #[instrument(skip(self), fields(run = %self.name), level = "debug")]
    pub fn prepare(&mut self) -> Result<(), RunError> {
        if !matches!(self.state, RunState::Created | RunState::Prepared) {
            return Err(RunError::InvalidState {
                expected: "Created or Prepared",
                found: self.state,
            });
        }

        match self.materialize() {
            Ok(()) => {
                if self.state == RunState::Created {
                    info!(run = %self.name, work_dir = ?self.work_dir, "Prepared run");
                }
                self.state = RunState::Prepared;

                Ok(())
            }
            Err(error) => {
                self.fail(error.clone());

                Err(error)
            }
        }
    }

    fn materialize(&self) -> Result<(), RunError> {
        let conflict = |path: &Path, error: std::io::Error| RunError::Path {
            path: path.to_path_buf(),
            message: error.to_string(),
        };

        paths::ensure_dir(&self.work_dir).map_err(|error| conflict(&self.work_dir, error))?;

        for dir in [INPUT_DIR, OUTPUT_DIR, PRIMITIVE_DIR, DEBUG_DIR] {
            let path = self.work_dir.join(dir);
            paths::ensure_dir(&path).map_err(|error| conflict(&path, error))?;
        }

        self.package.materialize(&self.work_dir)?;

        if !self.package.is_complete(&self.work_dir) {
            return Err(InputError::Incomplete(self.work_dir.clone()).into());
        }

        Ok(())
    }

    /// Hand the prepared run to the backend. A failed submission moves the run to `Failed`.
    #[instrument(skip(self, backend, resources), fields(run = %self.name), level = "debug")]
    pub fn submit(&mut self, backend: &Backends, resources: &ResourceConfig) -> Result<Handle, RunError> {
        if self.state != RunState::Prepared {
            return Err(RunError::InvalidState {
                expected: "Prepared",
                found: self.state,
            });
        }

        let job = JobSpec {
            name: &self.name,
            work_dir: &self.work_dir,
            command: &self.command,
            resources,
        };

        match backend.submit(&job) {
            Ok(handle) => {
                info!(run = %self.name, handle = %handle, "Submitted run");

                self.handle = Some(handle.clone());
                self.submitted_at = Some(Utc::now());
                self.state = RunState::Submitted;
                self.persist(backend);

                Ok(handle)
            }
            Err(error) => {
                let error = RunError::Submission(error);
                self.fail(error.clone());
                self.persist(backend);

                Err(error)
            }
        }
    }

    /// Ask the backend for the current status. Terminal runs are left untouched.
    ///
    /// A failed status query keeps the last known state and is returned as `RunError::Poll`,
    /// unless the retry budget is exhausted, in which case the run is forced to `Failed`.
    #[instrument(skip(self, backend), fields(run = %self.name), level = "debug")]
    pub fn poll(&mut self, backend: &Backends, policy: &RetryPolicy) -> Result<RunState, RunError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        let handle = match (&self.handle, self.state.is_active()) {
            (Some(handle), true) => handle.clone(),
            _ => {
                return Err(RunError::InvalidState {
                    expected: "Submitted or Running",
                    found: self.state,
                })
            }
        };
        let previous = (self.state, self.poll_errors, self.unknown_polls);

        match backend.poll(&handle, &self.work_dir) {
            Ok(status) => {
                self.poll_errors = 0;
                self.apply(status, policy);
            }
            Err(error) => {
                self.poll_errors += 1;
                warn!(run = %self.name, attempt = self.poll_errors, error = ?error, "Status query failed");

                if exceeds(self.poll_errors, policy.max_poll_errors) {
                    self.fail(RunError::RetryBudgetExhausted {
                        what: "status query failures",
                        attempts: self.poll_errors,
                    });
                }
                self.persist(backend);

                return Err(RunError::Poll(error));
            }
        }

        if self.state != previous.0 {
            info!(run = %self.name, from = %previous.0, to = %self.state, "Run changed state");
        }
        if (self.state, self.poll_errors, self.unknown_polls) != previous {
            self.persist(backend);
        }

        Ok(self.state)
    }

    fn apply(&mut self, status: JobStatus, policy: &RetryPolicy) {
        if status != JobStatus::Unknown {
            self.unknown_polls = 0;
        }

        match status {
            JobStatus::Pending => self.state = RunState::Submitted,
            JobStatus::Running => self.state = RunState::Running,
            JobStatus::Done(code) => {
                self.exit_code = Some(code);
                self.state = RunState::Done;
            }
            JobStatus::Failed(code) => {
                self.exit_code = code;
                self.state = RunState::Failed;
            }
            // optimistic, only a definitive answer or the budget ends the run
            JobStatus::Unknown => {
                self.unknown_polls += 1;

                if exceeds(self.unknown_polls, policy.max_unknown_polls) {
                    self.fail(RunError::RetryBudgetExhausted {
                        what: "indeterminate polls",
                        attempts: self.unknown_polls,
                    });
                } else {
                    self.state = RunState::Running;
                }
            }
        }
    }

    /// Request termination. The run is `Cancelled` whether or not the backend acknowledges it.
    #[instrument(skip(self, backend), fields(run = %self.name), level = "debug")]
    pub fn cancel(&mut self, backend: &Backends) -> Result<RunState, RunError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        let handle = match (&self.handle, self.state.is_active()) {
            (Some(handle), true) => handle.clone(),
            _ => {
                return Err(RunError::InvalidState {
                    expected: "Submitted or Running",
                    found: self.state,
                })
            }
        };

        if let Err(error) = backend.cancel(&handle, &self.work_dir) {
            warn!(run = %self.name, error = ?error, "Backend did not acknowledge cancellation");
        }

        info!(run = %self.name, handle = %handle, "Cancelled run");
        self.state = RunState::Cancelled;
        self.persist(backend);

        Ok(self.state)
    }

    /// Remove solver output and completion markers so the run can be submitted again
    pub fn clean(&mut self) -> Result<RunState, RunError> {
        if self.state.is_active() {
            return Err(RunError::InvalidState {
                expected: "a run that is not queued or running",
                found: self.state,
            });
        }

        let io_error = |error: std::io::Error| RunError::Path {
            path: self.work_dir.clone(),
            message: error.to_string(),
        };

        for dir in [OUTPUT_DIR, PRIMITIVE_DIR, DEBUG_DIR] {
            paths::clean_suffix(&self.work_dir.join(dir), ".dat").map_err(io_error)?;
        }
        for file in [
            paths::STDOUT,
            paths::STDERR,
            paths::EXIT_CODE,
            paths::DONE_MARKER,
            RUN_RECORD,
        ] {
            paths::remove_if_exists(&self.work_dir.join(file)).map_err(io_error)?;
        }

        self.handle = None;
        self.exit_code = None;
        self.error = None;
        self.submitted_at = None;
        self.poll_errors = 0;
        self.unknown_polls = 0;
        self.state = if self.work_dir.is_dir() && self.package.is_complete(&self.work_dir) {
            RunState::Prepared
        } else {
            RunState::Created
        };

        debug!(run = %self.name, state = %self.state, "Cleaned run");

        Ok(self.state)
    }

    fn fail(&mut self, error: RunError) {
        error!(run = %self.name, error = %error, "Run failed");

        self.error = Some(error);
        self.state = RunState::Failed;
    }

    /// Write the run record, a failure is logged but does not change the run
    fn persist(&self, backend: &Backends) {
        if !self.work_dir.is_dir() {
            return;
        }

        let path = self.work_dir.join(RUN_RECORD);
        let result = serde_yaml::to_string(&self.record(backend))
            .map_err(|error| error.to_string())
            .and_then(|content| fs::write(&path, content).map_err(|error| error.to_string()));

        if let Err(error) = result {
            error!(run = %self.name, path = ?path, "Failed to write run record: {error}");
        }
    }
}

/// Read the run record in `work_dir`, `None` if the run was never submitted
pub fn read_record(work_dir: &Path) -> Result<Option<RunRecord>, RunError> {
    let path = work_dir.join(RUN_RECORD);

    if !path.is_file() {
        return Ok(None);
    }

    let content =
        fs::read_to_string(&path).map_err(|error| RunError::Record(format!("{}: {error}", path.display())))?;

    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|error| RunError::Record(format!("{}: {error}", path.display())))
}

fn exceeds(count: u32, budget: Option<u32>) -> bool {
    budget.map_or(false, |budget| count > budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::slurm::SlurmBackend,
        config::{CommandLine, LocalConfig, SlurmConfig},
        input::ParameterPackage,
        paths::{DONE_MARKER, EXIT_CODE},
    };
    use std::{
        collections::BTreeMap,
        thread,
        time::{Duration, Instant},
    };

    fn package(required: &[&str]) -> Packages {
        let mut parameters = BTreeMap::new();
        parameters.insert(String::from("Ati"), serde_yaml::Value::from(5.0));

        Packages::Parameters(ParameterPackage::new(
            "case",
            parameters,
            required.iter().map(|name| name.to_string()).collect(),
        ))
    }

    fn local() -> Backends {
        Backends::Local(crate::backends::local::LocalBackend::load(LocalConfig::default()))
    }

    fn fake_slurm(dir: &Path, squeue: &str) -> Backends {
        let command = |name: &str, body: &str| {
            let path = dir.join(name);
            fs::write(&path, body).unwrap();
            CommandLine::try_from(format!("sh {}", path.display())).unwrap()
        };

        Backends::Slurm(SlurmBackend::load(SlurmConfig {
            sbatch: command("sbatch.sh", "echo 'Submitted batch job 77'"),
            squeue: command("squeue.sh", squeue),
            scancel: command("scancel.sh", "exit 1"),
            ..Default::default()
        }))
    }

    fn assert_handle_invariant(run: &Run) {
        match run.state() {
            RunState::Created | RunState::Prepared => assert!(run.handle().is_none()),
            RunState::Submitted | RunState::Running | RunState::Done | RunState::Cancelled => {
                assert!(run.handle().is_some())
            }
            // failing before the backend accepted the run leaves no handle
            RunState::Failed => assert_eq!(
                run.handle().is_none(),
                matches!(
                    run.error(),
                    Some(RunError::Path { .. } | RunError::InputGeneration(_) | RunError::Submission(_))
                )
            ),
        }
    }

    #[test]
    fn prepare_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new("Ati 5.0", tmp.path(), package(&["Ati"]), "exit 0");
        assert_eq!(run.work_dir(), tmp.path().join("Ati_5.0"));

        run.prepare().unwrap();
        assert_eq!(run.state(), RunState::Prepared);
        let first = fs::read(run.work_dir().join(crate::input::PARAMETERS)).unwrap();

        run.prepare().unwrap();
        assert_eq!(run.state(), RunState::Prepared);
        assert_eq!(first, fs::read(run.work_dir().join(crate::input::PARAMETERS)).unwrap());

        for dir in [INPUT_DIR, OUTPUT_DIR, PRIMITIVE_DIR, DEBUG_DIR] {
            assert!(run.work_dir().join(dir).is_dir());
        }
        assert_handle_invariant(&run);
    }

    #[test]
    fn prepare_fails_on_path_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("case"), "not a directory").unwrap();
        let mut run = Run::new("case", tmp.path(), package(&[]), "exit 0");

        assert!(matches!(run.prepare(), Err(RunError::Path { .. })));
        assert_eq!(run.state(), RunState::Failed);
        assert!(matches!(run.error(), Some(RunError::Path { .. })));
        assert_handle_invariant(&run);
    }

    #[test]
    fn prepare_failure_is_captured() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new("case", tmp.path(), package(&["Ate"]), "exit 0");

        assert!(matches!(
            run.prepare(),
            Err(RunError::InputGeneration(InputError::MissingParameter(_)))
        ));
        assert_eq!(run.state(), RunState::Failed);
        assert_handle_invariant(&run);

        // a failed run can neither be prepared nor submitted again
        assert!(matches!(run.prepare(), Err(RunError::InvalidState { .. })));
        assert!(matches!(
            run.submit(&local(), &ResourceConfig::default()),
            Err(RunError::InvalidState { .. })
        ));
    }

    #[test]
    fn submit_requires_prepared() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run = Run::new("case", tmp.path(), package(&[]), "exit 0");

        assert!(matches!(
            run.submit(&local(), &ResourceConfig::default()),
            Err(RunError::InvalidState { found: RunState::Created, .. })
        ));
        // caller errors are not captured on the run
        assert_eq!(run.state(), RunState::Created);
        assert!(run.error().is_none());
    }

    #[test]
    fn local_run_reaches_done() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = local();
        let mut run = Run::new("case", tmp.path(), package(&[]), "exit 0");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();
        assert_eq!(run.state(), RunState::Submitted);
        assert_handle_invariant(&run);

        let deadline = Instant::now() + Duration::from_secs(20);
        while !run.state().is_terminal() && Instant::now() < deadline {
            run.poll(&backend, &RetryPolicy::unlimited()).unwrap();
            assert_handle_invariant(&run);
            thread::sleep(Duration::from_millis(50));
        }

        assert_eq!(run.state(), RunState::Done);
        assert_eq!(run.exit_code(), Some(0));

        // terminal runs do not move any more
        assert_eq!(run.poll(&backend, &RetryPolicy::unlimited()).unwrap(), RunState::Done);
        assert_eq!(run.cancel(&backend).unwrap(), RunState::Done);
        assert_eq!(run.state(), RunState::Done);
    }

    #[test]
    fn submission_failure_moves_to_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Backends::Local(crate::backends::local::LocalBackend::load(LocalConfig {
            shell: PathBuf::from("/nonexistent/shell"),
            launcher: None,
        }));
        let mut run = Run::new("case", tmp.path(), package(&[]), "exit 0");

        run.prepare().unwrap();
        assert!(matches!(
            run.submit(&backend, &ResourceConfig::default()),
            Err(RunError::Submission(_))
        ));
        assert_eq!(run.state(), RunState::Failed);
        assert!(matches!(run.error(), Some(RunError::Submission(_))));
        assert_handle_invariant(&run);

        let record: RunRecord =
            serde_yaml::from_str(&fs::read_to_string(run.work_dir().join(RUN_RECORD)).unwrap()).unwrap();
        assert_eq!(record.state, RunState::Failed);
        assert!(record.error.is_some());
    }

    #[test]
    fn vanished_queue_job_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(
            tmp.path(),
            "echo 'slurm_load_jobs error: Invalid job id specified' >&2; exit 1",
        );
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        assert_eq!(
            run.submit(&backend, &ResourceConfig::default()).unwrap(),
            Handle::Job(String::from("77"))
        );

        assert_eq!(run.poll(&backend, &RetryPolicy::default()).unwrap(), RunState::Failed);
        assert_eq!(run.exit_code(), None);
        assert_handle_invariant(&run);
    }

    #[test]
    fn queue_job_completion_marker_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(tmp.path(), "true");
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();

        fs::write(run.work_dir().join(EXIT_CODE), "0\n").unwrap();
        fs::write(run.work_dir().join(DONE_MARKER), "").unwrap();

        assert_eq!(run.poll(&backend, &RetryPolicy::default()).unwrap(), RunState::Done);
        assert_eq!(run.exit_code(), Some(0));
    }

    #[test]
    fn poll_errors_keep_state_until_budget_is_exhausted() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(tmp.path(), "echo 'Socket timed out' >&2; exit 1");
        let policy = RetryPolicy {
            max_poll_errors: Some(2),
            max_unknown_polls: None,
        };
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();

        for _ in 0..2 {
            assert!(matches!(run.poll(&backend, &policy), Err(RunError::Poll(_))));
            assert_eq!(run.state(), RunState::Submitted);
        }

        assert!(matches!(run.poll(&backend, &policy), Err(RunError::Poll(_))));
        assert_eq!(run.state(), RunState::Failed);
        assert!(matches!(
            run.error(),
            Some(RunError::RetryBudgetExhausted { attempts: 3, .. })
        ));
        assert_handle_invariant(&run);
    }

    #[test]
    fn unknown_polls_are_optimistic_within_budget() {
        let tmp = tempfile::tempdir().unwrap();
        // listed as completed, but the marker never shows up
        let backend = fake_slurm(tmp.path(), "echo '77 COMPLETED'");
        let policy = RetryPolicy {
            max_poll_errors: None,
            max_unknown_polls: Some(1),
        };
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();

        assert_eq!(run.poll(&backend, &policy).unwrap(), RunState::Running);
        assert_eq!(run.poll(&backend, &policy).unwrap(), RunState::Failed);
        assert!(matches!(
            run.error(),
            Some(RunError::RetryBudgetExhausted { attempts: 2, .. })
        ));
    }

    #[test]
    fn cancel_is_unconditional_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(tmp.path(), "echo '77 RUNNING'");
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        assert!(matches!(run.cancel(&backend), Err(RunError::InvalidState { .. })));

        run.submit(&backend, &ResourceConfig::default()).unwrap();
        assert_eq!(run.poll(&backend, &RetryPolicy::default()).unwrap(), RunState::Running);

        // the fake scancel always fails, the run is cancelled nonetheless
        assert_eq!(run.cancel(&backend).unwrap(), RunState::Cancelled);
        assert_eq!(run.cancel(&backend).unwrap(), RunState::Cancelled);
        assert_eq!(run.poll(&backend, &RetryPolicy::default()).unwrap(), RunState::Cancelled);
        assert_handle_invariant(&run);
    }

    #[test]
    fn poll_error_budget_survives_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(tmp.path(), "echo 'Socket timed out' >&2; exit 1");
        let policy = RetryPolicy {
            max_poll_errors: Some(2),
            max_unknown_polls: None,
        };
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();

        // every invocation rebuilds the run from its record
        for attempt in 1..=3 {
            let mut run = Run::restore("case", tmp.path(), package(&[]), "/opt/QuaLiKiz", &backend).unwrap();
            assert!(matches!(run.poll(&backend, &policy), Err(RunError::Poll(_))));

            let expected = if attempt <= 2 { RunState::Submitted } else { RunState::Failed };
            assert_eq!(run.state(), expected, "attempt {attempt}");
        }

        let run = Run::restore("case", tmp.path(), package(&[]), "/opt/QuaLiKiz", &backend).unwrap();
        assert_eq!(run.state(), RunState::Failed);
        assert!(matches!(run.error(), Some(RunError::Recorded(_))));
        assert_eq!(read_record(run.work_dir()).unwrap().unwrap().poll_errors, 3);
    }

    #[test]
    fn unknown_budget_survives_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(tmp.path(), "echo '77 COMPLETED'");
        let policy = RetryPolicy {
            max_poll_errors: None,
            max_unknown_polls: Some(2),
        };
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();

        let states = (0..3)
            .map(|_| {
                let mut run =
                    Run::restore("case", tmp.path(), package(&[]), "/opt/QuaLiKiz", &backend).unwrap();
                run.poll(&backend, &policy).unwrap()
            })
            .collect::<Vec<_>>();

        assert_eq!(states, vec![RunState::Running, RunState::Running, RunState::Failed]);
    }

    #[test]
    fn definitive_answer_resets_persisted_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let failing = fake_slurm(tmp.path(), "echo 'Socket timed out' >&2; exit 1");
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&failing, &ResourceConfig::default()).unwrap();
        assert!(run.poll(&failing, &RetryPolicy::default()).is_err());
        assert_eq!(read_record(run.work_dir()).unwrap().unwrap().poll_errors, 1);

        let queued = fake_slurm(tmp.path(), "echo '77 PENDING'");
        let mut run = Run::restore("case", tmp.path(), package(&[]), "/opt/QuaLiKiz", &queued).unwrap();
        assert_eq!(run.poll(&queued, &RetryPolicy::default()).unwrap(), RunState::Submitted);
        assert_eq!(read_record(run.work_dir()).unwrap().unwrap().poll_errors, 0);
    }

    #[test]
    fn restore_and_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = fake_slurm(tmp.path(), "echo '77 PENDING'");
        let mut run = Run::new("case", tmp.path(), package(&[]), "/opt/QuaLiKiz");

        run.prepare().unwrap();
        run.submit(&backend, &ResourceConfig::default()).unwrap();

        let mut restored = Run::restore("case", tmp.path(), package(&[]), "/opt/QuaLiKiz", &backend).unwrap();
        assert_eq!(restored.state(), RunState::Submitted);
        assert_eq!(restored.handle(), Some(&Handle::Job(String::from("77"))));
        assert!(restored.submitted_at().is_some());

        assert!(matches!(restored.clean(), Err(RunError::InvalidState { .. })));
        restored.cancel(&backend).unwrap();

        fs::write(restored.work_dir().join(OUTPUT_DIR).join("pfe_GB.dat"), "1.0").unwrap();
        assert_eq!(restored.clean().unwrap(), RunState::Prepared);
        assert!(restored.handle().is_none());
        assert!(!restored.work_dir().join(RUN_RECORD).exists());
        assert!(!restored.work_dir().join(OUTPUT_DIR).join("pfe_GB.dat").exists());

        let fresh = Run::restore("case", tmp.path(), package(&[]), "/opt/QuaLiKiz", &backend).unwrap();
        assert_eq!(fresh.state(), RunState::Created);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("case")).unwrap();
        fs::write(tmp.path().join("case").join(RUN_RECORD), "state: [").unwrap();

        assert!(matches!(
            Run::restore("case", tmp.path(), package(&[]), "exit 0", &local()),
            Err(RunError::Record(_))
        ));
    }
}
