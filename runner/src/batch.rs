use crate::{
    backends::{Backends, Handle},
    config::{ResourceConfig, RetryPolicy, RunnerConfig},
    input::Packages,
    paths::{self, BATCH_INFO, RUN_RECORD},
    run::{Run, RunError, RunState},
};
use chrono::{DateTime, Utc};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fmt, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

/// Per run outcome of a batch operation, in insertion order
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<(String, Result<RunState, RunError>)>,
}

pub type SubmitReport = BatchReport;
pub type CancelReport = BatchReport;

impl BatchReport {
    pub fn errors(&self) -> impl Iterator<Item = (&str, &RunError)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| outcome.as_ref().err().map(|error| (name.as_str(), error)))
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Result of polling every member of a batch
#[derive(Debug)]
pub struct PollReport {
    /// state of every member after the poll, in insertion order
    pub states: Vec<(String, RunState)>,
    pub tally: BTreeMap<RunState, usize>,
    /// status queries that failed during this poll
    pub errors: Vec<(String, RunError)>,
    pub complete: bool,
    pub healthy: bool,
}

impl PollReport {
    pub fn summary(&self) -> String {
        let counts = self
            .tally
            .iter()
            .map(|(state, count)| format!("{state}={count}"))
            .join(" ");

        format!("{} runs: {counts}", self.states.len())
    }
}

impl fmt::Display for PollReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())?;
        if self.complete {
            write!(f, " (complete, {})", if self.healthy { "healthy" } else { "unhealthy" })?;
        }

        Ok(())
    }
}

/// Metadata written next to the run directories after a submission
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchInfo {
    pub name: String,
    pub backend: String,
    pub submitted_at: DateTime<Utc>,
    pub runs: Vec<BatchInfoRun>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchInfoRun {
    pub name: String,
    pub handle: Option<Handle>,
}

/// Ordered set of runs sharing one backend and one resource request
#[derive(Debug)]
pub struct Batch {
    name: String,
    dir: PathBuf,
    backend: Backends,
    resources: ResourceConfig,
    policy: RetryPolicy,
    runs: Vec<Run>,
}

impl Batch {
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        backend: Backends,
        resources: ResourceConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            backend,
            resources,
            policy,
            runs: Vec::new(),
        }
    }

    /// Build the batch described by `config`, picking up whatever earlier invocations
    /// recorded in the run directories.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, RunError> {
        let cwd = env::current_dir().map_err(|error| RunError::Path {
            path: PathBuf::from("."),
            message: error.to_string(),
        })?;
        let dir = paths::absolutize(&cwd, &config.batch_dir());
        let backend = Backends::load(&config.backend);
        let command = config.solver.command_line();

        let mut batch = Self::new(
            &config.batch.name,
            &dir,
            backend,
            config.resources.clone(),
            config.retry,
        );

        for case in config.cases.iter() {
            let run = Run::restore(&case.name, &dir, Packages::load(case), &command, &batch.backend)?;
            batch.push(run)?;
        }

        debug!(batch = %batch.name, runs = batch.runs.len(), "Loaded batch");

        Ok(batch)
    }

    /// Append a run. Runs are submitted, polled and reported in the order they were pushed.
    pub fn push(&mut self, run: Run) -> Result<(), RunError> {
        if let Some(existing) = self.runs.iter().find(|other| other.work_dir() == run.work_dir()) {
            return Err(RunError::Path {
                path: run.work_dir().to_path_buf(),
                message: format!("already used by run '{}'", existing.name()),
            });
        }

        self.runs.push(run);

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backend(&self) -> &Backends {
        &self.backend
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn states(&self) -> Vec<(&str, RunState)> {
        self.runs.iter().map(|run| (run.name(), run.state())).collect_vec()
    }

    /// every member reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.runs.iter().all(|run| run.state().is_terminal())
    }

    pub fn is_healthy(&self) -> bool {
        self.is_complete() && self.runs.iter().all(|run| run.state() != RunState::Failed)
    }

    /// Prepare every run that has not been handed to the backend yet
    pub fn prepare(&mut self) -> BatchReport {
        let outcomes = self
            .runs
            .iter_mut()
            .map(|run| {
                let outcome = match run.state() {
                    RunState::Created | RunState::Prepared => run.prepare().map(|_| run.state()),
                    state => Ok(state),
                };

                (run.name().to_string(), outcome)
            })
            .collect_vec();

        BatchReport { outcomes }
    }

    /// Prepare and submit every member in insertion order.
    /// A failing run is captured on the run itself and never stops the others.
    pub fn submit(&mut self) -> SubmitReport {
        if let Err(error) = paths::ensure_dir(&self.dir) {
            error!(batch = %self.name, dir = ?self.dir, "Unable to create batch directory: {error}");
        }

        let mut outcomes = Vec::with_capacity(self.runs.len());
        let mut submitted = 0;

        for run in self.runs.iter_mut() {
            if run.state() == RunState::Created {
                if let Err(error) = run.prepare() {
                    outcomes.push((run.name().to_string(), Err(error)));
                    continue;
                }
            }

            let outcome = match run.state() {
                RunState::Prepared => run.submit(&self.backend, &self.resources).map(|_| {
                    submitted += 1;
                    run.state()
                }),
                state => {
                    debug!(run = run.name(), state = %state, "Skipping submission");
                    Ok(state)
                }
            };

            outcomes.push((run.name().to_string(), outcome));
        }

        info!(batch = %self.name, submitted, total = self.runs.len(), "Submitted batch");

        if submitted > 0 {
            self.write_info();
        }

        BatchReport { outcomes }
    }

    /// Poll every active member once. Failed status queries leave the run untouched
    /// and are collected in the report.
    pub fn poll(&mut self) -> PollReport {
        let mut errors = Vec::new();

        for run in self.runs.iter_mut().filter(|run| run.state().is_active()) {
            if let Err(error) = run.poll(&self.backend, &self.policy) {
                warn!(run = run.name(), error = %error, "Failed to poll run");
                errors.push((run.name().to_string(), error));
            }
        }

        let states = self
            .runs
            .iter()
            .map(|run| (run.name().to_string(), run.state()))
            .collect_vec();
        let tally = states.iter().map(|(_, state)| *state).counts().into_iter().collect();

        PollReport {
            states,
            tally,
            errors,
            complete: self.is_complete(),
            healthy: self.is_healthy(),
        }
    }

    /// Cancel every active member. Terminal members are left as they are,
    /// members that were never submitted have nothing to cancel.
    pub fn cancel(&mut self) -> CancelReport {
        let outcomes = self
            .runs
            .iter_mut()
            .map(|run| {
                let outcome = if run.state().is_active() {
                    run.cancel(&self.backend)
                } else {
                    Ok(run.state())
                };

                (run.name().to_string(), outcome)
            })
            .collect_vec();

        BatchReport { outcomes }
    }

    /// Clean every member so the batch can be resubmitted, active members are refused
    pub fn clean(&mut self) -> BatchReport {
        let outcomes = self
            .runs
            .iter_mut()
            .map(|run| (run.name().to_string(), run.clean()))
            .collect_vec();

        if let Err(error) = paths::remove_if_exists(&self.dir.join(BATCH_INFO)) {
            warn!(batch = %self.name, "Failed to remove batch info: {error}");
        }

        BatchReport { outcomes }
    }

    fn write_info(&self) {
        let info = BatchInfo {
            name: self.name.clone(),
            backend: self.backend.kind().to_string(),
            submitted_at: Utc::now(),
            runs: self
                .runs
                .iter()
                .map(|run| BatchInfoRun {
                    name: run.name().to_string(),
                    handle: run.handle().cloned(),
                })
                .collect_vec(),
        };
        let path = self.dir.join(BATCH_INFO);

        let result = serde_yaml::to_string(&info)
            .map_err(|error| error.to_string())
            .and_then(|content| fs::write(&path, content).map_err(|error| error.to_string()));

        if let Err(error) = result {
            error!(batch = %self.name, path = ?path, "Failed to write batch info: {error}");
        }
    }

    /// Find every run directory below `dir`, i.e. every directory holding a run record
    pub fn discover(dir: &Path) -> Vec<PathBuf> {
        WalkBuilder::new(dir)
            .standard_filters(false)
            .build()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
            .filter(|entry| entry.file_name() == RUN_RECORD)
            .map(DirEntry::into_path)
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .sorted()
            .collect_vec()
    }
}
