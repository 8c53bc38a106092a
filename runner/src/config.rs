use crate::paths;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        fs::metadata(path)
            .map(|metadata| (metadata.permissions().mode() & 0o111) != 0)
            .map_err(ConfigErrors::Io)
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Invalid walltime '{0}', expected [D-]HH:MM:SS")]
    InvalidWalltime(String),
    #[error("Preflight checks failed")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    pub batch: BatchConfig,
    // backend selection together with its scheduler specific knobs
    pub backend: BackendConfig,
    // resource request shared by every run in the batch
    #[serde(default)]
    pub resources: ResourceConfig,
    pub solver: SolverConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    // insertion order of cases is the submission and reporting order
    pub cases: Vec<CaseConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    pub name: String,
    // parent of the batch directory
    pub directory: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum BackendConfig {
    #[serde(alias = "local")]
    Bash(LocalConfig),
    Slurm(SlurmConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bash(_) => "bash",
            Self::Slurm(_) => "slurm",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LocalConfig {
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    // e.g. `mpirun`, receives `-n <tasks>` when set
    pub launcher: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            launcher: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SlurmConfig {
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub account: Option<String>,
    #[serde(default = "default_cores_per_node")]
    pub cores_per_node: u32,
    #[serde(default = "default_sbatch")]
    pub sbatch: CommandLine,
    #[serde(default = "default_squeue")]
    pub squeue: CommandLine,
    #[serde(default = "default_scancel")]
    pub scancel: CommandLine,
    #[serde(default = "default_launcher")]
    pub launcher: String,
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    // in milliseconds, applies to every scheduler CLI call
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: None,
            qos: None,
            account: None,
            cores_per_node: default_cores_per_node(),
            sbatch: default_sbatch(),
            squeue: default_squeue(),
            scancel: default_scancel(),
            launcher: default_launcher(),
            shell: default_shell(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl SlurmConfig {
    /// Number of nodes needed to host `tasks` with the given resources
    pub fn nodes(&self, resources: &ResourceConfig, tasks: u32) -> u32 {
        let vcores_per_node = self.cores_per_node * resources.vcores_per_core();
        let tasks_per_node = (vcores_per_node / resources.cpus_per_task.max(1)).max(1);
        let nodes = tasks.div_ceil(tasks_per_node).max(1);

        if tasks % tasks_per_node != 0 {
            warn!("{tasks} tasks not evenly divisible over {tasks_per_node} tasks per node. Using {nodes} nodes");
        }

        nodes
    }
}

/// A command with fixed leading arguments, written as a single whitespace separated string
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct CommandLine(Vec<String>);

impl CommandLine {
    pub fn program(&self) -> &str {
        // non-empty by construction
        &self.0[0]
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.0[0]);
        command.args(&self.0[1..]);
        command
    }
}

impl TryFrom<String> for CommandLine {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parts = value.split_whitespace().map(str::to_string).collect_vec();

        if parts.is_empty() {
            Err(String::from("command line must not be empty"))
        } else {
            Ok(Self(parts))
        }
    }
}

impl From<CommandLine> for String {
    fn from(value: CommandLine) -> Self {
        value.0.join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    // explicit MPI task count, derived from `cores` when absent
    pub tasks: Option<u32>,
    // cores to spread the tasks over, defaults to all local CPUs
    pub cores: Option<u32>,
    #[serde(default = "default_true")]
    pub hyperthreading: bool,
    #[serde(default = "default_cpus_per_task")]
    pub cpus_per_task: u32,
    #[serde(default = "default_walltime")]
    pub walltime: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            tasks: None,
            cores: None,
            hyperthreading: true,
            cpus_per_task: default_cpus_per_task(),
            walltime: default_walltime(),
        }
    }
}

impl ResourceConfig {
    pub fn vcores_per_core(&self) -> u32 {
        if self.hyperthreading {
            2
        } else {
            1
        }
    }

    /// Number of MPI tasks to start for a single run
    pub fn tasks(&self) -> u32 {
        if let Some(tasks) = self.tasks {
            return tasks;
        }

        let cores = self.cores.unwrap_or_else(|| num_cpus::get() as u32);
        let cores_per_task = (self.cpus_per_task / self.vcores_per_core()).max(1);
        let tasks = cores / cores_per_task;

        if cores % cores_per_task != 0 {
            warn!("{cores} cores not evenly divisible over {cores_per_task} cores per task. Using {tasks} tasks");
        }

        tasks.max(1)
    }
}

/// Parse a Slurm style walltime (`[D-]HH:MM:SS`) into seconds
pub fn parse_walltime(walltime: &str) -> Result<u64, ConfigErrors> {
    let invalid = || ConfigErrors::InvalidWalltime(walltime.to_string());
    let (days, clock) = match walltime.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().map_err(|_| invalid())?, clock),
        None => (0, walltime),
    };
    let fields: Vec<u64> = clock
        .split(':')
        .map(|field| field.parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<_, _>>()?;

    match fields.as_slice() {
        [hours, minutes, seconds] if *minutes < 60 && *seconds < 60 => {
            Ok(((days * 24 + hours) * 60 + minutes) * 60 + seconds)
        }
        _ => Err(invalid()),
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SolverConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

impl SolverConfig {
    /// shell words for the solver invocation
    pub fn command_line(&self) -> String {
        std::iter::once(paths::shell_quote(&self.exec.to_string_lossy()))
            .chain(self.params.iter().map(|param| paths::shell_quote(param)))
            .join(" ")
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    // consecutive failed status queries before a run is forced to Failed, null = unlimited
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: Option<u32>,
    // consecutive indeterminate polls before a run is forced to Failed, null = unlimited
    #[serde(default = "default_max_unknown_polls")]
    pub max_unknown_polls: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_poll_errors: default_max_poll_errors(),
            max_unknown_polls: default_max_unknown_polls(),
        }
    }
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_poll_errors: None,
            max_unknown_polls: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CaseConfig {
    pub name: String,
    // physics parameters, written verbatim into the run directory
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
    // parameters that must be present for input generation to succeed
    #[serde(default)]
    pub required: Vec<String>,
    // optional external input generator
    pub exec: Option<GeneratorConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // in milliseconds
    #[serde(default = "default_generator_timeout")]
    pub timeout: u64,
    // files relative to the run directory that must exist afterwards
    #[serde(default)]
    pub expected: Vec<PathBuf>,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn batch_dir(&self) -> PathBuf {
        self.batch.directory.join(paths::case_dir_name(&self.batch.name))
    }

    /// Check the whole config and report every problem instead of stopping at the first one.
    /// Returns true if an error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.cases.is_empty() {
            error!("No case was defined, unable to build a batch");
            contains_error = true;
        }

        for (dir, names) in self
            .cases
            .iter()
            .map(|case| (paths::case_dir_name(&case.name), case.name.as_str()))
            .into_group_map()
        {
            if names.len() > 1 {
                error!("Cases {} all map to the run directory '{dir}'", names.join(", "));
                contains_error = true;
            }
        }

        if let Err(error) = parse_walltime(&self.resources.walltime) {
            error!("resources.walltime: {error}");
            contains_error = true;
        }

        if self.resources.tasks == Some(0) {
            error!("resources.tasks cannot be 0");
            contains_error = true;
        }

        if self.resources.cpus_per_task == 0 {
            error!("resources.cpus_per_task cannot be 0");
            contains_error = true;
        }

        if let BackendConfig::Slurm(slurm) = &self.backend {
            if slurm.cores_per_node == 0 {
                error!("backend.cores_per_node cannot be 0");
                contains_error = true;
            }
        }

        if !self.batch.directory.is_absolute() {
            warn!(
                "batch.directory {} is relative, it will be resolved against the current directory",
                self.batch.directory.display()
            );
        }

        // the solver may only exist on compute nodes, so this is not fatal
        match check_executable(&self.solver.exec) {
            Ok(true) => {}
            Ok(false) => warn!(
                "Solver {} is not executable, runs will likely fail",
                self.solver.exec.display()
            ),
            Err(e) => warn!("Failed to check solver.exec ({}): {e}", self.solver.exec.display()),
        }

        for case in self.cases.iter() {
            // missing parameters fail the single run during prepare, not the batch
            for required in case.required.iter() {
                if !case.parameters.contains_key(required) {
                    warn!(
                        "Case '{}' is missing required parameter '{required}', its input generation will fail",
                        case.name
                    );
                }
            }

            if let Some(generator) = &case.exec {
                match check_executable(&generator.path) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "Input generator {} of case '{}' is not executable",
                            generator.path.display(),
                            case.name
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!("Failed to find input generator of case '{}': {e}", case.name);
                        contains_error = true;
                    }
                }
            }
        }

        contains_error
    }
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

fn default_cores_per_node() -> u32 {
    24
}

fn default_sbatch() -> CommandLine {
    CommandLine(vec![String::from("sbatch")])
}

fn default_squeue() -> CommandLine {
    CommandLine(vec![String::from("squeue")])
}

fn default_scancel() -> CommandLine {
    CommandLine(vec![String::from("scancel")])
}

fn default_launcher() -> String {
    String::from("srun")
}

fn default_command_timeout() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_cpus_per_task() -> u32 {
    2
}

fn default_walltime() -> String {
    String::from("01:00:00")
}

fn default_max_poll_errors() -> Option<u32> {
    Some(5)
}

fn default_max_unknown_polls() -> Option<u32> {
    Some(20)
}

fn default_generator_timeout() -> u64 {
    2000
}
