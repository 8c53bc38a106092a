pub mod exec;

use crate::{config::CaseConfig, paths};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::debug;

/// file the parameter record is written to, relative to the run directory
pub const PARAMETERS: &str = "parameters.yaml";

#[derive(Debug, Error, Clone)]
pub enum InputError {
    #[error("Missing required parameter '{0}'")]
    MissingParameter(String),
    #[error("Failed to serialize parameters: {0}")]
    Serialize(String),
    #[error("IO error while writing input: {0}")]
    Io(String),
    #[error("Failed to spawn input generator: {0}")]
    Spawn(String),
    #[error("Input generator timed out after {0:?}")]
    Timeout(Duration),
    #[error("Input generator exited with {status}: {stderr}")]
    GeneratorFailed { status: String, stderr: String },
    #[error("Input incomplete, {0} is missing")]
    Incomplete(PathBuf),
}

impl From<std::io::Error> for InputError {
    fn from(error: std::io::Error) -> Self {
        InputError::Io(error.to_string())
    }
}

/// Producer of a run's input files
pub trait InputPackage {
    /// write all input artifacts into `target`
    fn materialize(&self, target: &Path) -> Result<(), InputError>;

    /// check that a previous `materialize` left everything the solver needs
    fn is_complete(&self, target: &Path) -> bool;
}

/// Record written to `parameters.yaml`
#[derive(Debug, Serialize)]
struct ParameterRecord<'a> {
    case: &'a str,
    parameters: &'a BTreeMap<String, serde_yaml::Value>,
}

/// Writes the case parameters as a structured record.
/// Serialization is deterministic (sorted keys), so unchanged parameters
/// leave the file untouched.
#[derive(Debug, Clone)]
pub struct ParameterPackage {
    case: String,
    parameters: BTreeMap<String, serde_yaml::Value>,
    required: Vec<String>,
}

impl ParameterPackage {
    pub fn new(
        case: impl Into<String>,
        parameters: BTreeMap<String, serde_yaml::Value>,
        required: Vec<String>,
    ) -> Self {
        Self {
            case: case.into(),
            parameters,
            required,
        }
    }

    pub fn parameters(&self) -> &BTreeMap<String, serde_yaml::Value> {
        &self.parameters
    }
}

impl InputPackage for ParameterPackage {
    fn materialize(&self, target: &Path) -> Result<(), InputError> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|name| !self.parameters.contains_key(*name))
        {
            return Err(InputError::MissingParameter(missing.clone()));
        }

        let record = serde_yaml::to_string(&ParameterRecord {
            case: &self.case,
            parameters: &self.parameters,
        })
        .map_err(|error| InputError::Serialize(error.to_string()))?;

        if paths::write_if_changed(&target.join(PARAMETERS), record.as_bytes())? {
            debug!(case = %self.case, "Wrote parameters");
        }

        Ok(())
    }

    fn is_complete(&self, target: &Path) -> bool {
        target.join(PARAMETERS).is_file()
    }
}

#[derive(Debug, Clone)]
pub enum Packages {
    Parameters(ParameterPackage),
    Exec(exec::ExecPackage),
}

impl Packages {
    pub fn load(case: &CaseConfig) -> Self {
        let parameters =
            ParameterPackage::new(&case.name, case.parameters.clone(), case.required.clone());

        match &case.exec {
            Some(generator) => Self::Exec(exec::ExecPackage::load(parameters, generator)),
            None => Self::Parameters(parameters),
        }
    }
}

impl InputPackage for Packages {
    fn materialize(&self, target: &Path) -> Result<(), InputError> {
        match self {
            Self::Parameters(package) => package.materialize(target),
            Self::Exec(package) => package.materialize(target),
        }
    }

    fn is_complete(&self, target: &Path) -> bool {
        match self {
            Self::Parameters(package) => package.is_complete(target),
            Self::Exec(package) => package.is_complete(target),
        }
    }
}
