use super::{InputError, InputPackage, ParameterPackage};
use crate::{config::GeneratorConfig, process};
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error};

/// Input package that writes the parameter record and then hands the run
/// directory to an external generator, e.g. the binary input writer.
#[derive(Debug, Clone)]
pub struct ExecPackage {
    parameters: ParameterPackage,
    generator: PathBuf,
    params: Vec<String>,
    timeout: Duration,
    expected: Vec<PathBuf>,
}

impl ExecPackage {
    pub fn load(parameters: ParameterPackage, config: &GeneratorConfig) -> Self {
        Self {
            parameters,
            generator: config.path.clone(),
            params: config.params.clone(),
            timeout: Duration::from_millis(config.timeout),
            expected: config.expected.clone(),
        }
    }
}

impl InputPackage for ExecPackage {
    #[tracing::instrument(skip(self), level = "debug")]
    fn materialize(&self, target: &Path) -> Result<(), InputError> {
        self.parameters.materialize(target)?;

        let handle = Command::new(&self.generator)
            .args(&self.params)
            .arg(target)
            .current_dir(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                InputError::Spawn(format!("{}: {error}", self.generator.display()))
            })?;

        debug!("Input generator waiting on {}", handle.id());

        let output = match process::wait_with_timeout(handle, self.timeout)? {
            Some(output) => output,
            None => {
                debug!("Input generator ran into timeout");

                return Err(InputError::Timeout(self.timeout));
            }
        };

        debug!("Output from input generator: {}", output.stdout.trim());

        if !output.status.success() {
            error!(status = ?output.status, stderr = output.stderr.trim(), "Input generator failed");

            return Err(InputError::GeneratorFailed {
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    fn is_complete(&self, target: &Path) -> bool {
        self.parameters.is_complete(target)
            && self.expected.iter().all(|file| target.join(file).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, fs};

    fn package(path: &str, params: &[&str], timeout: u64, expected: &[&str]) -> ExecPackage {
        ExecPackage::load(
            ParameterPackage::new("gen", BTreeMap::new(), Vec::new()),
            &GeneratorConfig {
                path: PathBuf::from(path),
                params: params.iter().map(|param| param.to_string()).collect(),
                timeout,
                expected: expected.iter().map(PathBuf::from).collect(),
            },
        )
    }

    #[test]
    fn generator_writes_expected_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("input")).unwrap();
        // `sh -c script name target`: the target directory lands in $1
        let package = package(
            "sh",
            &["-c", "printf x > \"$1/input/R0.bin\"", "generator"],
            10_000,
            &["input/R0.bin"],
        );

        assert!(!package.is_complete(tmp.path()));
        package.materialize(tmp.path()).unwrap();
        assert!(package.is_complete(tmp.path()));
        assert_eq!(fs::read_to_string(tmp.path().join("input/R0.bin")).unwrap(), "x");
    }

    #[test]
    fn failing_generator_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let package = package("sh", &["-c", "echo broken >&2; exit 2"], 10_000, &[]);

        match package.materialize(tmp.path()) {
            Err(InputError::GeneratorFailed { stderr, .. }) => assert_eq!(stderr, "broken"),
            other => panic!("expected generator failure, got {other:?}"),
        }
    }

    #[test]
    fn slow_generator_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let package = package("sh", &["-c", "sleep 10", "generator"], 100, &[]);

        assert!(matches!(
            package.materialize(tmp.path()),
            Err(InputError::Timeout(_))
        ));
    }

    #[test]
    fn chatty_generator_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let package = package(
            "sh",
            &["-c", "head -c 200000 /dev/zero | tr '\\0' x; exit 0", "generator"],
            10_000,
            &[],
        );

        package.materialize(tmp.path()).unwrap();
    }

    #[test]
    fn missing_generator_fails_to_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let package = package("/nonexistent/generator", &[], 1000, &[]);

        assert!(matches!(
            package.materialize(tmp.path()),
            Err(InputError::Spawn(_))
        ));
    }
}
