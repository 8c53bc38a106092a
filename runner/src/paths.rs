use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// file holding the solver's exit code, written by the wrapper script
pub const EXIT_CODE: &str = "EXIT_CODE";
/// sentinel touched by the wrapper script once the solver returned
pub const DONE_MARKER: &str = "DONE_MARKER";
/// persisted run record, see `run::RunRecord`
pub const RUN_RECORD: &str = "run.yaml";
/// persisted batch metadata, see `batch::BatchInfo`
pub const BATCH_INFO: &str = "batchinfo.yaml";

pub const STDOUT: &str = "stdout.txt";
pub const STDERR: &str = "stderr.txt";

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const PRIMITIVE_DIR: &str = "output/primitive";
pub const DEBUG_DIR: &str = "debug";

/// Turn a case name into a directory name that is stable across invocations.
///
/// Anything outside of `[A-Za-z0-9._-]` is replaced by `_`, leading dots are
/// stripped so a case can never produce a hidden or relative directory.
pub fn case_dir_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');

    if sanitized.is_empty() {
        String::from("_")
    } else {
        sanitized.to_string()
    }
}

/// Create `path` (and its parents) as a directory.
///
/// Fails with `AlreadyExists` if something other than a directory is in the way.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => {
            // symlinks to directories are fine, anything else is a conflict
            if path.is_dir() {
                Ok(())
            } else {
                Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", path.display()),
                ))
            }
        }
        Err(error) if error.kind() == ErrorKind::NotFound => fs::create_dir_all(path),
        Err(error) => Err(error),
    }
}

/// Write `contents` to `path` unless the file already holds exactly these bytes.
/// Returns whether the file was written.
pub fn write_if_changed(path: &Path, contents: &[u8]) -> io::Result<bool> {
    match fs::read(path) {
        Ok(existing) if existing == contents => {
            debug!(path = ?path, "Contents unchanged, skipping write");

            Ok(false)
        }
        Ok(_) => fs::write(path, contents).map(|_| true),
        Err(error) if error.kind() == ErrorKind::NotFound => fs::write(path, contents).map(|_| true),
        Err(error) => Err(error),
    }
}

/// Completion state as recorded by the wrapper script in a working directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// no `DONE_MARKER` yet
    Pending,
    /// `DONE_MARKER` present together with a parsable `EXIT_CODE`
    Exited(i32),
    /// `DONE_MARKER` present but `EXIT_CODE` missing or garbled
    Unreadable,
}

pub fn read_completion(work_dir: &Path) -> Completion {
    if !work_dir.join(DONE_MARKER).exists() {
        return Completion::Pending;
    }

    match fs::read_to_string(work_dir.join(EXIT_CODE)) {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(code) => Completion::Exited(code),
            Err(error) => {
                warn!(work_dir = ?work_dir, content = content.trim(), "Failed to parse exit code: {error}");

                Completion::Unreadable
            }
        },
        Err(error) => {
            warn!(work_dir = ?work_dir, "Completion marker without exit code: {error}");

            Completion::Unreadable
        }
    }
}

/// Quote a string for use as a single POSIX shell word.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ','))
    {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Remove all files ending in `suffix` directly inside `dir`, ignoring a missing `dir`.
pub fn clean_suffix(dir: &Path, suffix: &str) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };
    let mut removed = 0;

    for entry in entries {
        let path = entry?.path();

        if path.is_file() && path.to_string_lossy().ends_with(suffix) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Remove a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
