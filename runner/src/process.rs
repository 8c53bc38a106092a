use std::{
    io::{self, Read},
    process::{Child, ExitStatus},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::warn;
use wait_timeout::ChildExt;

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_string(&mut buffer)?;
        }

        Ok(buffer)
    })
}

fn collect(reader: JoinHandle<io::Result<String>>) -> io::Result<String> {
    reader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe reader panicked"))?
}

/// Wait for `child` while draining its piped stdout and stderr, so a chatty
/// process never blocks on a full pipe. Returns `None` after killing it on timeout.
pub fn wait_with_timeout(mut child: Child, timeout: Duration) -> io::Result<Option<CommandOutput>> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child.wait_timeout(timeout)? {
        Some(status) => status,
        None => {
            if let Err(error) = child.kill() {
                warn!(pid = child.id(), "Failed to kill timed out process: {error}");
            }
            // reap, the status is irrelevant at this point
            let _ = child.wait();

            // grandchildren may still hold the pipes open, the readers are left detached
            return Ok(None);
        }
    };

    Ok(Some(CommandOutput {
        status,
        stdout: collect(stdout)?,
        stderr: collect(stderr)?,
    }))
}
