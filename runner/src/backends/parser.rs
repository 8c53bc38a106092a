/// job state as reported by `squeue --format=%T`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Configuring,
    Requeued,
    Running,
    Completing,
    Suspended,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    OutOfMemory,
    Preempted,
    BootFail,
    Deadline,
    /// any token not listed above
    Other(String),
}

impl SlurmState {
    /// trailing decorations such as `CANCELLED+` or `CANCELLED by 1000` are ignored
    pub fn from_token(token: &str) -> Self {
        let token = token
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches('+')
            .to_ascii_uppercase();

        match token.as_str() {
            "PENDING" | "PD" | "RESV_DEL_HOLD" | "REQUEUE_HOLD" => Self::Pending,
            "CONFIGURING" | "CF" => Self::Configuring,
            "REQUEUED" | "RQ" | "REQUEUE_FED" => Self::Requeued,
            "RUNNING" | "R" | "SIGNALING" | "STAGE_OUT" | "RESIZING" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "SUSPENDED" | "S" | "STOPPED" | "ST" => Self::Suspended,
            "COMPLETED" | "CD" => Self::Completed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "FAILED" | "F" => Self::Failed,
            "TIMEOUT" | "TO" => Self::Timeout,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            "PREEMPTED" | "PR" => Self::Preempted,
            "BOOT_FAIL" | "BF" => Self::BootFail,
            "DEADLINE" | "DL" => Self::Deadline,
            _ => Self::Other(token),
        }
    }

    /// waiting for resources, not started yet
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Configuring | Self::Requeued)
    }

    /// holds an allocation and has not finished
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Completing | Self::Suspended)
    }

    /// will not run any further
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Cancelled
                | Self::Failed
                | Self::Timeout
                | Self::NodeFail
                | Self::OutOfMemory
                | Self::Preempted
                | Self::BootFail
                | Self::Deadline
        )
    }
}

/// job id from `Submitted batch job 12345` or `--parsable` output (`12345`, `12345;cluster`)
pub fn parse_sbatch_output(output: &str) -> Option<String> {
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Submitted batch job ") {
            let id = rest.split_whitespace().next().unwrap_or("");

            if is_job_id(id) {
                return Some(id.to_string());
            }
        }

        let parsable = line.split(';').next().unwrap_or("");
        if is_job_id(parsable) {
            return Some(parsable.to_string());
        }
    }

    None
}

/// state of `job_id` in `squeue --noheader --format="%i %T"` output, `None` if not listed
pub fn parse_squeue_output(output: &str, job_id: &str) -> Option<SlurmState> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();

        match (fields.next(), fields.next()) {
            (Some(id), Some(state)) if id == job_id => Some(SlurmState::from_token(state)),
            _ => None,
        }
    })
}

/// squeue exits non-zero for ids it no longer knows about
pub fn is_invalid_job_id(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

fn is_job_id(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}
