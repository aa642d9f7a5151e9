//! The result record produced exactly once per launch.

use std::fmt;
use std::time::Duration;

use crate::size::Size;
use crate::status::Status;

/// Outcome of one supervised run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub status: Status,
    /// Exit status, or the terminating signal number for `Signalled`.
    pub exit_status: i32,
    /// Detail for `RunnerError` and `DisallowedSyscall` (the failing
    /// location, path or syscall name).
    pub error: Option<String>,

    /// User CPU time consumed.
    pub time: Duration,
    /// Max resident set observed.
    pub memory: Size,

    /// Time from launch start until the child tree was up.
    pub set_up_time: Duration,
    /// Time from there until the verdict.
    pub running_time: Duration,
}

impl RunResult {
    /// A `RunnerError` result carrying the error text.
    pub fn runner_error(err: impl fmt::Display) -> Self {
        Self {
            status: Status::RunnerError,
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Status::Normal => write!(
                f,
                "Result[{:?} {}][{:?} {:?}]",
                self.time, self.memory, self.set_up_time, self.running_time
            ),
            Status::Signalled => write!(
                f,
                "Result[Signalled({})][{:?} {}][{:?} {:?}]",
                self.exit_status, self.time, self.memory, self.set_up_time, self.running_time
            ),
            Status::RunnerError => write!(
                f,
                "Result[RunnerFailed({})][{:?} {}][{:?} {:?}]",
                self.error.as_deref().unwrap_or(""),
                self.time,
                self.memory,
                self.set_up_time,
                self.running_time
            ),
            status => write!(
                f,
                "Result[{status}({} {})][{:?} {}][{:?} {:?}]",
                self.error.as_deref().unwrap_or(""),
                self.exit_status,
                self.time,
                self.memory,
                self.set_up_time,
                self.running_time
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_error_carries_text() {
        let r = RunResult::runner_error("clone: operation not permitted");
        assert_eq!(r.status, Status::RunnerError);
        assert_eq!(r.error.as_deref(), Some("clone: operation not permitted"));
        assert_eq!(r.exit_status, 0);
    }

    #[test]
    fn display_mentions_status() {
        let r = RunResult {
            status: Status::TimeLimitExceeded,
            time: Duration::from_millis(250),
            ..RunResult::default()
        };
        assert!(r.to_string().contains("time limit exceeded"));
    }
}
