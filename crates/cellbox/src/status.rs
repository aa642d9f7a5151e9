//! Verdict status for a supervised run.

use std::fmt;

/// Final classification of a sandboxed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// Zero value, result not produced yet.
    #[default]
    Invalid,
    /// Exited with status 0 inside all limits.
    Normal,

    // resource violations
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,

    /// A syscall was denied by the seccomp filter or the path policy.
    DisallowedSyscall,

    // program outcomes
    Signalled,
    NonzeroExit,

    /// The sandbox itself failed (setup, wait, cancellation).
    RunnerError,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Invalid => "invalid",
            Status::Normal => "normal",
            Status::TimeLimitExceeded => "time limit exceeded",
            Status::MemoryLimitExceeded => "memory limit exceeded",
            Status::OutputLimitExceeded => "output limit exceeded",
            Status::DisallowedSyscall => "disallowed syscall",
            Status::Signalled => "signalled",
            Status::NonzeroExit => "nonzero exit status",
            Status::RunnerError => "runner error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid() {
        assert_eq!(Status::default(), Status::Invalid);
    }

    #[test]
    fn display() {
        assert_eq!(Status::DisallowedSyscall.to_string(), "disallowed syscall");
        assert_eq!(Status::Normal.to_string(), "normal");
    }
}
