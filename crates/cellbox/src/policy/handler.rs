//! Aggregated access decisions.
//!
//! [`PolicyHandler`] combines the file sets and the syscall counter into
//! the `AccessPolicy` the ptrace dispatcher consults. A denied path falls
//! through to the soft-ban set: listed there it is banned (the syscall
//! fails with an errno), otherwise the program is killed.

use super::counter::SyscallCounter;
use super::fileset::FileSets;

/// What to do with a trapped access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Let the syscall run.
    Allow,
    /// Skip the syscall and fail it with an errno.
    Ban,
    /// Terminate the program tree.
    Kill,
}

/// Decisions the ptrace dispatcher needs from a policy.
pub trait AccessPolicy {
    /// May the program read `path`?
    fn check_read(&mut self, path: &str) -> PolicyAction;
    /// May the program write `path`?
    fn check_write(&mut self, path: &str) -> PolicyAction;
    /// May the program stat `path`?
    fn check_stat(&mut self, path: &str) -> PolicyAction;
    /// Verdict for a trapped syscall that is not path-based.
    fn check_syscall(&mut self, name: &str) -> PolicyAction;
}

impl<P: AccessPolicy + ?Sized> AccessPolicy for &mut P {
    fn check_read(&mut self, path: &str) -> PolicyAction {
        (**self).check_read(path)
    }

    fn check_write(&mut self, path: &str) -> PolicyAction {
        (**self).check_write(path)
    }

    fn check_stat(&mut self, path: &str) -> PolicyAction {
        (**self).check_stat(path)
    }

    fn check_syscall(&mut self, name: &str) -> PolicyAction {
        (**self).check_syscall(name)
    }
}

/// File-set + counter backed policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyHandler {
    pub file_sets: FileSets,
    pub counter: SyscallCounter,
}

impl PolicyHandler {
    pub fn new(file_sets: FileSets, counter: SyscallCounter) -> Self {
        Self { file_sets, counter }
    }

    fn on_denied_file(&self, path: &str) -> PolicyAction {
        if self.file_sets.is_soft_banned(path) {
            PolicyAction::Ban
        } else {
            PolicyAction::Kill
        }
    }
}

impl AccessPolicy for PolicyHandler {
    fn check_read(&mut self, path: &str) -> PolicyAction {
        if self.file_sets.is_readable(path) {
            PolicyAction::Allow
        } else {
            self.on_denied_file(path)
        }
    }

    fn check_write(&mut self, path: &str) -> PolicyAction {
        if self.file_sets.is_writable(path) {
            PolicyAction::Allow
        } else {
            self.on_denied_file(path)
        }
    }

    fn check_stat(&mut self, path: &str) -> PolicyAction {
        if self.file_sets.is_statable(path) {
            PolicyAction::Allow
        } else {
            self.on_denied_file(path)
        }
    }

    fn check_syscall(&mut self, name: &str) -> PolicyAction {
        match self.counter.check(name) {
            (true, true) => PolicyAction::Allow,
            (true, false) => PolicyAction::Kill,
            // Not on the counter at all: soft-deny by default.
            (false, _) => PolicyAction::Ban,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FilePerm;

    fn handler() -> PolicyHandler {
        let mut sets = FileSets::new();
        sets.add("/etc/passwd", FilePerm::Read);
        sets.add("/work/", FilePerm::Write);
        sets.add("/proc/", FilePerm::Stat);
        sets.soft_ban.add("/dev/");
        let mut counter = SyscallCounter::new();
        counter.add("fork", 1);
        PolicyHandler::new(sets, counter)
    }

    #[test]
    fn read_grant_does_not_allow_write() {
        let mut h = handler();
        assert_eq!(h.check_read("/etc/passwd"), PolicyAction::Allow);
        assert_eq!(h.check_write("/etc/passwd"), PolicyAction::Kill);
    }

    #[test]
    fn denied_but_soft_banned_is_ban() {
        let mut h = handler();
        assert_eq!(h.check_write("/dev/sda"), PolicyAction::Ban);
        assert_eq!(h.check_read("/dev/mem"), PolicyAction::Ban);
    }

    #[test]
    fn denied_elsewhere_is_kill() {
        let mut h = handler();
        assert_eq!(h.check_read("/etc/shadow"), PolicyAction::Kill);
        assert_eq!(h.check_stat("/root/secret"), PolicyAction::Kill);
    }

    #[test]
    fn counter_allows_then_kills() {
        let mut h = handler();
        assert_eq!(h.check_syscall("fork"), PolicyAction::Allow);
        assert_eq!(h.check_syscall("fork"), PolicyAction::Kill);
    }

    #[test]
    fn uncounted_syscall_is_soft_denied() {
        let mut h = handler();
        assert_eq!(h.check_syscall("reboot"), PolicyAction::Ban);
    }
}
