//! Per-syscall permit counters.

use std::collections::HashMap;

/// Maps syscall names to remaining permits. Unknown names are the
/// caller's decision; known names allow while permits remain.
#[derive(Debug, Clone, Default)]
pub struct SyscallCounter {
    counts: HashMap<String, i64>,
}

impl SyscallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, count: i64) {
        self.counts.insert(name.into(), count);
    }

    pub fn add_range(&mut self, entries: impl IntoIterator<Item = (String, i64)>) {
        self.counts.extend(entries);
    }

    /// Returns `(known, allow)`: an unknown name is `(false, true)` (the
    /// caller picks the default); a known name with permits left
    /// decrements and allows; an exhausted one denies.
    pub fn check(&mut self, name: &str) -> (bool, bool) {
        match self.counts.get_mut(name) {
            None => (false, true),
            Some(n) if *n > 0 => {
                *n -= 1;
                (true, true)
            }
            Some(_) => (true, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_callers_call() {
        let mut c = SyscallCounter::new();
        assert_eq!(c.check("reboot"), (false, true));
    }

    #[test]
    fn n_permits_allow_exactly_n_calls() {
        let mut c = SyscallCounter::new();
        c.add("fork", 3);
        for _ in 0..3 {
            assert_eq!(c.check("fork"), (true, true));
        }
        assert_eq!(c.check("fork"), (true, false));
        assert_eq!(c.check("fork"), (true, false));
    }

    #[test]
    fn zero_permits_deny_immediately() {
        let mut c = SyscallCounter::new();
        c.add("clone", 0);
        assert_eq!(c.check("clone"), (true, false));
    }
}
