//! Cancellation for supervised runs.
//!
//! A supervisor owns a child process tree until it is reaped; callers that
//! want to abort early (deadline in an outer service, shutdown) hold a
//! clone of the token. `cancel()` flips the flag and best-effort SIGKILLs
//! the armed process group from the cancelling thread; the supervisor's
//! wait loop observes the kill, drains the tree and reports `RunnerError`
//! unless a terminal status was already computed.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    pgid: AtomicI32,
}

/// Cloneable cancellation handle shared between a supervisor and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread, any number of
    /// times. If a process group has been armed, it is SIGKILLed.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let pgid = self.0.pgid.load(Ordering::SeqCst);
        if pgid > 0 {
            let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Called by the supervisor once the child group exists. If the token
    /// was cancelled before arming, the group is killed immediately.
    pub(crate) fn arm(&self, pgid: i32) {
        self.0.pgid.store(pgid, Ordering::SeqCst);
        if self.is_cancelled() {
            let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_sticky_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
