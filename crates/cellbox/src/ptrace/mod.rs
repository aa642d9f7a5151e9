//! Ptrace runner: namespace-less launch with a seccomp trace filter and
//! a supervisor that resolves every trapped syscall against a path
//! policy.
//!
//! The kernel keeps ptrace state per tracer *thread*; the whole session
//! — clone, attach, event loop — therefore runs on the thread that calls
//! [`PtraceRunner::run`], and that call blocks until the verdict.

mod context;
mod handler;
mod tracer;

use std::os::fd::RawFd;

use nix::unistd::geteuid;

pub use context::TrapContext;
pub use handler::PolicyDispatcher;
pub use tracer::Tracer;

use cellbox_sys::seccomp::Filter;

use crate::cancel::CancelToken;
use crate::launcher::{Launcher, SyncFunc};
use crate::limit::Limit;
use crate::policy::AccessPolicy;
use crate::result::RunResult;
use crate::rlimit::RLimit;

/// Errno delivered to the tracee for a soft-banned syscall.
pub const BAN_ERRNO: i32 = libc::EACCES;

/// What the tracer does with a trapped syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceVerdict {
    /// Let it run.
    Allow,
    /// Suppress it: the syscall number is overwritten so the kernel
    /// executes nothing, and the return register reads `-BAN_ERRNO`.
    Ban,
    /// Kill the tree; the payload names the offending path or syscall
    /// and ends up in the result's error text.
    Kill(String),
}

/// Decides trapped syscalls. [`PolicyDispatcher`] is the path-policy
/// implementation; tests substitute their own.
pub trait TraceHandler {
    fn handle(&mut self, ctx: &mut TrapContext) -> TraceVerdict;
}

/// Runs one program under ptrace supervision with a path policy.
pub struct PtraceRunner<P: AccessPolicy> {
    pub args: Vec<String>,
    pub env: Vec<String>,

    pub exec_fd: Option<RawFd>,
    pub files: Vec<RawFd>,

    pub work_dir: String,

    pub rlimits: Vec<RLimit>,
    pub limit: Limit,

    /// The filter must mark filesystem syscalls `Trace` and the safe
    /// majority `Allow`; its default action handles the rest.
    pub seccomp: Filter,

    /// Path/counter policy consulted for every trapped syscall.
    pub policy: P,
    /// Downgrade the default-branch kill to a soft ban (forward-compat
    /// probing of unknown syscalls).
    pub permissive: bool,

    pub sync_func: Option<SyncFunc>,
}

impl<P: AccessPolicy> PtraceRunner<P> {
    /// Launches and supervises to completion on the calling thread.
    pub fn run(&mut self, token: &CancelToken) -> RunResult {
        let launcher = Launcher {
            args: self.args.clone(),
            env: self.env.clone(),
            exec_fd: self.exec_fd,
            rlimits: self.rlimits.clone(),
            files: self.files.clone(),
            work_dir: self.work_dir.clone(),
            seccomp: Some(self.seccomp.clone()),
            ptrace: true,
            // Root keeps its own cgroup view until the sync hook has
            // filed the child, then the child unshares it.
            unshare_cgroup_after_sync: geteuid().is_root(),
            sync_func: self.sync_func.take(),
            ..Launcher::default()
        };

        let dispatcher = PolicyDispatcher::new(&mut self.policy, self.permissive);
        let mut tracer = Tracer::new(dispatcher, self.limit);
        tracer.trace(launcher, token)
    }
}

impl<P: AccessPolicy> crate::Runner for PtraceRunner<P> {
    fn run(&mut self, token: &CancelToken) -> RunResult {
        PtraceRunner::run(self, token)
    }
}
