//! cellbox — a Linux process sandbox for hostile, short-lived workloads.
//!
//! One launch clones a child into fresh kernel namespaces, pivots its
//! root, installs rlimits, drops capabilities, arms a seccomp-BPF
//! program, and execs the target — with parent and child walking a
//! strict rendezvous protocol over a SEQPACKET socket pair so every
//! setup failure surfaces as a precise, structured error. A supervisor
//! then owns the process tree until it produces a [`RunResult`]:
//!
//! - [`unshare::UnshareRunner`] — pure namespace/seccomp confinement
//!   with a wait loop enforcing time/memory ceilings;
//! - [`ptrace::PtraceRunner`] — additionally intercepts
//!   filesystem-touching syscalls via `SECCOMP_RET_TRACE` and resolves
//!   them against a hierarchical path policy.
//!
//! ```ignore
//! use cellbox::{unshare::UnshareRunner, CancelToken, Limit, Runner, Size};
//! use std::time::Duration;
//!
//! let mut runner = UnshareRunner {
//!     args: vec!["/bin/echo".into(), "hello".into()],
//!     env: vec!["PATH=/bin:/usr/bin".into()],
//!     files: vec![0, 1, 2],
//!     root: "/tmp/sandbox-root".into(),
//!     mounts: cellbox::mount::Builder::default_rootfs()
//!         .filter_not_exist()
//!         .build()?,
//!     limit: Limit { time: Duration::from_secs(1), memory: Size(64 << 20) },
//!     ..UnshareRunner::default()
//! };
//! let result = runner.run(&CancelToken::new());
//! assert_eq!(result.status, cellbox::Status::Normal);
//! ```
//!
//! The launch-time pieces — [`launcher::Launcher`], [`mount::Builder`],
//! [`rlimit::RLimits`], the seccomp [`FilterBuilder`] — are exposed for
//! embedders composing their own supervision.
//!
//! [`FilterBuilder`]: cellbox_sys::seccomp::FilterBuilder

pub mod cancel;
pub mod cgroup;
pub mod launcher;
pub mod limit;
pub mod mount;
pub mod path;
pub mod policy;
pub mod ptrace;
pub mod result;
pub mod rlimit;
pub mod size;
pub mod status;
pub mod syscalls;
pub mod unshare;
mod wait;

pub use cancel::CancelToken;
pub use limit::Limit;
pub use result::RunResult;
pub use size::Size;
pub use status::Status;

/// A configured sandbox execution: one call, one child tree, one
/// verdict.
pub trait Runner {
    fn run(&mut self, token: &CancelToken) -> RunResult;
}
