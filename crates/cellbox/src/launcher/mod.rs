//! Confined child launcher.
//!
//! [`Launcher`] describes one launch: what to exec, which namespaces to
//! unshare, the mounts, rlimits, credential and seccomp program to apply,
//! and how the parent and child rendezvous while setting all of that up.
//! [`Launcher::start`] clones the child, drives the sync protocol and
//! returns the pid (which is also the process group id, the child calls
//! `setsid`); a supervisor then owns the process tree until it is reaped.
//!
//! The child side runs between fork and exec and therefore cannot
//! allocate, lock or unwind; the `child` module documents the
//! constraints and [`report`] how errors leave that context.

mod child;
pub mod report;
mod start;

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

pub use report::{ChildError, ErrorReport, Location};

use crate::mount::MountCall;
use crate::rlimit::RLimit;
use cellbox_sys::seccomp::Filter;

/// Namespaces a launch may unshare via `clone_flags`.
pub const NAMESPACE_FLAGS: libc::c_ulong = (libc::CLONE_NEWIPC
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWUSER
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWCGROUP) as libc::c_ulong;

/// Identity the child assumes before exec (setgroups, setgid, setuid, in
/// that order).
#[derive(Debug, Clone, Default)]
pub struct Credential {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
    /// Skip the setgroups call even when `groups` is empty.
    pub no_set_groups: bool,
}

/// One line of a `/proc/<pid>/{uid,gid}_map` file.
#[derive(Debug, Clone, Copy)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Parent-side callback run between the child's setup and its release
/// (typically cgroup admission for the fresh pid).
pub type SyncFunc = Box<dyn FnMut(i32) -> io::Result<()> + Send>;

/// Everything `start()` needs to clone and confine one child.
///
/// Immutable after `start`. File descriptors in `files` and `exec_fd`
/// stay owned by the caller; the child receives duplicates.
#[derive(Default)]
pub struct Launcher {
    /// Program and arguments; `args[0]` is the path to exec (only
    /// informational when `exec_fd` is set).
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    pub env: Vec<String>,

    /// Exec this descriptor with `execveat(AT_EMPTY_PATH)` instead of
    /// `args[0]`.
    pub exec_fd: Option<RawFd>,
    /// Host fds that become child fds `0..n-1`; `-1` closes the slot.
    pub files: Vec<RawFd>,

    /// Working directory after mount setup; empty = keep.
    pub work_dir: String,
    /// UTS names, set best-effort after a UTS unshare; empty = skip.
    pub host_name: String,
    pub domain_name: String,
    /// Directory that becomes the new root (tmpfs is mounted over it,
    /// mounts apply inside, then `pivot_root`); empty = no pivot.
    pub pivot_root: String,

    pub rlimits: Vec<RLimit>,
    pub mounts: Vec<MountCall>,

    /// `CLONE_NEW*` namespace bits for the clone call.
    pub clone_flags: libc::c_ulong,

    /// User-namespace id maps; empty means the default `0 <euid> 1` /
    /// `0 <egid> 1`.
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
    /// Write `allow` rather than `deny` to `/proc/<pid>/setgroups`.
    pub gid_map_enable_setgroups: bool,

    pub credential: Option<Credential>,
    pub seccomp: Option<Filter>,

    /// Drop every capability before exec.
    pub drop_caps: bool,
    /// `PR_SET_NO_NEW_PRIVS`; forced on when `seccomp` is set.
    pub no_new_privs: bool,
    /// Arrange `PTRACE_TRACEME` so a tracer owns the child.
    pub ptrace: bool,
    /// SIGSTOP before installing seccomp so a tracer can attach
    /// deterministically; forced on when `ptrace && seccomp`.
    pub stop_before_seccomp: bool,
    /// Make fd 0 the controlling terminal.
    pub ctty: bool,
    /// Unshare the cgroup namespace only after `sync_func` ran (the sync
    /// hook usually moves the pid into a prepared cgroup first).
    pub unshare_cgroup_after_sync: bool,

    pub sync_func: Option<SyncFunc>,
}

/// Parent-side launch failure.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("empty argv")]
    EmptyArgs,

    #[error("argument contains NUL byte")]
    NulByte,

    #[error("{op}: {err}")]
    Os {
        op: &'static str,
        #[source]
        err: io::Error,
    },

    /// The child reported a failed setup step.
    #[error(transparent)]
    Child(#[from] ChildError),

    #[error("sync: {0}")]
    SyncFunc(io::Error),
}
