//! Namespace/seccomp runner.
//!
//! Launches the program in fresh mount/pid/user/uts/cgroup namespaces
//! with a pivoted root and an optional kill-mode seccomp filter, then
//! supervises it with a plain wait loop: rusage-based time/memory
//! ceilings, signal classification, and a full tree kill + reap on the
//! way out. No tracing is involved; a policy violation surfaces as the
//! SIGSYS the filter delivers.

use std::os::fd::RawFd;
use std::time::Instant;

use tracing::debug;

use cellbox_sys::seccomp::Filter;

use crate::cancel::CancelToken;
use crate::launcher::{Launcher, SyncFunc};
use crate::limit::Limit;
use crate::mount::MountCall;
use crate::result::RunResult;
use crate::rlimit::RLimit;
use crate::size::Size;
use crate::status::Status;
use crate::wait;

/// Namespaces the runner unshares by default: mount, pid, user, uts,
/// cgroup. Network and IPC are left shared; isolate them via
/// `clone_flags` when the workload must not reach either.
pub const UNSHARE_FLAGS: libc::c_ulong = (libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWUSER
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWCGROUP) as libc::c_ulong;

/// Runs one program in unshared namespaces and produces its verdict.
#[derive(Default)]
pub struct UnshareRunner {
    /// argv for the child; `args[0]` is the program path.
    pub args: Vec<String>,
    pub env: Vec<String>,

    /// Exec by descriptor instead of `args[0]`.
    pub exec_fd: Option<RawFd>,
    /// Host fds becoming child fds `0..n-1`.
    pub files: Vec<RawFd>,

    /// Working directory after the mount namespace is set up.
    pub work_dir: String,

    /// Kernel-enforced limits installed by the child.
    pub rlimits: Vec<RLimit>,
    /// Supervisor-enforced ceilings checked against rusage.
    pub limit: Limit,

    /// Kill-mode filter; allow-list only, no trace actions.
    pub seccomp: Option<Filter>,

    /// New root directory (tmpfs over it, mounts inside, pivot_root).
    pub root: String,
    pub mounts: Vec<MountCall>,

    pub host_name: String,
    pub domain_name: String,

    /// Namespace set to unshare; [`UNSHARE_FLAGS`] when zero.
    pub clone_flags: libc::c_ulong,

    /// Cgroup-admission hook, run against the pid pre-exec.
    pub sync_func: Option<SyncFunc>,
}

impl UnshareRunner {
    /// Launches and supervises to completion. Consumes the runner's
    /// one-shot state (`sync_func`); a runner drives a single launch.
    pub fn run(&mut self, token: &CancelToken) -> RunResult {
        let mut launcher = Launcher {
            args: self.args.clone(),
            env: self.env.clone(),
            exec_fd: self.exec_fd,
            rlimits: self.rlimits.clone(),
            files: self.files.clone(),
            work_dir: self.work_dir.clone(),
            seccomp: self.seccomp.clone(),
            no_new_privs: true,
            clone_flags: if self.clone_flags == 0 {
                UNSHARE_FLAGS
            } else {
                self.clone_flags
            },
            mounts: self.mounts.clone(),
            host_name: self.host_name.clone(),
            domain_name: self.domain_name.clone(),
            pivot_root: self.root.clone(),
            drop_caps: true,
            unshare_cgroup_after_sync: true,
            sync_func: self.sync_func.take(),
            ..Launcher::default()
        };

        let s_time = Instant::now();
        let pgid = match launcher.start() {
            Ok(pgid) => pgid,
            Err(err) => {
                debug!(%err, "launch failed");
                return RunResult::runner_error(err);
            }
        };
        debug!(pgid, "sandbox started");
        token.arm(pgid);
        let f_time = Instant::now();

        let mut result = self.wait_loop(pgid, token);

        wait::kill_all(pgid);
        wait::collect_zombies(pgid);
        result.set_up_time = f_time.duration_since(s_time);
        result.running_time = f_time.elapsed();
        result
    }

    fn wait_loop(&self, pgid: i32, token: &CancelToken) -> RunResult {
        let mut result = RunResult::default();
        loop {
            let ev = match wait::wait4(pgid, 0) {
                Ok(ev) => ev,
                Err(err) => {
                    if token.is_cancelled() {
                        return RunResult::runner_error("cancelled");
                    }
                    return RunResult::runner_error(format!("wait4: {err}"));
                }
            };
            debug!(status = ev.status, "wait4");

            result.time = wait::user_time(&ev.rusage);
            result.memory = Size(wait::max_rss_bytes(&ev.rusage));

            // The cancel kill would otherwise read as a time limit.
            if token.is_cancelled() {
                result.status = Status::RunnerError;
                result.error = Some("cancelled".into());
                return result;
            }

            let mut status = Status::Normal;
            if result.time > self.limit.time {
                status = Status::TimeLimitExceeded;
            }
            if result.memory > self.limit.memory {
                status = Status::MemoryLimitExceeded;
            }
            if status != Status::Normal {
                result.status = status;
                return result;
            }

            if libc::WIFEXITED(ev.status) {
                let code = libc::WEXITSTATUS(ev.status);
                result.exit_status = code;
                result.status = if code == 0 {
                    Status::Normal
                } else {
                    Status::NonzeroExit
                };
                return result;
            }

            if libc::WIFSIGNALED(ev.status) {
                let sig = libc::WTERMSIG(ev.status);
                result.status = match sig {
                    libc::SIGXCPU | libc::SIGKILL => Status::TimeLimitExceeded,
                    libc::SIGXFSZ => Status::OutputLimitExceeded,
                    libc::SIGSYS => Status::DisallowedSyscall,
                    _ => Status::Signalled,
                };
                result.exit_status = sig;
                return result;
            }
        }
    }
}

impl crate::Runner for UnshareRunner {
    fn run(&mut self, token: &CancelToken) -> RunResult {
        UnshareRunner::run(self, token)
    }
}
