//! Syscall → access-check dispatch.
//!
//! Maps each trapped syscall to the path argument it carries and the
//! access mode it implies, reads the path out of the tracee, normalizes
//! it, and asks the policy. Open calls derive read vs write from their
//! flag word; everything without a path goes through the syscall
//! counter.

use tracing::debug;

use super::context::TrapContext;
use super::{TraceHandler, TraceVerdict};
use crate::path::abs_path;
use crate::policy::{AccessPolicy, PolicyAction};
use crate::syscalls::syscall_name;

#[derive(Debug, Clone, Copy)]
enum Mode {
    Read,
    Write,
    Stat,
}

/// The path-policy [`TraceHandler`].
pub struct PolicyDispatcher<P> {
    policy: P,
    permissive: bool,
}

impl<P: AccessPolicy> PolicyDispatcher<P> {
    pub fn new(policy: P, permissive: bool) -> Self {
        Self { policy, permissive }
    }

    /// Tracee-relative absolute path at argument register `arg`.
    fn path_arg(&self, ctx: &TrapContext, arg: u64) -> String {
        abs_path(ctx.pid, &ctx.get_string(arg))
    }

    fn check_path(&mut self, ctx: &TrapContext, arg: u64, mode: Mode) -> (PolicyAction, String) {
        let path = self.path_arg(ctx, arg);
        debug!(?mode, path, "check path");
        let action = match mode {
            Mode::Read => self.policy.check_read(&path),
            Mode::Write => self.policy.check_write(&path),
            Mode::Stat => self.policy.check_stat(&path),
        };
        (action, path)
    }

    /// `open`/`openat`: read-only means O_RDONLY without any of the
    /// creating/truncating flags; everything else is a write.
    fn check_open(&mut self, ctx: &TrapContext, arg: u64, flags: u64) -> (PolicyAction, String) {
        let flags = flags as i32;
        let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY
            && flags & (libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC) == 0;
        let mode = if read_only { Mode::Read } else { Mode::Write };
        self.check_path(ctx, arg, mode)
    }
}

impl<P: AccessPolicy> TraceHandler for PolicyDispatcher<P> {
    fn handle(&mut self, ctx: &mut TrapContext) -> TraceVerdict {
        let nr = ctx.syscall_no();
        let Some(name) = syscall_name(nr) else {
            debug!(nr, "invalid syscall number");
            return TraceVerdict::Kill(format!("unknown syscall {nr}"));
        };
        debug!(nr, name, "seccomp trap");

        let (action, detail) = match name {
            "open" => self.check_open(ctx, ctx.arg0(), ctx.arg1()),
            "openat" => self.check_open(ctx, ctx.arg1(), ctx.arg2()),

            "readlink" => self.check_path(ctx, ctx.arg0(), Mode::Read),
            "readlinkat" => self.check_path(ctx, ctx.arg1(), Mode::Read),

            "unlink" => self.check_path(ctx, ctx.arg0(), Mode::Write),
            "unlinkat" => self.check_path(ctx, ctx.arg1(), Mode::Write),

            "access" => self.check_path(ctx, ctx.arg0(), Mode::Stat),
            "faccessat" | "faccessat2" | "newfstatat" => {
                self.check_path(ctx, ctx.arg1(), Mode::Stat)
            }

            "stat" | "stat64" | "lstat" | "lstat64" => {
                self.check_path(ctx, ctx.arg0(), Mode::Stat)
            }

            "execve" => self.check_path(ctx, ctx.arg0(), Mode::Read),
            "execveat" => self.check_path(ctx, ctx.arg1(), Mode::Read),

            "chmod" => self.check_path(ctx, ctx.arg0(), Mode::Write),
            "rename" => self.check_path(ctx, ctx.arg0(), Mode::Write),

            _ => {
                let mut action = self.policy.check_syscall(name);
                if self.permissive && action == PolicyAction::Kill {
                    action = PolicyAction::Ban;
                }
                (action, name.to_owned())
            }
        };

        match action {
            PolicyAction::Allow => TraceVerdict::Allow,
            PolicyAction::Ban => TraceVerdict::Ban,
            PolicyAction::Kill => TraceVerdict::Kill(detail),
        }
    }
}
