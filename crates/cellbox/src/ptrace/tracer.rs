//! The ptrace event loop.
//!
//! One task at a time wakes the supervisor via `wait4`; the status word
//! decodes into exits, signal deaths and ptrace stops. Stops drive a
//! small per-task state machine: a task's first stop installs the trace
//! options, seccomp events consult the handler, exec flips the loop to
//! group-wide waits (so cloned tasks are followed), every other stop is
//! continued with its signal forwarded. Resource accounting applies to
//! the group leader only, including the early return when a ceiling is
//! crossed while descendants still run.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use tracing::debug;

use super::context::TrapContext;
use super::{TraceHandler, TraceVerdict, BAN_ERRNO};
use crate::cancel::CancelToken;
use crate::launcher::Launcher;
use crate::limit::Limit;
use crate::result::RunResult;
use crate::size::Size;
use crate::status::Status;
use crate::wait;

const TRACE_OPTIONS: libc::c_int = libc::PTRACE_O_EXITKILL
    | libc::PTRACE_O_TRACECLONE
    | libc::PTRACE_O_TRACEFORK
    | libc::PTRACE_O_TRACEVFORK
    | libc::PTRACE_O_TRACEEXEC
    | libc::PTRACE_O_TRACESECCOMP
    | libc::PTRACE_O_TRACEEXIT;

/// Supervises a traced child tree with a [`TraceHandler`].
pub struct Tracer<H: TraceHandler> {
    pub handler: H,
    pub limit: Limit,
    /// Sticky `process_vm_readv` availability for this session.
    use_vm_readv: AtomicBool,
}

struct TraceState {
    pgid: i32,
    traced: HashSet<i32>,
    execved: bool,
    f_time: Option<Instant>,
}

impl<H: TraceHandler> Tracer<H> {
    pub fn new(handler: H, limit: Limit) -> Self {
        Self {
            handler,
            limit,
            use_vm_readv: AtomicBool::new(true),
        }
    }

    /// Starts the launcher and supervises until the leader's verdict.
    ///
    /// Ptrace state is bound to the calling OS thread; this call performs
    /// the clone and every wait on the current thread and blocks until
    /// the tree is reaped.
    pub fn trace(&mut self, mut launcher: Launcher, token: &CancelToken) -> RunResult {
        let s_time = Instant::now();
        let pgid = match launcher.start() {
            Ok(pgid) => pgid,
            Err(err) => {
                debug!(%err, "failed to start traced process");
                return RunResult::runner_error(err);
            }
        };
        debug!(pgid, "tracer started");
        token.arm(pgid);

        let mut state = TraceState {
            pgid,
            traced: HashSet::new(),
            execved: false,
            f_time: None,
        };

        let mut result = self.event_loop(&mut state, token);

        wait::kill_all(pgid);
        wait::collect_zombies(pgid);
        if let Some(f_time) = state.f_time {
            result.set_up_time = f_time.duration_since(s_time);
            result.running_time = f_time.elapsed();
        }
        result
    }

    fn event_loop(&mut self, state: &mut TraceState, token: &CancelToken) -> RunResult {
        let mut result = RunResult::default();
        loop {
            // Before the exec the leader is the only traced task; after
            // it, follow the whole group so clones are supervised too.
            let wait_pid = if state.execved {
                -state.pgid
            } else {
                state.pgid
            };
            let ev = match wait::wait4(wait_pid, libc::__WALL) {
                Ok(ev) => ev,
                Err(err) => {
                    if token.is_cancelled() {
                        return RunResult::runner_error("cancelled");
                    }
                    debug!(%err, "wait4 failed");
                    return RunResult::runner_error(format!("wait4: {err}"));
                }
            };
            debug!(pid = ev.pid, status = ev.status, "process event");

            // Leader-only accounting; a crossed ceiling returns here even
            // if descendants are still accumulating cost.
            if ev.pid == state.pgid {
                result.time = wait::user_time(&ev.rusage);
                result.memory = Size(wait::max_rss_bytes(&ev.rusage));
                let status = if result.time > self.limit.time {
                    Status::TimeLimitExceeded
                } else if result.memory > self.limit.memory {
                    Status::MemoryLimitExceeded
                } else {
                    Status::Normal
                };
                if status != Status::Normal {
                    result.status = status;
                    return result;
                }
            }

            if token.is_cancelled() {
                result.status = Status::RunnerError;
                result.error = Some("cancelled".into());
                return result;
            }

            if libc::WIFEXITED(ev.status) {
                state.traced.remove(&ev.pid);
                let code = libc::WEXITSTATUS(ev.status);
                debug!(pid = ev.pid, code, "process exited");
                if ev.pid == state.pgid {
                    if state.execved {
                        result.exit_status = code;
                        result.status = if code == 0 {
                            Status::Normal
                        } else {
                            Status::NonzeroExit
                        };
                    } else {
                        result.status = Status::RunnerError;
                        result.error = Some("child process exited before execve".into());
                    }
                    return result;
                }
                continue;
            }

            if libc::WIFSIGNALED(ev.status) {
                let sig = libc::WTERMSIG(ev.status);
                state.traced.remove(&ev.pid);
                debug!(pid = ev.pid, sig, "process killed by signal");
                if ev.pid == state.pgid {
                    result.status = Status::Signalled;
                    result.exit_status = sig;
                    result.error = Some(format!("process killed by signal {sig}"));
                    return result;
                }
                continue;
            }

            if !libc::WIFSTOPPED(ev.status) {
                continue;
            }

            // First stop of a task: install options, start the clock on
            // the leader.
            if !state.traced.contains(&ev.pid) {
                state.traced.insert(ev.pid);
                debug!(pid = ev.pid, "start tracing process");
                if let Err(err) = set_trace_options(ev.pid) {
                    result.status = Status::RunnerError;
                    result.error = Some(format!("failed to set ptrace options: {err}"));
                    return result;
                }
                if !state.execved && ev.pid == state.pgid {
                    state.f_time = Some(Instant::now());
                }
            }

            let mut sig = libc::WSTOPSIG(ev.status);
            if sig == libc::SIGTRAP {
                let event = (ev.status >> 16) & 0xff;
                match event {
                    libc::PTRACE_EVENT_SECCOMP => match self.handle_trap(ev.pid) {
                        Ok(None) => {}
                        Ok(Some(reason)) => {
                            result.status = Status::DisallowedSyscall;
                            result.error = Some(reason);
                            return result;
                        }
                        Err(err) => {
                            result.status = Status::RunnerError;
                            result.error =
                                Some(format!("failed to handle seccomp trap: {err}"));
                            return result;
                        }
                    },
                    libc::PTRACE_EVENT_EXEC => {
                        debug!(pid = ev.pid, "process exec event");
                        state.execved = true;
                    }
                    libc::PTRACE_EVENT_CLONE
                    | libc::PTRACE_EVENT_FORK
                    | libc::PTRACE_EVENT_VFORK => {
                        debug!(pid = ev.pid, "process clone/fork event");
                    }
                    _ => {
                        debug!(pid = ev.pid, event, "process trap");
                    }
                }
                // Trace machinery, not a real signal; swallow it.
                sig = 0;
            }

            if let Err(err) = ptrace_cont(ev.pid, sig) {
                result.status = Status::RunnerError;
                result.error = Some(format!("failed to continue process: {err}"));
                return result;
            }
        }
    }

    /// A seccomp-trapped syscall: decode registers, ask the handler,
    /// apply the verdict. `Some(reason)` means kill.
    fn handle_trap(&mut self, pid: i32) -> io::Result<Option<String>> {
        let mut ctx = TrapContext::fetch(pid, &self.use_vm_readv)?;
        match self.handler.handle(&mut ctx) {
            TraceVerdict::Allow => Ok(None),
            TraceVerdict::Ban => {
                debug!(pid, "soft ban syscall");
                ctx.set_return_value(-i64::from(BAN_ERRNO));
                ctx.skip_syscall()?;
                Ok(None)
            }
            TraceVerdict::Kill(reason) => Ok(Some(reason)),
        }
    }
}

fn set_trace_options(pid: i32) -> io::Result<()> {
    // SAFETY: pid is a task we trace; data is a flag word.
    let r = unsafe {
        libc::ptrace(
            libc::PTRACE_SETOPTIONS,
            pid,
            0usize,
            TRACE_OPTIONS as usize,
        )
    };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Resume a stopped task, forwarding `sig` (0 injects nothing). Raw
/// ptrace keeps real-time signal numbers intact.
fn ptrace_cont(pid: i32, sig: libc::c_int) -> io::Result<()> {
    // SAFETY: pid is in ptrace-stop; sig is a signal number or 0.
    let r = unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0usize, sig as usize) };
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
