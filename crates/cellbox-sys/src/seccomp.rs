//! Seccomp-BPF filter construction.
//!
//! A filter is compiled from an allow-list, a trace-list and a default
//! action. Allow-listed syscalls pass silently; trace-listed syscalls
//! return `SECCOMP_RET_TRACE` so a ptrace supervisor receives a
//! `PTRACE_EVENT_SECCOMP` stop and decides; everything else falls through
//! to the default action (allow, errno, trace or kill).
//!
//! ## Program layout
//!
//! ```text
//! [0-2]          architecture guard (x86_64, kill-process otherwise)
//! [3]            load syscall number
//! [4 .. 4+a)     allow-list compares -> ALLOW
//! [4+a .. 4+a+t) trace-list compares -> TRACE
//! [4+a+t]        default action
//! [4+a+t+1]      RET ALLOW
//! [4+a+t+2]      RET TRACE
//! ```
//!
//! The compiled program is surfaced as a pointer + length (`SockFprog`)
//! for the `seccomp(SECCOMP_SET_MODE_FILTER, TSYNC, ...)` call, which the
//! child performs between fork and exec.

use rustix::io::Errno;

use crate::last_errno;

pub const SECCOMP_SET_MODE_FILTER: libc::c_long = 1;
pub const SECCOMP_FILTER_FLAG_TSYNC: libc::c_long = 1;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF instruction classes
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// BPF ld/jmp fields
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

// seccomp_data offsets (x86_64)
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

/// Maximum combined list size (BPF jump offsets are u8).
const MAX_LIST_SIZE: usize = 250;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// What the kernel does with a syscall that reaches this action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Let the syscall through.
    Allow,
    /// Fail the syscall with the given errno without executing it.
    Errno(u16),
    /// Stop the tracee with `PTRACE_EVENT_SECCOMP`; the message value is
    /// retrievable by the tracer via `PTRACE_GETEVENTMSG`.
    Trace(u16),
    /// Kill the offending thread with SIGSYS.
    Kill,
}

impl Action {
    /// Kernel return word for this action.
    pub fn ret_word(self) -> u32 {
        match self {
            Action::Allow => SECCOMP_RET_ALLOW,
            Action::Errno(code) => SECCOMP_RET_ERRNO | u32::from(code),
            Action::Trace(msg) => SECCOMP_RET_TRACE | u32::from(msg),
            Action::Kill => SECCOMP_RET_KILL_THREAD,
        }
    }
}

/// A compiled BPF program, ready to install.
#[derive(Debug, Clone, Default)]
pub struct Filter(pub Vec<SockFilter>);

impl Filter {
    /// Pointer + length view consumed by the `seccomp(2)` call. The
    /// returned value borrows `self`; the filter must outlive the call.
    pub fn sock_fprog(&self) -> SockFprog {
        SockFprog {
            len: self.0.len() as u16,
            filter: self.0.as_ptr(),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Compiles (allow-list, trace-list, default action) into a BPF program.
#[derive(Debug, Clone)]
pub struct FilterBuilder {
    allow: Vec<i64>,
    trace: Vec<i64>,
    trace_msg: u16,
    default_action: Action,
}

impl Default for FilterBuilder {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            trace: Vec::new(),
            trace_msg: 0,
            default_action: Action::Kill,
        }
    }
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a syscall unconditionally.
    pub fn allow(mut self, nr: i64) -> Self {
        self.allow.push(nr);
        self
    }

    pub fn allow_many(mut self, nrs: impl IntoIterator<Item = i64>) -> Self {
        self.allow.extend(nrs);
        self
    }

    /// Hand a syscall to the ptrace supervisor.
    pub fn trace(mut self, nr: i64) -> Self {
        self.trace.push(nr);
        self
    }

    pub fn trace_many(mut self, nrs: impl IntoIterator<Item = i64>) -> Self {
        self.trace.extend(nrs);
        self
    }

    /// Event message attached to trace stops (default 0).
    pub fn trace_msg(mut self, msg: u16) -> Self {
        self.trace_msg = msg;
        self
    }

    /// Action for syscalls on neither list (default: kill).
    pub fn default_action(mut self, action: Action) -> Self {
        self.default_action = action;
        self
    }

    /// Compile to BPF.
    ///
    /// # Panics
    ///
    /// Panics if the combined list size exceeds 250 entries (BPF jump
    /// offsets are u8).
    pub fn build(self) -> Filter {
        let a = self.allow.len();
        let t = self.trace.len();
        assert!(
            a + t <= MAX_LIST_SIZE,
            "syscall lists too large: {} > {} (BPF jump offset overflow)",
            a + t,
            MAX_LIST_SIZE
        );

        let mut prog = Vec::with_capacity(4 + a + t + 3);

        // Architecture guard.
        prog.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
        prog.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            AUDIT_ARCH_X86_64,
            1,
            0,
        ));
        prog.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

        // Load syscall number.
        prog.push(SockFilter::stmt(
            BPF_LD | BPF_W | BPF_ABS,
            OFFSET_SYSCALL_NR,
        ));

        // Allow-list: jump over the remaining compares, the default and
        // nothing else to land on RET ALLOW.
        for (i, &nr) in self.allow.iter().enumerate() {
            let jt = (a - i + t) as u8;
            prog.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, jt, 0));
        }

        // Trace-list: land on RET TRACE.
        for (j, &nr) in self.trace.iter().enumerate() {
            let jt = (t - j + 1) as u8;
            prog.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, jt, 0));
        }

        prog.push(SockFilter::stmt(BPF_RET | BPF_K, self.default_action.ret_word()));
        prog.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        prog.push(SockFilter::stmt(
            BPF_RET | BPF_K,
            SECCOMP_RET_TRACE | u32::from(self.trace_msg),
        ));

        Filter(prog)
    }
}

/// Installs a filter on the calling process with
/// `seccomp(SECCOMP_SET_MODE_FILTER, SECCOMP_FILTER_FLAG_TSYNC, fprog)`.
///
/// The caller must have set `PR_SET_NO_NEW_PRIVS` (or hold
/// `CAP_SYS_ADMIN` in its user namespace) beforehand.
///
/// # Safety
///
/// Permanently restricts syscalls for every thread of the process. The
/// program pointed to by `fprog` must be a valid BPF filter.
pub unsafe fn seccomp_set_mode_filter(fprog: &SockFprog) -> Result<(), Errno> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_TSYNC,
            fprog as *const SockFprog,
        )
    };
    if ret != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_shape() {
        let filter = FilterBuilder::new()
            .allow_many([libc::SYS_read, libc::SYS_write, libc::SYS_exit_group])
            .trace_many([libc::SYS_openat, libc::SYS_execve])
            .build();
        // 4 header + 3 allow + 2 trace + default + allow + trace = 12
        assert_eq!(filter.len(), 12);
        assert_eq!(filter.0[0].k, OFFSET_ARCH);
        assert_eq!(filter.0[2].k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn allow_jumps_land_on_ret_allow() {
        let filter = FilterBuilder::new()
            .allow_many([0, 1, 2])
            .trace_many([3, 4])
            .build();
        let allow_idx = filter.len() - 2;
        for (i, ins) in filter.0[4..7].iter().enumerate() {
            let target = 4 + i + 1 + ins.jt as usize;
            assert_eq!(target, allow_idx, "allow entry {i}");
        }
    }

    #[test]
    fn trace_jumps_land_on_ret_trace() {
        let filter = FilterBuilder::new()
            .allow_many([0, 1, 2])
            .trace_many([3, 4])
            .trace_msg(7)
            .build();
        let trace_idx = filter.len() - 1;
        for (j, ins) in filter.0[7..9].iter().enumerate() {
            let target = 7 + j + 1 + ins.jt as usize;
            assert_eq!(target, trace_idx, "trace entry {j}");
        }
        assert_eq!(filter.0[trace_idx].k, SECCOMP_RET_TRACE | 7);
    }

    #[test]
    fn default_action_words() {
        assert_eq!(Action::Allow.ret_word(), SECCOMP_RET_ALLOW);
        assert_eq!(Action::Errno(libc::EACCES as u16).ret_word(), SECCOMP_RET_ERRNO | 13);
        assert_eq!(Action::Trace(2).ret_word(), SECCOMP_RET_TRACE | 2);
        assert_eq!(Action::Kill.ret_word(), SECCOMP_RET_KILL_THREAD);
    }

    #[test]
    fn empty_lists_still_compile() {
        let filter = FilterBuilder::new().default_action(Action::Allow).build();
        assert_eq!(filter.len(), 7);
        assert_eq!(filter.0[4].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    #[should_panic(expected = "syscall lists too large")]
    fn oversized_list_panics() {
        let huge: Vec<i64> = (0..300).collect();
        FilterBuilder::new().allow_many(huge).build();
    }
}
