//! The child side of a launch: everything between clone and exec.
//!
//! This code runs in a fresh process whose address space is a copy of a
//! multi-threaded parent, so it must be async-signal-safe: raw libc calls
//! only, no allocation, no locks, no formatting, no panics. Every input
//! is prepared by `start()` before the clone — C strings, pointer arrays,
//! the fd table, the lowered mount records — and handed over in a
//! [`ChildContext`] that this module only reads (plus the in-place fd
//! shuffle).
//!
//! Any failure is reported as a 6-byte [`ErrorReport`] written to the
//! sync socket, followed by `exit_group` with the errno as status. The
//! parent decodes the report into a [`ChildError`](super::ChildError).
//!
//! [`ErrorReport`]: super::ErrorReport

use std::ffi::{c_char, c_int, c_long, c_void};
use std::mem;
use std::os::fd::RawFd;

use cellbox_sys::seccomp::{SockFprog, SECCOMP_FILTER_FLAG_TSYNC, SECCOMP_SET_MODE_FILTER};
use cellbox_sys::securebits::{
    CapUserHeader, DROP_CAPS_LOCKED, DROP_CAP_DATA, DROP_CAP_HEADER, KEEP_CAPS_ON_SETUID,
};

use super::report::{ErrorReport, Location, REPORT_SIZE};
use crate::mount::MountCall;
use crate::rlimit::RLimit;

const NONE: &[u8] = b"none\0";
const SLASH: &[u8] = b"/\0";
const EMPTY: &[u8] = b"\0";
const TMPFS: &[u8] = b"tmpfs\0";
const OLD_ROOT: &[u8] = b"old_root\0";

/// Retry interval for ETXTBSY on exec: 1 ms, at most 50 attempts.
const ETXTBSY_RETRY_INTERVAL: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: 1_000_000,
};
const ETXTBSY_RETRIES: u32 = 50;

/// Credential as the child consumes it. `set_groups` is precomputed by
/// the parent from the credential and gid-map configuration.
pub(super) struct CredentialView<'a> {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: &'a [libc::gid_t],
    pub set_groups: bool,
}

/// Everything the child reads after clone. All pointers reference memory
/// owned by the parent stack frame driving the launch; the child holds a
/// copy-on-write view of it.
pub(super) struct ChildContext<'a> {
    /// Child end of the sync socket.
    pub sync_fd: RawFd,
    /// Parent end, closed as the first step.
    pub parent_fd: RawFd,

    pub argv0: *const c_char,
    pub argv: *const *const c_char,
    pub envp: *const *const c_char,
    /// -1 when exec goes through `argv0`.
    pub exec_fd: RawFd,

    /// Requested fd table (`fds[i]` becomes child fd `i`; -1 closes).
    pub fds: &'a mut [RawFd],
    /// First fd number above every entry in `fds`.
    pub next_fd: RawFd,

    /// Null when the step is skipped.
    pub work_dir: *const c_char,
    pub pivot_root: *const c_char,
    pub host_name: *const c_char,
    pub host_name_len: usize,
    pub domain_name: *const c_char,
    pub domain_name_len: usize,

    pub mounts: &'a [MountCall],
    pub rlimits: &'a [RLimit],

    pub unshare_user: bool,
    pub new_mount_ns: bool,
    pub credential: Option<CredentialView<'a>>,
    pub seccomp: Option<SockFprog>,

    pub drop_caps: bool,
    pub no_new_privs: bool,
    pub ptrace: bool,
    pub stop_before_seccomp: bool,
    pub ctty: bool,
    pub unshare_cgroup_after_sync: bool,
}

#[inline(always)]
unsafe fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

/// Writes one report and dies with the errno as exit status. Never
/// returns; the exit loop guards against a filtered `exit_group`.
unsafe fn report_and_exit(fd: RawFd, loc: Location, index: u16, err: c_int) -> ! {
    let rep = ErrorReport {
        errno: err as u16,
        location: loc as u16,
        index,
    };
    unsafe {
        libc::write(fd, (&rep as *const ErrorReport).cast::<c_void>(), REPORT_SIZE);
        loop {
            libc::syscall(libc::SYS_exit_group, err as c_long);
        }
    }
}

/// Securebits lock-down plus a zeroed capset: the point of no return for
/// privilege.
unsafe fn drop_all_caps(sync_fd: RawFd, bits_loc: Location) {
    unsafe {
        if libc::prctl(libc::PR_SET_SECUREBITS, DROP_CAPS_LOCKED, 0, 0, 0) < 0 {
            report_and_exit(sync_fd, bits_loc, 0, errno());
        }
        if libc::syscall(
            libc::SYS_capset,
            (&DROP_CAP_HEADER as *const CapUserHeader).cast::<c_void>(),
            DROP_CAP_DATA.as_ptr().cast::<c_void>(),
        ) < 0
        {
            report_and_exit(sync_fd, Location::SetCap, 0, errno());
        }
    }
}

/// One write + one read on the sync socket: tells the parent setup got
/// this far, then blocks until the parent (having run its sync hook)
/// releases the child.
unsafe fn rendezvous(sync_fd: RawFd) {
    unsafe {
        let ack = ErrorReport::default();
        let n = libc::write(sync_fd, (&ack as *const ErrorReport).cast::<c_void>(), REPORT_SIZE);
        if n <= 0 {
            report_and_exit(sync_fd, Location::SyncWrite, 0, errno());
        }
        let mut buf = [0u8; REPORT_SIZE];
        let n = libc::read(sync_fd, buf.as_mut_ptr().cast::<c_void>(), REPORT_SIZE);
        if n <= 0 {
            report_and_exit(sync_fd, Location::SyncRead, 0, errno());
        }
    }
}

/// Post-sync cgroup unshare + re-lock. The unshare itself is best-effort
/// (the sync hook may not have moved us into a cgroup at all).
unsafe fn unshare_cgroup_and_relock(ctx: &ChildContext, sync_fd: RawFd) {
    unsafe {
        libc::syscall(libc::SYS_unshare, libc::CLONE_NEWCGROUP as c_long);
        if ctx.drop_caps || ctx.credential.is_some() {
            drop_all_caps(sync_fd, Location::KeepCapability);
        }
    }
}

unsafe fn install_seccomp(sync_fd: RawFd, fprog: &SockFprog) {
    unsafe {
        if libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_TSYNC,
            (fprog as *const SockFprog).cast::<c_void>(),
        ) < 0
        {
            report_and_exit(sync_fd, Location::Seccomp, 0, errno());
        }
    }
}

/// Runs the confinement sequence and execs. Never returns.
///
/// # Safety
///
/// Must be called exactly once, in the child, immediately after a clone
/// without `CLONE_VM`. Every pointer in `ctx` must be valid in the
/// parent address space at clone time.
pub(super) unsafe fn child_main(ctx: &mut ChildContext) -> ! {
    unsafe {
        let mut sync_fd = ctx.sync_fd;

        // 1. The parent's socket end is not ours to keep.
        if libc::close(ctx.parent_fd) < 0 {
            report_and_exit(sync_fd, Location::CloseWrite, 0, errno());
        }

        // 2. With a fresh user namespace we are nobody until the parent
        // writes the id maps; block until its verdict arrives.
        if ctx.unshare_user {
            let mut map_errno: c_int = 0;
            let n = libc::read(
                sync_fd,
                (&mut map_errno as *mut c_int).cast::<c_void>(),
                mem::size_of::<c_int>(),
            );
            if n < 0 {
                report_and_exit(sync_fd, Location::UnshareUserRead, 0, errno());
            }
            if n as usize != mem::size_of::<c_int>() {
                report_and_exit(sync_fd, Location::UnshareUserRead, 0, libc::EINVAL);
            }
            if map_errno != 0 {
                report_and_exit(sync_fd, Location::UnshareUserRead, 0, map_errno);
            }
        }

        // 3. Needed later for the SIGSTOP to self.
        let pid = libc::syscall(libc::SYS_getpid);
        if pid < 0 {
            report_and_exit(sync_fd, Location::GetPid, 0, errno());
        }

        // 4. A coming setuid (or deferred cgroup unshare) must not cost us
        // the capabilities the remaining setup depends on.
        if ctx.credential.is_some() || ctx.unshare_cgroup_after_sync {
            if libc::prctl(libc::PR_SET_SECUREBITS, KEEP_CAPS_ON_SETUID, 0, 0, 0) < 0 {
                report_and_exit(sync_fd, Location::KeepCapability, 0, errno());
            }
        }

        // 5. Assume the target identity: groups, gid, uid, in that order.
        if let Some(cred) = &ctx.credential {
            if cred.set_groups {
                let ptr = if cred.groups.is_empty() {
                    core::ptr::null()
                } else {
                    cred.groups.as_ptr()
                };
                if libc::setgroups(cred.groups.len(), ptr) < 0 {
                    report_and_exit(sync_fd, Location::SetGroups, 0, errno());
                }
            }
            if libc::setgid(cred.gid) < 0 {
                report_and_exit(sync_fd, Location::SetGid, 0, errno());
            }
            if libc::setuid(cred.uid) < 0 {
                report_and_exit(sync_fd, Location::SetUid, 0, errno());
            }
        }

        // 6. Fd shuffle, pass one: anything sitting below its target slot
        // (including our own socket and the exec fd) is lifted into the
        // region above every requested fd, so pass two can never clobber
        // an unprocessed source.
        let mut next_fd = ctx.next_fd;
        let mut exec_fd = ctx.exec_fd;
        if sync_fd < next_fd {
            if libc::dup3(sync_fd, next_fd, libc::O_CLOEXEC) < 0 {
                report_and_exit(sync_fd, Location::Dup3, 0, errno());
            }
            sync_fd = next_fd;
            next_fd += 1;
        }
        if exec_fd >= 0 && exec_fd < next_fd {
            while next_fd == sync_fd {
                next_fd += 1;
            }
            if libc::dup3(exec_fd, next_fd, libc::O_CLOEXEC) < 0 {
                report_and_exit(sync_fd, Location::Dup3, 0, errno());
            }
            exec_fd = next_fd;
            next_fd += 1;
        }
        let mut i = 0;
        while i < ctx.fds.len() {
            let fd = ctx.fds[i];
            if fd >= 0 && fd < i as RawFd {
                while next_fd == sync_fd || (exec_fd >= 0 && next_fd == exec_fd) {
                    next_fd += 1;
                }
                if libc::dup3(fd, next_fd, libc::O_CLOEXEC) < 0 {
                    report_and_exit(sync_fd, Location::Dup3, 0, errno());
                }
                ctx.fds[i] = next_fd;
                next_fd += 1;
            }
            i += 1;
        }
        // Pass two: land every source on its slot. dup3 onto self would
        // fail, and dup2 onto self would keep CLOEXEC, so same-slot fds
        // get their flag cleared explicitly.
        let mut i = 0;
        while i < ctx.fds.len() {
            let fd = ctx.fds[i];
            if fd == -1 {
                libc::close(i as c_int);
            } else if fd == i as RawFd {
                if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                    report_and_exit(sync_fd, Location::Fcntl, 0, errno());
                }
            } else if libc::dup3(fd, i as c_int, 0) < 0 {
                report_and_exit(sync_fd, Location::Dup3, 0, errno());
            }
            i += 1;
        }

        // 7. Own session; the pid doubles as the process group the
        // supervisor signals.
        if libc::setsid() < 0 {
            report_and_exit(sync_fd, Location::SetSid, 0, errno());
        }
        if ctx.ctty {
            if libc::ioctl(0, libc::TIOCSCTTY, 1) < 0 {
                report_and_exit(sync_fd, Location::Ioctl, 0, errno());
            }
        }

        // 8. Mount setup.
        {
            // Private root first, or every mount below leaks into the
            // host namespace.
            if ctx.new_mount_ns {
                if libc::mount(
                    NONE.as_ptr().cast::<c_char>(),
                    SLASH.as_ptr().cast::<c_char>(),
                    core::ptr::null(),
                    libc::MS_REC | libc::MS_PRIVATE,
                    core::ptr::null(),
                ) < 0
                {
                    report_and_exit(sync_fd, Location::MountRoot, 0, errno());
                }
            }

            if !ctx.pivot_root.is_null() {
                if libc::mount(
                    TMPFS.as_ptr().cast::<c_char>(),
                    ctx.pivot_root,
                    TMPFS.as_ptr().cast::<c_char>(),
                    0,
                    EMPTY.as_ptr().cast::<c_void>(),
                ) < 0
                {
                    report_and_exit(sync_fd, Location::MountTmpfs, 0, errno());
                }
                if libc::chdir(ctx.pivot_root) < 0 {
                    report_and_exit(sync_fd, Location::MountChdir, 0, errno());
                }
            }

            let mut m_idx = 0;
            while m_idx < ctx.mounts.len() {
                let m: &MountCall = &ctx.mounts[m_idx];
                let report_idx = (m_idx + 1) as u16;
                let last = m.prefixes.len().wrapping_sub(1);
                let mut j = 0;
                while j < m.prefixes.len() {
                    let p = m.prefixes[j].as_ptr();
                    if j == last && m.make_node {
                        if libc::mknodat(libc::AT_FDCWD, p, 0o755, 0) < 0 && errno() != libc::EEXIST
                        {
                            report_and_exit(sync_fd, Location::MountMkdir, report_idx, errno());
                        }
                        break;
                    }
                    if libc::mkdirat(libc::AT_FDCWD, p, 0o755) < 0 && errno() != libc::EEXIST {
                        report_and_exit(sync_fd, Location::MountMkdir, report_idx, errno());
                    }
                    j += 1;
                }

                let data = match &m.data {
                    Some(d) => d.as_ptr().cast::<c_void>(),
                    None => core::ptr::null(),
                };
                if libc::mount(m.source.as_ptr(), m.target.as_ptr(), m.fs_type.as_ptr(), m.flags, data) < 0 {
                    report_and_exit(sync_fd, Location::Mount, report_idx, errno());
                }
                // A bind mount ignores MS_RDONLY on the first pass; the
                // remount makes it stick.
                let bind_ro = libc::MS_BIND | libc::MS_RDONLY;
                if m.flags & bind_ro == bind_ro {
                    if libc::mount(
                        EMPTY.as_ptr().cast::<c_char>(),
                        m.target.as_ptr(),
                        m.fs_type.as_ptr(),
                        m.flags | libc::MS_REMOUNT,
                        data,
                    ) < 0
                    {
                        report_and_exit(sync_fd, Location::Mount, report_idx, errno());
                    }
                }
                m_idx += 1;
            }

            if !ctx.pivot_root.is_null() {
                if libc::mkdirat(libc::AT_FDCWD, OLD_ROOT.as_ptr().cast::<c_char>(), 0o755) < 0 {
                    report_and_exit(sync_fd, Location::PivotRoot, 0, errno());
                }
                if libc::syscall(
                    libc::SYS_pivot_root,
                    ctx.pivot_root,
                    OLD_ROOT.as_ptr().cast::<c_char>(),
                ) < 0
                {
                    report_and_exit(sync_fd, Location::PivotRoot, 0, errno());
                }
                if libc::umount2(OLD_ROOT.as_ptr().cast::<c_char>(), libc::MNT_DETACH) < 0 {
                    report_and_exit(sync_fd, Location::Umount, 0, errno());
                }
                if libc::unlinkat(
                    libc::AT_FDCWD,
                    OLD_ROOT.as_ptr().cast::<c_char>(),
                    libc::AT_REMOVEDIR,
                ) < 0
                {
                    report_and_exit(sync_fd, Location::Unlink, 0, errno());
                }
                if libc::mount(
                    TMPFS.as_ptr().cast::<c_char>(),
                    SLASH.as_ptr().cast::<c_char>(),
                    TMPFS.as_ptr().cast::<c_char>(),
                    libc::MS_BIND
                        | libc::MS_REMOUNT
                        | libc::MS_RDONLY
                        | libc::MS_NOATIME
                        | libc::MS_NOSUID,
                    EMPTY.as_ptr().cast::<c_void>(),
                ) < 0
                {
                    report_and_exit(sync_fd, Location::MountRootReadonly, 0, errno());
                }
            }
        }

        // 9. UTS names, best-effort.
        if !ctx.host_name.is_null() {
            libc::sethostname(ctx.host_name, ctx.host_name_len);
        }
        if !ctx.domain_name.is_null() {
            libc::setdomainname(ctx.domain_name, ctx.domain_name_len);
        }

        // 10. Working directory (inside the new root when pivoted).
        if !ctx.work_dir.is_null() {
            if libc::chdir(ctx.work_dir) < 0 {
                report_and_exit(sync_fd, Location::Chdir, 0, errno());
            }
        }

        // 11. Rlimits, caller order; prlimit64 avoids 32-bit truncation.
        let mut r_idx = 0;
        while r_idx < ctx.rlimits.len() {
            let r: &RLimit = &ctx.rlimits[r_idx];
            if libc::prlimit64(
                0,
                r.res as libc::__rlimit_resource_t,
                &r.rlim,
                core::ptr::null_mut(),
            ) < 0
            {
                report_and_exit(sync_fd, Location::SetRlimit, r_idx as u16, errno());
            }
            r_idx += 1;
        }

        // 12. Unprivileged seccomp requires no_new_privs.
        if ctx.no_new_privs {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) < 0 {
                report_and_exit(sync_fd, Location::SetNoNewPrivs, 0, errno());
            }
        }

        // 13. Final privilege drop, unless the post-sync cgroup unshare
        // still needs CAP_SYS_ADMIN; then it happens after the sync.
        if (ctx.credential.is_some() || ctx.drop_caps) && !ctx.unshare_cgroup_after_sync {
            drop_all_caps(sync_fd, Location::DropCapability);
        }

        // 14. Traced-and-filtered children rendezvous early: the tracer
        // must be attached before the filter starts trapping syscalls.
        if ctx.ptrace && ctx.seccomp.is_some() {
            rendezvous(sync_fd);
            if ctx.unshare_cgroup_after_sync {
                unshare_cgroup_and_relock(ctx, sync_fd);
            }
            if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) < 0 {
                report_and_exit(sync_fd, Location::PtraceMe, 0, errno());
            }
        }

        // 15. Stop so the tracer can attach and set options before any
        // traced syscall fires; kill may be unavailable after seccomp.
        if ctx.stop_before_seccomp {
            if libc::kill(pid as libc::pid_t, libc::SIGSTOP) < 0 {
                report_and_exit(sync_fd, Location::Stop, 0, errno());
            }
        }

        // 16. The filter goes on after all setup syscalls it would forbid.
        if let Some(fprog) = &ctx.seccomp {
            if !ctx.unshare_cgroup_after_sync || ctx.ptrace {
                install_seccomp(sync_fd, fprog);
            }
        }

        // 17. Everyone else rendezvouses here, then finishes the deferred
        // cgroup unshare, privilege drop and filter install.
        if !ctx.ptrace || ctx.seccomp.is_none() {
            rendezvous(sync_fd);
            if ctx.unshare_cgroup_after_sync {
                unshare_cgroup_and_relock(ctx, sync_fd);
                if let Some(fprog) = &ctx.seccomp {
                    install_seccomp(sync_fd, fprog);
                }
            }
        }

        // 18. Trace-without-filter arms late: nothing needs intercepting
        // until exec itself.
        if ctx.ptrace && ctx.seccomp.is_none() {
            if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) < 0 {
                report_and_exit(sync_fd, Location::PtraceMe, 0, errno());
            }
        }

        // 19. Exec. ETXTBSY can happen while another launch still holds a
        // write fd on the same copied-in executable; wait it out briefly.
        let mut attempt = 0;
        loop {
            if exec_fd >= 0 {
                libc::syscall(
                    libc::SYS_execveat,
                    exec_fd as c_long,
                    EMPTY.as_ptr().cast::<c_char>(),
                    ctx.argv,
                    ctx.envp,
                    libc::AT_EMPTY_PATH as c_long,
                );
            } else {
                libc::execve(ctx.argv0, ctx.argv, ctx.envp);
            }
            if errno() != libc::ETXTBSY || attempt >= ETXTBSY_RETRIES {
                break;
            }
            attempt += 1;
            libc::nanosleep(&ETXTBSY_RETRY_INTERVAL, core::ptr::null_mut());
        }
        report_and_exit(sync_fd, Location::Execve, 0, errno());
    }
}
