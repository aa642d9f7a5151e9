//! Syscall number → name mapping (x86-64).
//!
//! The policy layer is keyed by syscall *names* so callers can write
//! counters and trace lists without memorizing numbers, and so 32-bit
//! names (`stat64` and friends) stay expressible. Only the syscalls a
//! filter plausibly traces are listed; an unknown number yields `None`
//! and the ptrace handler treats it as hostile.

/// Name of a syscall number on x86-64.
pub fn syscall_name(nr: u64) -> Option<&'static str> {
    let nr = i64::try_from(nr).ok()?;
    Some(match nr {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_open => "open",
        libc::SYS_close => "close",
        libc::SYS_stat => "stat",
        libc::SYS_fstat => "fstat",
        libc::SYS_lstat => "lstat",
        libc::SYS_poll => "poll",
        libc::SYS_lseek => "lseek",
        libc::SYS_mmap => "mmap",
        libc::SYS_mprotect => "mprotect",
        libc::SYS_munmap => "munmap",
        libc::SYS_brk => "brk",
        libc::SYS_rt_sigaction => "rt_sigaction",
        libc::SYS_rt_sigprocmask => "rt_sigprocmask",
        libc::SYS_rt_sigreturn => "rt_sigreturn",
        libc::SYS_ioctl => "ioctl",
        libc::SYS_access => "access",
        libc::SYS_pipe => "pipe",
        libc::SYS_pipe2 => "pipe2",
        libc::SYS_dup => "dup",
        libc::SYS_dup2 => "dup2",
        libc::SYS_dup3 => "dup3",
        libc::SYS_socket => "socket",
        libc::SYS_connect => "connect",
        libc::SYS_clone => "clone",
        libc::SYS_clone3 => "clone3",
        libc::SYS_fork => "fork",
        libc::SYS_vfork => "vfork",
        libc::SYS_execve => "execve",
        libc::SYS_execveat => "execveat",
        libc::SYS_exit => "exit",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_wait4 => "wait4",
        libc::SYS_kill => "kill",
        libc::SYS_tgkill => "tgkill",
        libc::SYS_uname => "uname",
        libc::SYS_fcntl => "fcntl",
        libc::SYS_getcwd => "getcwd",
        libc::SYS_chdir => "chdir",
        libc::SYS_rename => "rename",
        libc::SYS_renameat => "renameat",
        libc::SYS_renameat2 => "renameat2",
        libc::SYS_mkdir => "mkdir",
        libc::SYS_mkdirat => "mkdirat",
        libc::SYS_rmdir => "rmdir",
        libc::SYS_creat => "creat",
        libc::SYS_link => "link",
        libc::SYS_linkat => "linkat",
        libc::SYS_unlink => "unlink",
        libc::SYS_unlinkat => "unlinkat",
        libc::SYS_symlink => "symlink",
        libc::SYS_symlinkat => "symlinkat",
        libc::SYS_readlink => "readlink",
        libc::SYS_readlinkat => "readlinkat",
        libc::SYS_chmod => "chmod",
        libc::SYS_fchmod => "fchmod",
        libc::SYS_fchmodat => "fchmodat",
        libc::SYS_chown => "chown",
        libc::SYS_fchownat => "fchownat",
        libc::SYS_umask => "umask",
        libc::SYS_gettimeofday => "gettimeofday",
        libc::SYS_getrlimit => "getrlimit",
        libc::SYS_getrusage => "getrusage",
        libc::SYS_getuid => "getuid",
        libc::SYS_getgid => "getgid",
        libc::SYS_geteuid => "geteuid",
        libc::SYS_getegid => "getegid",
        libc::SYS_getpid => "getpid",
        libc::SYS_getppid => "getppid",
        libc::SYS_gettid => "gettid",
        libc::SYS_openat => "openat",
        libc::SYS_newfstatat => "newfstatat",
        libc::SYS_faccessat => "faccessat",
        libc::SYS_faccessat2 => "faccessat2",
        libc::SYS_statx => "statx",
        libc::SYS_prlimit64 => "prlimit64",
        libc::SYS_getrandom => "getrandom",
        libc::SYS_memfd_create => "memfd_create",
        libc::SYS_ptrace => "ptrace",
        libc::SYS_prctl => "prctl",
        libc::SYS_seccomp => "seccomp",
        libc::SYS_mount => "mount",
        libc::SYS_umount2 => "umount2",
        libc::SYS_pivot_root => "pivot_root",
        libc::SYS_unshare => "unshare",
        libc::SYS_setns => "setns",
        libc::SYS_sethostname => "sethostname",
        libc::SYS_setdomainname => "setdomainname",
        libc::SYS_setuid => "setuid",
        libc::SYS_setgid => "setgid",
        libc::SYS_setgroups => "setgroups",
        libc::SYS_setsid => "setsid",
        libc::SYS_setpgid => "setpgid",
        libc::SYS_sysinfo => "sysinfo",
        libc::SYS_times => "times",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_numbers() {
        assert_eq!(syscall_name(libc::SYS_openat as u64), Some("openat"));
        assert_eq!(syscall_name(libc::SYS_execve as u64), Some("execve"));
        assert_eq!(syscall_name(libc::SYS_newfstatat as u64), Some("newfstatat"));
    }

    #[test]
    fn unknown_numbers() {
        assert_eq!(syscall_name(u64::MAX), None);
        assert_eq!(syscall_name(100_000), None);
    }
}
