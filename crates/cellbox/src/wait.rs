//! Shared wait/reap plumbing for the supervisors.

use std::io;
use std::mem;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// One `wait4` wake-up: which task, its raw status word, and the rusage
/// snapshot taken with it.
#[derive(Debug)]
pub(crate) struct WaitEvent {
    pub pid: i32,
    pub status: libc::c_int,
    pub rusage: libc::rusage,
}

/// EINTR-transparent `wait4` with rusage. `pid` follows the kernel
/// convention (positive pid, `-pgid` for a group).
pub(crate) fn wait4(pid: i32, options: libc::c_int) -> io::Result<WaitEvent> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: zeroed rusage is a valid out-param.
        let mut rusage: libc::rusage = unsafe { mem::zeroed() };
        let r = unsafe { libc::wait4(pid, &mut status, options, &mut rusage) };
        if r >= 0 {
            return Ok(WaitEvent {
                pid: r,
                status,
                rusage,
            });
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// SIGKILL the whole process group, best-effort.
pub(crate) fn kill_all(pgid: i32) {
    let _ = kill(Pid::from_raw(-pgid), Signal::SIGKILL);
}

/// Bounded zombie sweep after the group was killed: reap until no child
/// is immediately reapable.
pub(crate) fn collect_zombies(pgid: i32) {
    loop {
        let mut status: libc::c_int = 0;
        let r = unsafe {
            libc::wait4(
                -pgid,
                &mut status,
                libc::__WALL | libc::WNOHANG,
                std::ptr::null_mut(),
            )
        };
        if r < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        if r <= 0 {
            return;
        }
    }
}

/// User CPU time out of an rusage snapshot.
pub(crate) fn user_time(rusage: &libc::rusage) -> Duration {
    Duration::new(
        rusage.ru_utime.tv_sec.max(0) as u64,
        (rusage.ru_utime.tv_usec.max(0) as u32) * 1000,
    )
}

/// Max RSS in bytes (the kernel reports KiB).
pub(crate) fn max_rss_bytes(rusage: &libc::rusage) -> u64 {
    (rusage.ru_maxrss.max(0) as u64) << 10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_time_converts_timeval() {
        let mut ru: libc::rusage = unsafe { mem::zeroed() };
        ru.ru_utime.tv_sec = 2;
        ru.ru_utime.tv_usec = 500_000;
        assert_eq!(user_time(&ru), Duration::from_millis(2500));
    }

    #[test]
    fn max_rss_shifts_kib() {
        let mut ru: libc::rusage = unsafe { mem::zeroed() };
        ru.ru_maxrss = 64;
        assert_eq!(max_rss_bytes(&ru), 64 << 10);
    }

    #[test]
    fn wait4_with_no_children_errors() {
        let err = wait4(-999_999, libc::WNOHANG).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
    }
}
