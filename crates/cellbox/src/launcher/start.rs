//! Parent side of a launch: clone, id maps, rendezvous, failure reaping.
//!
//! `start()` lowers the launcher configuration into the raw-pointer view
//! the child consumes, clones with the requested namespace flags, then
//! walks the sync protocol: write uid/gid maps (user namespace only),
//! read the child's first report, run the sync hook, release the child,
//! and either hand the pid to a supervisor (ptrace/stop launches) or wait
//! for the exec-time EOF. Any failure kills and reaps the child before
//! returning.

use std::ffi::{c_char, c_int, c_void, CString};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::thread;

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{getegid, geteuid};

use super::child::{child_main, ChildContext, CredentialView};
use super::report::{ChildError, ErrorReport, LEGACY_ERRNO_SIZE, REPORT_SIZE};
use super::{IdMap, LaunchError, Launcher, Location, NAMESPACE_FLAGS};

/// Serializes every clone in the process. Held across clone and the
/// uid/gid-map exchange so no other launch (or foreign fork) interleaves
/// with the window where fds and maps are in flight.
static FORK_LOCK: Mutex<()> = Mutex::new(());

impl Launcher {
    /// Clones and confines the child, returning its pid (== pgid).
    ///
    /// For `ptrace`/`stop_before_seccomp` launches the child is left in
    /// its pre-seccomp SIGSTOP and the caller must supervise it; other
    /// launches return once the child reached exec.
    pub fn start(&mut self) -> Result<i32, LaunchError> {
        if self.args.is_empty() {
            return Err(LaunchError::EmptyArgs);
        }

        let cstr = |s: &str| CString::new(s).map_err(|_| LaunchError::NulByte);
        let opt_cstr = |s: &str| -> Result<Option<CString>, LaunchError> {
            if s.is_empty() {
                Ok(None)
            } else {
                CString::new(s).map(Some).map_err(|_| LaunchError::NulByte)
            }
        };
        let as_ptr = |s: &Option<CString>| s.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());

        // Exec arguments as NULL-terminated pointer arrays. The vectors
        // stay alive across the clone; the child reads them copy-on-write.
        let argv_c = self
            .args
            .iter()
            .map(|a| cstr(a))
            .collect::<Result<Vec<_>, _>>()?;
        let envp_c = self
            .env
            .iter()
            .map(|e| cstr(e))
            .collect::<Result<Vec<_>, _>>()?;
        let argv_ptrs: Vec<*const c_char> = argv_c
            .iter()
            .map(|c| c.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs: Vec<*const c_char> = envp_c
            .iter()
            .map(|c| c.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let work_dir = opt_cstr(&self.work_dir)?;
        let host_name = opt_cstr(&self.host_name)?;
        let domain_name = opt_cstr(&self.domain_name)?;
        let pivot_root = opt_cstr(&self.pivot_root)?;

        // Scratch fd table for the child's two-pass shuffle; next_fd is
        // the first slot above every requested fd.
        let mut fds: Vec<RawFd> = self.files.clone();
        let mut next_fd = fds.len() as RawFd;
        for &fd in &fds {
            if fd > next_fd {
                next_fd = fd;
            }
        }
        next_fd += 1;

        let seccomp_set = self.seccomp.is_some();
        let stop_before_seccomp = self.stop_before_seccomp || (self.ptrace && seccomp_set);
        let no_new_privs = self.no_new_privs || seccomp_set;
        let unshare_user = self.clone_flags & libc::CLONE_NEWUSER as libc::c_ulong != 0;

        let credential = self.credential.as_ref().map(|cred| {
            // setgroups is skipped when the gid map forbids it anyway, or
            // when the caller opted out.
            let gid_map_denies = !self.gid_maps.is_empty()
                && !self.gid_map_enable_setgroups
                && cred.groups.is_empty();
            CredentialView {
                uid: cred.uid,
                gid: cred.gid,
                groups: &cred.groups,
                set_groups: !gid_map_denies && !cred.no_set_groups,
            }
        });

        let (parent_sock, child_sock) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| LaunchError::Os {
            op: "socketpair",
            err: io::Error::from_raw_os_error(e as i32),
        })?;

        let mut ctx = ChildContext {
            sync_fd: child_sock.as_raw_fd(),
            parent_fd: parent_sock.as_raw_fd(),
            argv0: argv_c[0].as_ptr(),
            argv: argv_ptrs.as_ptr(),
            envp: envp_ptrs.as_ptr(),
            exec_fd: self.exec_fd.unwrap_or(-1),
            fds: &mut fds,
            next_fd,
            work_dir: as_ptr(&work_dir),
            pivot_root: as_ptr(&pivot_root),
            host_name: as_ptr(&host_name),
            host_name_len: self.host_name.len(),
            domain_name: as_ptr(&domain_name),
            domain_name_len: self.domain_name.len(),
            mounts: &self.mounts,
            rlimits: &self.rlimits,
            unshare_user,
            new_mount_ns: self.clone_flags & libc::CLONE_NEWNS as libc::c_ulong != 0,
            credential,
            seccomp: self.seccomp.as_ref().map(|f| f.sock_fprog()),
            drop_caps: self.drop_caps,
            no_new_privs,
            ptrace: self.ptrace,
            stop_before_seccomp,
            ctty: self.ctty,
            unshare_cgroup_after_sync: self.unshare_cgroup_after_sync,
        };

        let lock = FORK_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let flags =
            (self.clone_flags & NAMESPACE_FLAGS) | libc::SIGCHLD as libc::c_ulong;
        // SAFETY: plain fork-style clone (no CLONE_VM); the child runs
        // child_main over pointers that stay valid in the parent frame.
        let pid = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };

        if pid < 0 {
            let err = io::Error::last_os_error();
            drop(lock);
            return Err(ChildError {
                errno: err.raw_os_error().unwrap_or(libc::EINVAL) as u16,
                location: Some(Location::Clone),
                index: 0,
            }
            .into());
        }
        if pid == 0 {
            // SAFETY: in the child, immediately after clone.
            unsafe { child_main(&mut ctx) }
        }
        drop(ctx);
        drop(child_sock);

        let pid = pid as i32;
        match self.sync_with_child(parent_sock, pid, unshare_user, stop_before_seccomp, lock) {
            Ok(()) => Ok(pid),
            Err(err) => {
                kill_and_reap(pid);
                Err(err)
            }
        }
    }

    fn sync_with_child(
        &mut self,
        parent_sock: OwnedFd,
        pid: i32,
        unshare_user: bool,
        stop_before_seccomp: bool,
        lock: std::sync::MutexGuard<'_, ()>,
    ) -> Result<(), LaunchError> {
        // The child blocks in its first read until the maps are in.
        if unshare_user {
            let map_errno: c_int = match self.write_id_maps(pid) {
                Ok(()) => 0,
                Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
            };
            write_message(parent_sock.as_raw_fd(), &map_errno.to_ne_bytes());
        }
        drop(lock);

        // First report: rendezvous ack on success, a populated report on
        // a failed setup step.
        let (n, buf) = read_message(&parent_sock)
            .map_err(|err| LaunchError::Os { op: "read", err })?;
        let ok = match n {
            REPORT_SIZE => ErrorReport::from_bytes(buf).errno == 0,
            LEGACY_ERRNO_SIZE => legacy_errno(&buf) == 0,
            _ => false,
        };
        if !ok {
            return Err(decode_failure(n, buf).into());
        }

        // Admission hook (cgroup add etc.) runs against the pid while the
        // child is parked, so accounting starts clean.
        if let Some(sync_func) = self.sync_func.as_mut() {
            sync_func(pid).map_err(LaunchError::SyncFunc)?;
        }

        // Release the child; the value is ignored on the other side.
        write_message(
            parent_sock.as_raw_fd(),
            &ErrorReport::default().to_bytes(),
        );

        if self.ptrace || stop_before_seccomp {
            // The supervisor takes it from the SIGSTOP; a detached reader
            // drains any late report so the child never blocks on a full
            // socket while dying.
            thread::spawn(move || {
                let _ = read_message(&parent_sock);
            });
            return Ok(());
        }

        // EOF through CLOEXEC means the exec happened.
        let (n, buf) = read_message(&parent_sock)
            .map_err(|err| LaunchError::Os { op: "read", err })?;
        if n != 0 {
            return Err(decode_failure(n, buf).into());
        }
        Ok(())
    }

    fn write_id_maps(&self, pid: i32) -> io::Result<()> {
        let uid_map = if self.uid_maps.is_empty() {
            format!("0 {} 1\n", geteuid().as_raw())
        } else {
            format_id_maps(&self.uid_maps)
        };
        fs::write(format!("/proc/{pid}/uid_map"), uid_map)?;

        // Must land before gid_map, and "deny" unless maps explicitly
        // allow setgroups.
        let setgroups = if self.gid_maps.is_empty() || !self.gid_map_enable_setgroups {
            "deny"
        } else {
            "allow"
        };
        fs::write(format!("/proc/{pid}/setgroups"), setgroups)?;

        let gid_map = if self.gid_maps.is_empty() {
            format!("0 {} 1\n", getegid().as_raw())
        } else {
            format_id_maps(&self.gid_maps)
        };
        fs::write(format!("/proc/{pid}/gid_map"), gid_map)
    }
}

fn format_id_maps(maps: &[IdMap]) -> String {
    let mut out = String::new();
    for m in maps {
        out.push_str(&format!("{} {} {}\n", m.container_id, m.host_id, m.size));
    }
    out
}

/// One message off the SEQPACKET socket, EINTR-retried. Returns the byte
/// count; 0 is EOF.
fn read_message(fd: &OwnedFd) -> io::Result<(usize, [u8; REPORT_SIZE])> {
    let mut buf = [0u8; REPORT_SIZE];
    loop {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<c_void>(),
                REPORT_SIZE,
            )
        };
        if n >= 0 {
            return Ok((n as usize, buf));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Best-effort single-message write; a dead child is detected by the
/// following read, not here.
fn write_message(fd: RawFd, bytes: &[u8]) {
    loop {
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast::<c_void>(), bytes.len()) };
        if n >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return;
        }
    }
}

fn legacy_errno(buf: &[u8; REPORT_SIZE]) -> c_int {
    c_int::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Maps a non-success message to the child error it encodes; anything
/// shorter than an errno is a torn pipe.
fn decode_failure(n: usize, buf: [u8; REPORT_SIZE]) -> ChildError {
    if n >= REPORT_SIZE {
        return ErrorReport::from_bytes(buf).into();
    }
    if n >= LEGACY_ERRNO_SIZE {
        return ChildError {
            errno: legacy_errno(&buf) as u16,
            location: None,
            index: 0,
        };
    }
    ChildError {
        errno: libc::EPIPE as u16,
        location: None,
        index: 0,
    }
}

/// SIGKILL plus a reap so no zombie outlives a failed launch.
fn kill_and_reap(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        let mut status: c_int = 0;
        loop {
            let r = libc::waitpid(pid, &mut status, 0);
            if r >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_prefers_full_report() {
        let rep = ErrorReport {
            errno: libc::ENOENT as u16,
            location: Location::Execve as u16,
            index: 0,
        };
        let err = decode_failure(REPORT_SIZE, rep.to_bytes());
        assert_eq!(err.location, Some(Location::Execve));
        assert_eq!(err.errno, libc::ENOENT as u16);
    }

    #[test]
    fn decode_legacy_errno() {
        let mut buf = [0u8; REPORT_SIZE];
        buf[..4].copy_from_slice(&(libc::EACCES as c_int).to_ne_bytes());
        let err = decode_failure(LEGACY_ERRNO_SIZE, buf);
        assert_eq!(err.errno, libc::EACCES as u16);
        assert_eq!(err.location, None);
    }

    #[test]
    fn decode_short_read_is_epipe() {
        let err = decode_failure(1, [0u8; REPORT_SIZE]);
        assert_eq!(err.errno, libc::EPIPE as u16);
    }

    #[test]
    fn id_map_formatting() {
        let maps = vec![
            IdMap {
                container_id: 0,
                host_id: 1000,
                size: 1,
            },
            IdMap {
                container_id: 2,
                host_id: 2000,
                size: 10,
            },
        ];
        assert_eq!(format_id_maps(&maps), "0 1000 1\n2 2000 10\n");
    }
}
