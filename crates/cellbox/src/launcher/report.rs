//! Child-side error taxonomy and the report wire format.
//!
//! The child cannot construct error values between fork and exec; it can
//! only write a fixed-size record to the sync socket and die. A report
//! is three native-endian u16s — errno, location tag, per-step index —
//! written in one message. The tags are numbered once, in child step
//! order, so reports stay stable across versions.

use std::fmt;
use std::io;
use std::mem;

/// Where in the child setup sequence a failure occurred.
///
/// Numbered 1..=32 in step order; 0 is reserved for "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Location {
    Clone = 1,
    CloseWrite,
    UnshareUserRead,
    GetPid,
    KeepCapability,
    SetGroups,
    SetGid,
    SetUid,
    Dup3,
    Fcntl,
    SetSid,
    Ioctl,
    MountRoot,
    MountTmpfs,
    MountChdir,
    Mount,
    MountMkdir,
    PivotRoot,
    Umount,
    Unlink,
    MountRootReadonly,
    Chdir,
    SetRlimit,
    SetNoNewPrivs,
    DropCapability,
    SetCap,
    PtraceMe,
    Stop,
    Seccomp,
    SyncWrite,
    SyncRead,
    Execve,
}

impl Location {
    pub fn from_u16(v: u16) -> Option<Self> {
        if (1..=Location::Execve as u16).contains(&v) {
            // SAFETY: repr(u16) with contiguous discriminants 1..=32.
            Some(unsafe { mem::transmute::<u16, Location>(v) })
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Location::Clone => "clone",
            Location::CloseWrite => "close_write",
            Location::UnshareUserRead => "unshare_user_read",
            Location::GetPid => "getpid",
            Location::KeepCapability => "keep_capability",
            Location::SetGroups => "setgroups",
            Location::SetGid => "setgid",
            Location::SetUid => "setuid",
            Location::Dup3 => "dup3",
            Location::Fcntl => "fcntl",
            Location::SetSid => "setsid",
            Location::Ioctl => "ioctl",
            Location::MountRoot => "mount(root)",
            Location::MountTmpfs => "mount(tmpfs)",
            Location::MountChdir => "mount(chdir)",
            Location::Mount => "mount",
            Location::MountMkdir => "mount(mkdir)",
            Location::PivotRoot => "pivot_root",
            Location::Umount => "umount",
            Location::Unlink => "unlink",
            Location::MountRootReadonly => "mount(readonly)",
            Location::Chdir => "chdir",
            Location::SetRlimit => "setrlimit",
            Location::SetNoNewPrivs => "set_no_new_privs",
            Location::DropCapability => "drop_capability",
            Location::SetCap => "set_cap",
            Location::PtraceMe => "ptrace_me",
            Location::Stop => "stop",
            Location::Seccomp => "seccomp",
            Location::SyncWrite => "sync_write",
            Location::SyncRead => "sync_read",
            Location::Execve => "execve",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 6-byte record the child writes to the sync socket on failure (and,
/// with all fields zero, as its rendezvous ack).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub errno: u16,
    pub location: u16,
    /// 0, or the per-step index: 1-based for mounts, 0-based for rlimits.
    pub index: u16,
}

pub const REPORT_SIZE: usize = mem::size_of::<ErrorReport>();
/// Size of the legacy bare-errno message (a platform int).
pub const LEGACY_ERRNO_SIZE: usize = mem::size_of::<libc::c_int>();

impl ErrorReport {
    pub fn to_bytes(self) -> [u8; REPORT_SIZE] {
        let mut out = [0u8; REPORT_SIZE];
        out[0..2].copy_from_slice(&self.errno.to_ne_bytes());
        out[2..4].copy_from_slice(&self.location.to_ne_bytes());
        out[4..6].copy_from_slice(&self.index.to_ne_bytes());
        out
    }

    pub fn from_bytes(buf: [u8; REPORT_SIZE]) -> Self {
        Self {
            errno: u16::from_ne_bytes([buf[0], buf[1]]),
            location: u16::from_ne_bytes([buf[2], buf[3]]),
            index: u16::from_ne_bytes([buf[4], buf[5]]),
        }
    }
}

/// A decoded child failure: `"<location>: <errno>"`, with the step index
/// when one was recorded (`"mount(2): no such file or directory"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildError {
    pub errno: u16,
    pub location: Option<Location>,
    pub index: u16,
}

impl std::error::Error for ChildError {}

impl From<ErrorReport> for ChildError {
    fn from(rep: ErrorReport) -> Self {
        Self {
            errno: rep.errno,
            location: Location::from_u16(rep.location),
            index: rep.index,
        }
    }
}

impl fmt::Display for ChildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc = self.location.map_or("unknown", Location::as_str);
        let err = io::Error::from_raw_os_error(i32::from(self.errno));
        if self.index > 0 {
            write!(f, "{loc}({}): {err}", self.index)
        } else {
            write!(f, "{loc}: {err}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_six_bytes_without_padding() {
        assert_eq!(REPORT_SIZE, 6);
    }

    #[test]
    fn report_round_trips() {
        let rep = ErrorReport {
            errno: libc::ENOENT as u16,
            location: Location::Mount as u16,
            index: 2,
        };
        assert_eq!(ErrorReport::from_bytes(rep.to_bytes()), rep);
    }

    #[test]
    fn location_round_trips() {
        for v in 1..=32u16 {
            let loc = Location::from_u16(v).unwrap();
            assert_eq!(loc as u16, v);
        }
        assert_eq!(Location::from_u16(0), None);
        assert_eq!(Location::from_u16(33), None);
    }

    #[test]
    fn tag_order_is_stable() {
        assert_eq!(Location::Clone as u16, 1);
        assert_eq!(Location::MountRoot as u16, 13);
        assert_eq!(Location::SetRlimit as u16, 23);
        assert_eq!(Location::Execve as u16, 32);
    }

    #[test]
    fn child_error_render() {
        let err = ChildError {
            errno: libc::ENOENT as u16,
            location: Some(Location::Mount),
            index: 2,
        };
        let text = err.to_string();
        assert!(text.starts_with("mount(2): "), "{text}");

        let err = ChildError {
            errno: libc::EACCES as u16,
            location: Some(Location::Execve),
            index: 0,
        };
        assert!(err.to_string().starts_with("execve: "));
    }
}
