//! Raw Linux ABI for the cellbox sandbox.
//!
//! This crate provides the thin kernel-facing layer that the sandbox
//! library builds on:
//!
//! - **seccomp** - BPF filter construction and the raw `seccomp(2)` call
//! - **securebits** - securebits and capability-drop constants/structs
//!
//! Everything here is `#[repr(C)]` structs, constants and single-syscall
//! wrappers; policy lives in the `cellbox` crate. For standard syscalls,
//! use libc directly.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod seccomp;
pub mod securebits;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
