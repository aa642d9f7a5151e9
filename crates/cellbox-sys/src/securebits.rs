//! Securebits and capability-drop kernel ABI.
//!
//! The child launcher manipulates the process securebits twice: once to
//! keep capabilities across a setuid (so mounts still work after the
//! credential switch), and once to lock the process out of re-acquiring
//! privilege before exec. The constants mirror
//! `include/uapi/linux/securebits.h`; libc does not export them.

/// Disable privileges for uid 0.
pub const SECBIT_NOROOT: libc::c_ulong = 1 << 0;
pub const SECBIT_NOROOT_LOCKED: libc::c_ulong = 1 << 1;

/// Do not adjust capability sets on setuid.
pub const SECBIT_NO_SETUID_FIXUP: libc::c_ulong = 1 << 2;
pub const SECBIT_NO_SETUID_FIXUP_LOCKED: libc::c_ulong = 1 << 3;

/// Keep permitted capabilities across a uid change.
pub const SECBIT_KEEP_CAPS: libc::c_ulong = 1 << 4;
pub const SECBIT_KEEP_CAPS_LOCKED: libc::c_ulong = 1 << 5;

/// Securebits set before applying a credential: keep caps locked in, and
/// never let the kernel rearrange capability sets on setuid.
pub const KEEP_CAPS_ON_SETUID: libc::c_ulong =
    SECBIT_KEEP_CAPS_LOCKED | SECBIT_NO_SETUID_FIXUP | SECBIT_NO_SETUID_FIXUP_LOCKED;

/// Securebits set when dropping privilege for good: everything above plus
/// NOROOT, all locked.
pub const DROP_CAPS_LOCKED: libc::c_ulong =
    KEEP_CAPS_ON_SETUID | SECBIT_NOROOT | SECBIT_NOROOT_LOCKED;

pub const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CapUserHeader {
    pub version: u32,
    pub pid: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CapUserData {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}

/// Header for `capset(2)` clearing every capability set.
pub const DROP_CAP_HEADER: CapUserHeader = CapUserHeader {
    version: LINUX_CAPABILITY_VERSION_3,
    pid: 0,
};

/// Version-3 capset takes two data elements (caps 0..=63), all zeroed.
pub const DROP_CAP_DATA: [CapUserData; 2] = [
    CapUserData {
        effective: 0,
        permitted: 0,
        inheritable: 0,
    },
    CapUserData {
        effective: 0,
        permitted: 0,
        inheritable: 0,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_bits_superset_of_keep_bits() {
        assert_eq!(DROP_CAPS_LOCKED & KEEP_CAPS_ON_SETUID, KEEP_CAPS_ON_SETUID);
        assert_ne!(DROP_CAPS_LOCKED & SECBIT_NOROOT, 0);
        assert_ne!(DROP_CAPS_LOCKED & SECBIT_NOROOT_LOCKED, 0);
    }

    #[test]
    fn cap_user_data_is_kernel_sized() {
        assert_eq!(std::mem::size_of::<CapUserData>(), 12);
        assert_eq!(std::mem::size_of::<CapUserHeader>(), 8);
    }
}
