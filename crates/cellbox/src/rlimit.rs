//! Kernel resource limits installed by the child before exec.
//!
//! [`RLimits`] is the caller-facing description (seconds and bytes);
//! [`RLimits::build`] lowers it to the per-resource soft/hard pairs the
//! child feeds to `prlimit64(2)`, in declaration order. Zeroed fields
//! elide their entry.

use std::fmt;

/// High-level limit description.
#[derive(Debug, Clone, Copy, Default)]
pub struct RLimits {
    /// CPU time in seconds (soft; SIGXCPU past it).
    pub cpu: u64,
    /// Hard CPU ceiling in seconds; raised to `cpu` if underspecified.
    pub cpu_hard: u64,
    /// Data segment size in bytes.
    pub data: u64,
    /// Output file size in bytes (SIGXFSZ past it).
    pub file_size: u64,
    /// Stack size in bytes.
    pub stack: u64,
    /// Address space in bytes.
    pub address_space: u64,
    /// Open file descriptor count.
    pub open_file: u64,
    /// Emit `(RLIMIT_CORE, 0, 0)`.
    pub disable_core: bool,
}

/// One `(resource, soft/hard)` pair, ready for `prlimit64`.
#[derive(Debug, Clone, Copy)]
pub struct RLimit {
    pub res: libc::c_int,
    pub rlim: libc::rlimit64,
}

fn rlim(cur: u64, max: u64) -> libc::rlimit64 {
    libc::rlimit64 {
        rlim_cur: cur,
        rlim_max: max,
    }
}

impl RLimits {
    /// Lower to per-resource pairs in a fixed order: cpu, data, fsize,
    /// stack, address space, nofile, core.
    pub fn build(&self) -> Vec<RLimit> {
        let mut ret = Vec::new();
        if self.cpu > 0 {
            let hard = self.cpu_hard.max(self.cpu);
            ret.push(RLimit {
                res: libc::RLIMIT_CPU as libc::c_int,
                rlim: rlim(self.cpu, hard),
            });
        }
        if self.data > 0 {
            ret.push(RLimit {
                res: libc::RLIMIT_DATA as libc::c_int,
                rlim: rlim(self.data, self.data),
            });
        }
        if self.file_size > 0 {
            ret.push(RLimit {
                res: libc::RLIMIT_FSIZE as libc::c_int,
                rlim: rlim(self.file_size, self.file_size),
            });
        }
        if self.stack > 0 {
            ret.push(RLimit {
                res: libc::RLIMIT_STACK as libc::c_int,
                rlim: rlim(self.stack, self.stack),
            });
        }
        if self.address_space > 0 {
            ret.push(RLimit {
                res: libc::RLIMIT_AS as libc::c_int,
                rlim: rlim(self.address_space, self.address_space),
            });
        }
        if self.open_file > 0 {
            ret.push(RLimit {
                res: libc::RLIMIT_NOFILE as libc::c_int,
                rlim: rlim(self.open_file, self.open_file),
            });
        }
        if self.disable_core {
            ret.push(RLimit {
                res: libc::RLIMIT_CORE as libc::c_int,
                rlim: rlim(0, 0),
            });
        }
        ret
    }
}

impl fmt::Display for RLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.res as u32 {
            libc::RLIMIT_CPU => write!(f, "CPU[{} s:{} s]", self.rlim.rlim_cur, self.rlim.rlim_max),
            libc::RLIMIT_NOFILE => {
                write!(f, "OpenFile[{}:{}]", self.rlim.rlim_cur, self.rlim.rlim_max)
            }
            libc::RLIMIT_DATA => write!(f, "Data[{}]", self.rlim.rlim_cur),
            libc::RLIMIT_FSIZE => write!(f, "File[{}]", self.rlim.rlim_cur),
            libc::RLIMIT_STACK => write!(f, "Stack[{}]", self.rlim.rlim_cur),
            libc::RLIMIT_AS => write!(f, "AddressSpace[{}]", self.rlim.rlim_cur),
            libc::RLIMIT_CORE => write!(f, "Core[{}]", self.rlim.rlim_cur),
            other => write!(f, "Resource({other})[{}]", self.rlim.rlim_cur),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_elide() {
        assert!(RLimits::default().build().is_empty());
    }

    #[test]
    fn cpu_hard_upgraded_to_soft() {
        let limits = RLimits {
            cpu: 10,
            cpu_hard: 2,
            ..RLimits::default()
        };
        let built = limits.build();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].rlim.rlim_cur, 10);
        assert_eq!(built[0].rlim.rlim_max, 10);
    }

    #[test]
    fn disable_core_emits_zero_pair() {
        let limits = RLimits {
            disable_core: true,
            ..RLimits::default()
        };
        let built = limits.build();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].res, libc::RLIMIT_CORE as libc::c_int);
        assert_eq!(built[0].rlim.rlim_cur, 0);
        assert_eq!(built[0].rlim.rlim_max, 0);
    }

    #[test]
    fn caller_order_preserved() {
        let limits = RLimits {
            cpu: 1,
            data: 2,
            open_file: 3,
            disable_core: true,
            ..RLimits::default()
        };
        let res: Vec<_> = limits.build().iter().map(|r| r.res).collect();
        assert_eq!(
            res,
            vec![
                libc::RLIMIT_CPU as libc::c_int,
                libc::RLIMIT_DATA as libc::c_int,
                libc::RLIMIT_NOFILE as libc::c_int,
                libc::RLIMIT_CORE as libc::c_int,
            ]
        );
    }

    #[test]
    fn display() {
        let limits = RLimits {
            cpu: 1,
            cpu_hard: 2,
            ..RLimits::default()
        };
        assert_eq!(limits.build()[0].to_string(), "CPU[1 s:2 s]");
    }
}
