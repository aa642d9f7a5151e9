//! Register context of a seccomp trap, plus tracee memory reads.
//!
//! Reading a path argument means reading a C string out of the stopped
//! tracee. The fast path is `process_vm_readv` in page-sized chunks —
//! the first chunk capped at the next page boundary so a string that
//! ends just before an unmapped page never faults — falling back to
//! word-wise `PTRACE_PEEKDATA` on kernels without the syscall. The
//! fallback decision is sticky per tracer (an atomic flipped on the
//! first `ENOSYS`).

use std::io::{self, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

/// Capacity for path reads.
const STRING_MAX: usize = libc::PATH_MAX as usize;

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf is always callable; fall back to 4 KiB.
        let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ps > 0 {
            ps as usize
        } else {
            4096
        }
    })
}

/// Syscall-entry registers of a trapped task (x86-64 ABI: number in
/// `orig_rax`, arguments in rdi, rsi, rdx, r10, r8, r9).
pub struct TrapContext<'t> {
    pub pid: i32,
    regs: libc::user_regs_struct,
    dirty: bool,
    use_vm_readv: &'t AtomicBool,
}

#[cfg(target_arch = "x86_64")]
impl<'t> TrapContext<'t> {
    pub(super) fn fetch(pid: i32, use_vm_readv: &'t AtomicBool) -> io::Result<Self> {
        let regs = ptrace::getregs(Pid::from_raw(pid))
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(Self {
            pid,
            regs,
            dirty: false,
            use_vm_readv,
        })
    }

    /// Syscall number; `orig_rax`, because `rax` already holds the
    /// in-progress return value at a seccomp stop.
    pub fn syscall_no(&self) -> u64 {
        self.regs.orig_rax
    }

    pub fn arg0(&self) -> u64 {
        self.regs.rdi
    }

    pub fn arg1(&self) -> u64 {
        self.regs.rsi
    }

    pub fn arg2(&self) -> u64 {
        self.regs.rdx
    }

    pub fn arg3(&self) -> u64 {
        self.regs.r10
    }

    pub fn arg4(&self) -> u64 {
        self.regs.r8
    }

    pub fn arg5(&self) -> u64 {
        self.regs.r9
    }

    /// Return value the tracee will observe once the syscall is skipped.
    pub fn set_return_value(&mut self, retval: i64) {
        self.regs.rax = retval as u64;
        self.dirty = true;
    }

    /// Prevents the syscall from executing by making its number invalid
    /// (the kernel then delivers ENOSYS, which the rewritten return
    /// value overrides), and flushes the modified registers.
    pub(super) fn skip_syscall(&mut self) -> io::Result<()> {
        self.regs.orig_rax = u64::MAX;
        self.dirty = true;
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            ptrace::setregs(Pid::from_raw(self.pid), self.regs)
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            self.dirty = false;
        }
        Ok(())
    }

    /// The NUL-terminated string at `addr` in the tracee, empty on any
    /// read failure (a hostile tracee can pass any pointer).
    pub fn get_string(&self, addr: u64) -> String {
        let mut buf = vec![0u8; STRING_MAX];
        let pid = Pid::from_raw(self.pid);

        if self.use_vm_readv.load(Ordering::Relaxed) {
            match vm_read_str(pid, addr as usize, &mut buf) {
                Ok(()) => return string_to_nul(&buf),
                Err(Errno::ENOSYS) => {
                    let _ = self.use_vm_readv.compare_exchange(
                        true,
                        false,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
                Err(_) => {}
            }
        }

        buf.iter_mut().for_each(|b| *b = 0);
        match peek_read_str(pid, addr, &mut buf) {
            Ok(()) => string_to_nul(&buf),
            Err(_) => String::new(),
        }
    }
}

/// Reads up to `buf.len()` bytes with `process_vm_readv`, chunked so no
/// single read crosses a page boundary it does not need to; stops at the
/// first NUL or a zero-length read.
fn vm_read_str(pid: Pid, addr: usize, buf: &mut [u8]) -> Result<(), Errno> {
    let page = page_size();
    let len = buf.len();
    let mut total = 0usize;
    let mut next = page - (addr % page);
    if next == 0 {
        next = page;
    }

    while total < len {
        let want = next.min(len - total);
        let chunk = &mut buf[total..total + want];
        let n = {
            let mut local = [IoSliceMut::new(chunk)];
            let remote = [RemoteIoVec {
                base: addr + total,
                len: want,
            }];
            process_vm_readv(pid, &mut local, &remote)?
        };
        if n == 0 || buf[total..total + n].contains(&0) {
            break;
        }
        total += n;
        next = page;
    }
    Ok(())
}

/// Word-at-a-time `PTRACE_PEEKDATA` read, the portable fallback.
fn peek_read_str(pid: Pid, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
    let word = std::mem::size_of::<libc::c_long>();
    let mut off = 0usize;
    while off < buf.len() {
        let data = ptrace::read(pid, (addr as usize + off) as ptrace::AddressType)?;
        let bytes = data.to_ne_bytes();
        let n = word.min(buf.len() - off);
        buf[off..off + n].copy_from_slice(&bytes[..n]);
        if bytes[..n].contains(&0) {
            return Ok(());
        }
        off += n;
    }
    Ok(())
}

fn string_to_nul(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_stops_at_nul() {
        let buf = b"/etc/passwd\0garbage";
        assert_eq!(string_to_nul(buf), "/etc/passwd");
    }

    #[test]
    fn string_without_nul_takes_all() {
        assert_eq!(string_to_nul(b"abc"), "abc");
    }

    #[test]
    fn page_size_is_sane() {
        let ps = page_size();
        assert!(ps >= 512);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn first_chunk_respects_page_boundary() {
        // An address 5 bytes shy of a page edge must first read 5 bytes.
        let page = page_size();
        let addr = 3 * page - 5;
        let next = page - (addr % page);
        assert_eq!(next, 5);
    }
}
