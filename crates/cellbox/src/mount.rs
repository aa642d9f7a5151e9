//! Mount plan: a fluent builder producing syscall-ready mount records.
//!
//! The child performs every mount itself, after unsharing the mount
//! namespace and (optionally) landing in a tmpfs that will become the
//! pivoted root. Because the child cannot allocate between fork and exec,
//! the builder lowers each [`Mount`] to a [`MountCall`] up front:
//! NUL-terminated strings, the flag word, the ancestor directories to
//! create, and whether the target must be a file node rather than a
//! directory (bind-mounting a regular file).

use std::ffi::CString;
use std::fmt;
use std::fs;
use std::io;

use thiserror::Error;

/// Default flags for bind mounts. MS_PRIVATE keeps the mount from
/// propagating back into the host namespace.
const BIND_FLAGS: libc::c_ulong =
    libc::MS_BIND | libc::MS_NOSUID | libc::MS_PRIVATE | libc::MS_REC;

/// Default flags for tmpfs and similar fresh filesystems.
const FS_FLAGS: libc::c_ulong = libc::MS_NOSUID | libc::MS_NOATIME | libc::MS_NODEV;

/// One mount the child must perform.
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub fs_type: String,
    pub data: String,
    pub flags: libc::c_ulong,
}

impl Mount {
    pub fn is_bind(&self) -> bool {
        self.flags & libc::MS_BIND != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & libc::MS_RDONLY != 0
    }

    pub fn is_tmpfs(&self) -> bool {
        self.fs_type == "tmpfs"
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rw = if self.is_read_only() { "ro" } else { "rw" };
        if self.is_bind() {
            write!(f, "bind[{}:{}:{}]", self.source, self.target, rw)
        } else if self.is_tmpfs() {
            write!(f, "tmpfs[{}]", self.target)
        } else if self.fs_type == "proc" {
            write!(f, "proc[{rw}]")
        } else {
            write!(
                f,
                "mount[{},{}:{}:{:x},{}]",
                self.fs_type, self.source, self.target, self.flags, self.data
            )
        }
    }
}

/// A mount lowered to raw `mount(2)` arguments, consumable without
/// allocation. `prefixes` holds every ancestor of `target` in
/// root-to-leaf order plus `target` itself; the child mkdirs them all,
/// except the last which becomes a file node under `make_node`.
#[derive(Debug, Clone)]
pub struct MountCall {
    pub source: CString,
    pub target: CString,
    pub fs_type: CString,
    pub data: Option<CString>,
    pub flags: libc::c_ulong,
    pub prefixes: Vec<CString>,
    pub make_node: bool,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("mount source {0:?}: {1}")]
    Source(String, io::Error),

    #[error("mount path {0:?} contains NUL")]
    Nul(String),
}

/// Builds the mount plan for a launch.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    pub mounts: Vec<Mount>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A minimal read-only rootfs: `/usr`, `/lib`, `/lib64`, `/bin` bound
    /// under the pivot target.
    pub fn default_rootfs() -> Self {
        Self::new()
            .with_bind("/usr", "usr", true)
            .with_bind("/lib", "lib", true)
            .with_bind("/lib64", "lib64", true)
            .with_bind("/bin", "bin", true)
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_mounts(mut self, mounts: impl IntoIterator<Item = Mount>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    /// Bind `source` from the host onto `target` (relative to the pivot
    /// target when pivoting).
    pub fn with_bind(mut self, source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        let mut flags = BIND_FLAGS;
        if read_only {
            flags |= libc::MS_RDONLY;
        }
        self.mounts.push(Mount {
            source: source.into(),
            target: target.into(),
            fs_type: String::new(),
            data: String::new(),
            flags,
        });
        self
    }

    /// Mount a tmpfs on `target` with the given mount data
    /// (e.g. `"size=64m,nr_inodes=4k"`).
    pub fn with_tmpfs(mut self, target: impl Into<String>, data: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            source: "tmpfs".into(),
            target: target.into(),
            fs_type: "tmpfs".into(),
            data: data.into(),
            flags: FS_FLAGS,
        });
        self
    }

    /// Mount a read-only proc on `proc`.
    pub fn with_proc(self) -> Self {
        self.with_proc_rw(false)
    }

    pub fn with_proc_rw(mut self, can_write: bool) -> Self {
        let mut flags = libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC;
        if !can_write {
            flags |= libc::MS_RDONLY;
        }
        self.mounts.push(Mount {
            source: "proc".into(),
            target: "proc".into(),
            fs_type: "proc".into(),
            data: String::new(),
            flags,
        });
        self
    }

    /// Drop bind mounts whose source does not exist on the host. Useful
    /// for optional system directories such as `/lib64`.
    pub fn filter_not_exist(mut self) -> Self {
        self.mounts.retain(|m| {
            !m.is_bind() || !matches!(fs::metadata(&m.source), Err(e) if e.kind() == io::ErrorKind::NotFound)
        });
        self
    }

    /// Lower every mount to its syscall-ready record.
    ///
    /// Bind sources are stat'ed here: a regular-file source marks the
    /// record `make_node`; a missing source is an error (call
    /// [`filter_not_exist`](Self::filter_not_exist) first if it should be
    /// dropped instead).
    pub fn build(self) -> Result<Vec<MountCall>, BuildError> {
        let mut ret = Vec::with_capacity(self.mounts.len());
        for m in &self.mounts {
            let make_node = if m.is_bind() {
                match fs::metadata(&m.source) {
                    Ok(meta) => !meta.is_dir(),
                    Err(e) => return Err(BuildError::Source(m.source.clone(), e)),
                }
            } else {
                false
            };
            ret.push(lower(m, make_node)?);
        }
        Ok(ret)
    }
}

impl fmt::Display for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mounts: ")?;
        for (i, m) in self.mounts.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

fn lower(m: &Mount, make_node: bool) -> Result<MountCall, BuildError> {
    let cstr = |s: &str| CString::new(s).map_err(|_| BuildError::Nul(s.to_owned()));
    let data = if m.data.is_empty() {
        None
    } else {
        Some(cstr(&m.data)?)
    };
    let prefixes = path_prefixes(&m.target)
        .into_iter()
        .map(|p| cstr(&p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MountCall {
        source: cstr(&m.source)?,
        target: cstr(&m.target)?,
        fs_type: cstr(&m.fs_type)?,
        data,
        flags: m.flags,
        prefixes,
        make_node,
    })
}

/// Every ancestor of `path` in root-to-leaf order, plus `path` itself:
/// `"a/b/c"` yields `["a", "a/b", "a/b/c"]`.
fn path_prefixes(path: &str) -> Vec<String> {
    let mut ret = Vec::new();
    for (i, b) in path.bytes().enumerate().skip(1) {
        if b == b'/' {
            ret.push(path[..i].to_owned());
        }
    }
    ret.push(path.to_owned());
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn prefixes_root_to_leaf() {
        assert_eq!(path_prefixes("a/b/c"), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(path_prefixes("/a/b"), vec!["/a", "/a/b"]);
        assert_eq!(path_prefixes("usr"), vec!["usr"]);
    }

    #[test]
    fn bind_flags() {
        let b = Builder::new().with_bind("/usr", "usr", true);
        let m = &b.mounts[0];
        assert!(m.is_bind());
        assert!(m.is_read_only());
        assert_eq!(m.flags & libc::MS_PRIVATE, libc::MS_PRIVATE);
        assert_eq!(m.flags & libc::MS_REC, libc::MS_REC);
        assert_eq!(m.flags & libc::MS_NOSUID, libc::MS_NOSUID);
    }

    #[test]
    fn tmpfs_and_proc_flags() {
        let b = Builder::new().with_tmpfs("tmp", "size=16m").with_proc();
        assert_eq!(b.mounts[0].flags, FS_FLAGS);
        assert!(!b.mounts[0].is_read_only());
        let proc = &b.mounts[1];
        assert!(proc.is_read_only());
        assert_eq!(proc.flags & libc::MS_NOEXEC, libc::MS_NOEXEC);
    }

    #[test]
    fn default_rootfs_targets() {
        let b = Builder::default_rootfs();
        let targets: Vec<_> = b.mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["usr", "lib", "lib64", "bin"]);
        assert!(b.mounts.iter().all(Mount::is_read_only));
    }

    #[test]
    fn file_bind_sets_make_node() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passwd");
        writeln!(fs::File::create(&file).unwrap(), "x").unwrap();

        let calls = Builder::new()
            .with_bind(file.to_str().unwrap(), "etc/passwd", true)
            .build()
            .unwrap();
        assert!(calls[0].make_node);
        assert_eq!(
            calls[0].prefixes.last().unwrap().to_str().unwrap(),
            "etc/passwd"
        );

        let calls = Builder::new()
            .with_bind(dir.path().to_str().unwrap(), "data", false)
            .build()
            .unwrap();
        assert!(!calls[0].make_node);
    }

    #[test]
    fn missing_source_errors_unless_filtered() {
        let b = Builder::new().with_bind("/definitely/not/here", "x", true);
        assert!(b.clone().build().is_err());
        assert!(b.filter_not_exist().build().unwrap().is_empty());
    }

    #[test]
    fn lowered_call_round_trips_args() {
        let calls = Builder::new()
            .with_tmpfs("w", "size=1m")
            .build()
            .unwrap();
        let c = &calls[0];
        assert_eq!(c.source.to_str().unwrap(), "tmpfs");
        assert_eq!(c.target.to_str().unwrap(), "w");
        assert_eq!(c.fs_type.to_str().unwrap(), "tmpfs");
        assert_eq!(c.data.as_ref().unwrap().to_str().unwrap(), "size=1m");
        assert_eq!(c.flags, FS_FLAGS);
    }

    #[test]
    fn display() {
        let b = Builder::new().with_bind("/usr", "usr", true).with_tmpfs("tmp", "");
        assert_eq!(b.to_string(), "Mounts: bind[/usr:usr:ro], tmpfs[tmp]");
    }
}
