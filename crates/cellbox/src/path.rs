//! Lexical path handling for policy checks.
//!
//! Paths read out of tracee memory are untrusted bytes; before the policy
//! sees them they are absolutized against the tracee's current directory
//! and lexically cleaned (no filesystem access, symlinks are the soft-ban
//! set's problem).

use std::fs;

/// Lexically cleans an absolute path: collapses `//` and `.`, resolves
/// `..` against its parent, never escapes `/`. Relative input is returned
/// unchanged.
pub fn clean(path: &str) -> String {
    if !path.starts_with('/') {
        return path.to_owned();
    }
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return "/".to_owned();
    }
    let mut out = String::with_capacity(path.len());
    for p in parts {
        out.push('/');
        out.push_str(p);
    }
    out
}

/// Current working directory of a process, via `/proc/<pid>/cwd`; empty
/// string when unreadable (the process may already be gone).
pub fn proc_cwd(pid: i32) -> String {
    let link = if pid > 0 {
        format!("/proc/{pid}/cwd")
    } else {
        "/proc/self/cwd".to_owned()
    };
    match fs::read_link(link) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => String::new(),
    }
}

/// Absolutizes `path` from the viewpoint of `pid`: relative paths are
/// joined onto the tracee's cwd, everything is cleaned.
pub fn abs_path(pid: i32, path: &str) -> String {
    if path.starts_with('/') {
        clean(path)
    } else if path.is_empty() {
        clean(&proc_cwd(pid))
    } else {
        clean(&format!("{}/{}", proc_cwd(pid), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses() {
        assert_eq!(clean("/a//b/./c"), "/a/b/c");
        assert_eq!(clean("/a/b/../c"), "/a/c");
        assert_eq!(clean("/../.."), "/");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("/a/"), "/a");
    }

    #[test]
    fn clean_leaves_relative_alone() {
        assert_eq!(clean("a/../b"), "a/../b");
    }

    #[test]
    fn abs_path_joins_cwd() {
        let joined = abs_path(0, "some/file");
        assert!(joined.starts_with('/'));
        assert!(joined.ends_with("/some/file"));
        assert_eq!(abs_path(0, "/etc/passwd"), "/etc/passwd");
    }
}
