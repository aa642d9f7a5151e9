//! Hierarchical file permission sets.
//!
//! A [`FileSet`] stores absolute paths and matches candidates
//! hierarchically; [`FileSets`] aggregates the four sets the sandbox
//! consults (writable ⊆ readable ⊆ statable, plus the soft-ban set that
//! turns a kill into a polite errno).

use std::collections::HashSet;

use crate::path::clean;

/// A set of paths with hierarchical lookup.
///
/// A candidate path matches when any of these holds:
/// - the exact path is in the set;
/// - an ancestor with a trailing `/` is in the set (`"/a/b/"` matches
///   everything under `/a/b`, and `/a/b` itself);
/// - the candidate's immediate parent has a `/*` wildcard entry
///   (`"/a/*"` matches `/a/x` but not `/a/x/y`);
/// - the whole filesystem was admitted (`add("/")`).
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    set: HashSet<String>,
    system_root: bool,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one path. `"/"` flips the system-root flag instead of
    /// storing an entry.
    pub fn add(&mut self, name: &str) {
        if name == "/" {
            self.system_root = true;
        } else {
            self.set.insert(name.to_owned());
        }
    }

    /// Adds many paths; relative ones are rooted at `work_path` and made
    /// directory entries (trailing `/`).
    pub fn add_range(&mut self, names: &[String], work_path: &str) {
        for n in names {
            if n.starts_with('/') {
                self.add(n);
            } else {
                let trimmed = work_path.trim_end_matches('/');
                self.set.insert(format!("{trimmed}/{n}/"));
            }
        }
    }

    /// Hierarchical membership test, see the type docs.
    pub fn matches(&self, name: &str) -> bool {
        if self.system_root || self.set.contains(name) {
            return true;
        }
        // Wildcard on the immediate parent.
        if let Some(parent) = parent_dir(name) {
            let wildcard = if parent == "/" {
                "/*".to_owned()
            } else {
                format!("{parent}/*")
            };
            if self.set.contains(&wildcard) {
                return true;
            }
        }
        // The path itself or any ancestor as a directory entry.
        let mut cur = name.to_owned();
        loop {
            if self.set.contains(&format!("{cur}/")) {
                return true;
            }
            match parent_dir(&cur) {
                Some(p) if p != "/" => cur = p,
                _ => return false,
            }
        }
    }
}

/// Parent directory of an absolute path; `None` at or above the root.
fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_owned()),
        Some(i) => Some(trimmed[..i].to_owned()),
        None => None,
    }
}

/// Permission level attached to a path grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePerm {
    Write,
    Read,
    Stat,
}

/// The four permission sets consulted by the ptrace path checks.
///
/// A write grant implies read, a read grant implies stat. On a denied
/// access the soft-ban set decides between failing the syscall with an
/// errno and killing the program.
#[derive(Debug, Clone, Default)]
pub struct FileSets {
    pub writable: FileSet,
    pub readable: FileSet,
    pub statable: FileSet,
    pub soft_ban: FileSet,
}

impl FileSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, perm: FilePerm) {
        match perm {
            FilePerm::Write => self.writable.add(name),
            FilePerm::Read => self.readable.add(name),
            FilePerm::Stat => self.statable.add(name),
        }
    }

    pub fn is_writable(&self, name: &str) -> bool {
        self.writable.matches(name) || self.writable.matches(&clean(name))
    }

    pub fn is_readable(&self, name: &str) -> bool {
        self.is_writable(name) || self.readable.matches(name) || self.readable.matches(&clean(name))
    }

    pub fn is_statable(&self, name: &str) -> bool {
        self.is_readable(name) || self.statable.matches(name) || self.statable.matches(&clean(name))
    }

    pub fn is_soft_banned(&self, name: &str) -> bool {
        self.soft_ban.matches(name) || self.soft_ban.matches(&clean(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> FileSet {
        let mut s = FileSet::new();
        for e in entries {
            s.add(e);
        }
        s
    }

    #[test]
    fn exact_match() {
        let s = set(&["/etc/passwd"]);
        assert!(s.matches("/etc/passwd"));
        assert!(!s.matches("/etc/shadow"));
    }

    #[test]
    fn directory_entry_matches_subtree() {
        let s = set(&["/a/b/"]);
        assert!(s.matches("/a/b/c/d"));
        assert!(s.matches("/a/b"));
        assert!(!s.matches("/a/x"));
    }

    #[test]
    fn wildcard_matches_single_level() {
        let s = set(&["/a/*"]);
        assert!(s.matches("/a/x"));
        assert!(!s.matches("/a/x/y"));
        assert!(!s.matches("/b/x"));
    }

    #[test]
    fn root_wildcard() {
        let s = set(&["/*"]);
        assert!(s.matches("/x"));
        assert!(!s.matches("/x/y"));
    }

    #[test]
    fn system_root_admits_everything() {
        let s = set(&["/"]);
        assert!(s.matches("/"));
        assert!(s.matches("/usr/bin/cc"));
    }

    #[test]
    fn write_implies_read_implies_stat() {
        let mut sets = FileSets::new();
        sets.add("/work/", FilePerm::Write);
        assert!(sets.is_writable("/work/a.out"));
        assert!(sets.is_readable("/work/a.out"));
        assert!(sets.is_statable("/work/a.out"));
        assert!(!sets.is_writable("/etc/passwd"));
    }

    #[test]
    fn lookup_also_tries_cleaned_path() {
        let mut sets = FileSets::new();
        sets.add("/etc/passwd", FilePerm::Read);
        assert!(sets.is_readable("/etc//passwd"));
        assert!(sets.is_readable("/etc/./passwd"));
    }

    #[test]
    fn relative_entries_rooted_at_work_path() {
        let mut s = FileSet::new();
        s.add_range(&["data".into(), "/abs".into()], "/work");
        assert!(s.matches("/work/data/input.txt"));
        assert!(s.matches("/abs"));
    }
}
