//! Path policy: hierarchical file permission sets and syscall permit
//! counters, aggregated into the access decisions the ptrace supervisor
//! acts on.

mod counter;
mod fileset;
mod handler;

pub use counter::SyscallCounter;
pub use fileset::{FilePerm, FileSet, FileSets};
pub use handler::{AccessPolicy, PolicyAction, PolicyHandler};
