//! Structured views of the local system: the process table, mount
//! tables, loaded modules, and block-device superblocks.

pub mod block;
pub mod fstable;
pub mod module;
pub mod mounts;
pub mod proclist;
pub mod procstat;

pub use block::{probe_ext, ExtKind, ExtProbe};
pub use fstable::FsEntry;
pub use module::{modules, Module};
pub use mounts::mounts;
pub use proclist::proclist;
pub use procstat::{procstat, ExecState, ProcessState};
