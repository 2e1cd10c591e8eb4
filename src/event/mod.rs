//! Typed facades over the event backend. Each wrapper owns a native
//! resource, registers it with the backend, and re-raises readiness
//! through signals so user slots always run on the loop thread.

mod file;
mod mount;
mod poll;
mod process;
mod timer;

pub use file::{FileEvent, FileFlags};
pub use mount::MountEvent;
pub use poll::PollEvent;
pub use process::{ProcFlags, ProcessEvent};
pub use timer::TimerEvent;
