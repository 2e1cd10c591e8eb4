//! An event-driven toolkit for multithreaded UNIX services: a typed
//! signal/slot object graph with cross-thread dispatch, one readiness
//! backend per process (epoll, kqueue or POSIX `poll`), local-socket
//! messaging with credential and descriptor passing, piped child
//! processes, and decoders for the local system's process and mount
//! tables.
//!
//! The [`Runtime`] is the per-process context: build one in `main`,
//! hand clones around, and let exactly one thread run [`Runtime::exec`].
//! Slots always run on that thread; any thread may emit.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use relay_io::{Runtime, Signal};
//!
//! struct Greeter;
//!
//! impl Greeter {
//!     fn greet(&self, name: &String) {
//!         println!("hello, {}", name);
//!     }
//! }
//!
//! let runtime = Runtime::new().unwrap();
//!
//! let greeted: Signal<String> = Signal::new();
//! let greeter = Arc::new(Greeter);
//! greeted.connect(&greeter, Greeter::greet);
//!
//! runtime.enqueue(&greeted, "world".to_string());
//!
//! let handle = runtime.clone();
//! runtime.single_shot(move || handle.quit(0));
//! assert_eq!(runtime.exec(), 0);
//! ```

mod backend;
mod queue;
mod ready;
mod runtime;
mod signal;
mod waker;

pub mod config;
pub mod event;
pub mod info;
pub mod process;
pub mod socket;
pub mod sys;

pub use backend::{Backend, Callback};
pub use queue::{SignalQueue, Task};
pub use ready::Ready;
pub use runtime::Runtime;
pub use signal::Signal;

pub use event::{FileEvent, FileFlags, MountEvent, PollEvent, ProcFlags, ProcessEvent, TimerEvent};
pub use process::{ChildProcess, State as ChildState};
pub use socket::{ClientSocket, Credentials, Message, ServerSocket};
