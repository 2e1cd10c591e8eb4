//! Raw OS wrappers. Everything above this module speaks `io::Result` and
//! opaque `u64` native flag words; everything below is syscalls.

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

pub mod fd;
pub mod pipe;
pub mod socket;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod eventfd;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod timerfd;

#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(feature = "force-poll")
))]
mod epoll;
#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(feature = "force-poll")
))]
pub use epoll::{
    from_native, to_native, Events, Selector, ERROR_FLAGS, PRIORITY_FLAGS, READ_FLAGS, WRITE_FLAGS,
};

#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ),
    not(feature = "force-poll")
))]
pub mod kqueue;
#[cfg(all(
    any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ),
    not(feature = "force-poll")
))]
pub use kqueue::{
    from_native, to_native, Events, Selector, ERROR_FLAGS, PRIORITY_FLAGS, READ_FLAGS, WRITE_FLAGS,
};

#[cfg(any(
    feature = "force-poll",
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))
))]
mod posix_poll;
#[cfg(any(
    feature = "force-poll",
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))
))]
pub use posix_poll::{
    from_native, to_native, Events, Selector, ERROR_FLAGS, PRIORITY_FLAGS, READ_FLAGS, WRITE_FLAGS,
};

/// Retry a syscall wrapper until it stops failing with `EINTR`.
pub fn retry_on_intr<T, F>(mut f: F) -> std::io::Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    loop {
        match f() {
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
