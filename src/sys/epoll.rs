use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;

use super::syscall;

const MAX_EVENTS: usize = 1024;

/// Native flag words are plain epoll event masks widened to 64 bits.
pub const READ_FLAGS: u64 = EPOLLIN as u32 as u64;
pub const WRITE_FLAGS: u64 = EPOLLOUT as u32 as u64;
pub const PRIORITY_FLAGS: u64 = (EPOLLPRI | EPOLLERR) as u32 as u64;
pub const ERROR_FLAGS: u64 = (EPOLLERR | EPOLLHUP | EPOLLRDHUP) as u32 as u64;

pub fn to_native(interest: Ready) -> u64 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_hup() {
        kind |= EPOLLHUP | EPOLLRDHUP;
    }

    if interest.is_error() {
        kind |= EPOLLERR;
    }

    kind as u32 as u64
}

pub fn from_native(flags: u64) -> Ready {
    let epoll = flags as u32 as libc::c_int;
    let mut kind = Ready::empty();

    if epoll & (EPOLLIN | EPOLLPRI) != 0 {
        kind |= Ready::readable();
    }

    if epoll & EPOLLOUT != 0 {
        kind |= Ready::writable();
    }

    if epoll & EPOLLERR != 0 {
        kind |= Ready::error();
    }

    if epoll & (EPOLLHUP | EPOLLRDHUP) != 0 {
        kind |= Ready::hup();
    }

    kind
}

/// Readiness demultiplexer over `epoll(7)`.
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { epfd })
    }

    pub fn add(&self, fd: RawFd, mask: u64) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: mask as u32,
            u64: fd as u64,
        };

        match syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info)) {
            Err(ref e) if e.raw_os_error() == Some(libc::EEXIST) => {
                syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    pub fn modify(&self, fd: RawFd, mask: u64) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: mask as u32,
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }

    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let cnt = match syscall!(epoll_wait(
            self.epfd,
            events.events.as_mut_ptr(),
            events.events.capacity() as i32,
            timeout_ms
        )) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            other => other?,
        };

        unsafe { events.events.set_len(cnt as usize) };
        Ok(cnt as usize)
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

/// Observed `(fd, native flag word)` pairs from one wait.
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn new() -> Events {
        Events {
            events: Vec::with_capacity(MAX_EVENTS),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<(RawFd, u64)> {
        self.events
            .get(idx)
            .map(|event| (event.u64 as RawFd, event.events as u64))
    }
}
