use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use indexmap::IndexMap;
use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT, POLLPRI};

use crate::ready::Ready;

use super::syscall;

/// `poll(2)` takes the whole descriptor array on every call; cap it the
/// same way the richer backends cap events per wake.
const MAX_FDS: usize = 1024;

/// Native flag words are `poll(2)` event masks widened to 64 bits.
pub const READ_FLAGS: u64 = POLLIN as u16 as u64;
pub const WRITE_FLAGS: u64 = POLLOUT as u16 as u64;
pub const PRIORITY_FLAGS: u64 = (POLLPRI | POLLERR) as u16 as u64;
pub const ERROR_FLAGS: u64 = (POLLERR | POLLHUP) as u16 as u64;

pub fn to_native(interest: Ready) -> u64 {
    let mut kind: libc::c_short = 0;

    if interest.is_readable() {
        kind |= POLLIN;
    }

    if interest.is_writable() {
        kind |= POLLOUT;
    }

    if interest.is_hup() {
        kind |= POLLHUP;
    }

    if interest.is_error() {
        kind |= POLLERR;
    }

    kind as u16 as u64
}

pub fn from_native(flags: u64) -> Ready {
    let poll = flags as u16 as libc::c_short;
    let mut kind = Ready::empty();

    if poll & (POLLIN | POLLPRI) != 0 {
        kind |= Ready::readable();
    }

    if poll & POLLOUT != 0 {
        kind |= Ready::writable();
    }

    if poll & POLLERR != 0 {
        kind |= Ready::error();
    }

    if poll & POLLHUP != 0 {
        kind |= Ready::hup();
    }

    kind
}

/// Fallback readiness demultiplexer over POSIX `poll(2)`. The interest
/// set lives in user space and the pollfd array is rebuilt per wait.
pub struct Selector {
    interest: Mutex<IndexMap<RawFd, u64>>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            interest: Mutex::new(IndexMap::new()),
        })
    }

    pub fn add(&self, fd: RawFd, mask: u64) -> io::Result<()> {
        let mut interest = self.interest.lock().unwrap();
        if interest.len() >= MAX_FDS && !interest.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "poll selector capacity exhausted",
            ));
        }
        interest.insert(fd, mask);
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, mask: u64) -> io::Result<()> {
        self.add(fd, mask)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        match self.interest.lock().unwrap().shift_remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let mut pollfds: Vec<libc::pollfd> = {
            let interest = self.interest.lock().unwrap();
            interest
                .iter()
                .map(|(&fd, &mask)| libc::pollfd {
                    fd,
                    events: mask as u16 as libc::c_short,
                    revents: 0,
                })
                .collect()
        };

        events.observed.clear();

        let cnt = match syscall!(poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms
        )) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            other => other?,
        };

        if cnt > 0 {
            for pollfd in &pollfds {
                if pollfd.revents != 0 {
                    events
                        .observed
                        .push((pollfd.fd, pollfd.revents as u16 as u64));
                }
            }
        }

        Ok(events.observed.len())
    }
}

/// Observed `(fd, native flag word)` pairs from one wait.
pub struct Events {
    observed: Vec<(RawFd, u64)>,
}

impl Events {
    pub fn new() -> Events {
        Events {
            observed: Vec::with_capacity(MAX_FDS),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observed.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<(RawFd, u64)> {
        self.observed.get(idx).copied()
    }
}
