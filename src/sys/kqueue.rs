use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use crate::ready::Ready;

use super::syscall;

const MAX_EVENTS: usize = 1024;

/// Native flag words pack a `(actions, filter set, fflags)` triple:
/// bits 0..16 are `EV_*` action/flag bits, bits 16..32 a set of filter
/// selectors (kqueue filter identifiers are negative and cannot be
/// OR-ed), and bits 32..64 the filter-specific `fflags` word. For the
/// timer filter the top word carries the period in milliseconds instead.
const fn composite(actions: u16, filters: u16, fflags: u32) -> u64 {
    actions as u64 | (filters as u64) << 16 | (fflags as u64) << 32
}

pub const FILTER_READ: u16 = 0x01;
pub const FILTER_WRITE: u16 = 0x02;
pub const FILTER_VNODE: u16 = 0x04;
pub const FILTER_PROC: u16 = 0x08;
pub const FILTER_TIMER: u16 = 0x10;

pub const READ_FLAGS: u64 = composite(0, FILTER_READ, 0);
pub const WRITE_FLAGS: u64 = composite(0, FILTER_WRITE, 0);
pub const PRIORITY_FLAGS: u64 = composite(libc::EV_ERROR as u16, FILTER_READ, 0);
pub const ERROR_FLAGS: u64 = composite((libc::EV_ERROR | libc::EV_EOF) as u16, 0, 0);

fn extract_actions(flags: u64) -> u16 {
    flags as u16
}

fn extract_filters(flags: u64) -> u16 {
    (flags >> 16) as u16
}

fn extract_fflags(flags: u64) -> u32 {
    (flags >> 32) as u32
}

fn native_filter(bit: u16) -> libc::c_short {
    match bit {
        FILTER_READ => libc::EVFILT_READ,
        FILTER_WRITE => libc::EVFILT_WRITE,
        FILTER_VNODE => libc::EVFILT_VNODE,
        FILTER_PROC => libc::EVFILT_PROC,
        FILTER_TIMER => libc::EVFILT_TIMER,
        _ => unreachable!("unknown filter selector"),
    }
}

fn filter_bit(filter: libc::c_short) -> u16 {
    match filter {
        libc::EVFILT_READ => FILTER_READ,
        libc::EVFILT_WRITE => FILTER_WRITE,
        libc::EVFILT_VNODE => FILTER_VNODE,
        libc::EVFILT_PROC => FILTER_PROC,
        libc::EVFILT_TIMER => FILTER_TIMER,
        _ => 0,
    }
}

/// Flag word arming the timer filter with a period in milliseconds.
pub fn timer_flags(period_ms: u32, oneshot: bool) -> u64 {
    let actions = if oneshot { libc::EV_ONESHOT as u16 } else { 0 };
    composite(actions, FILTER_TIMER, period_ms)
}

/// Flag word selecting the vnode filter with the given `NOTE_*` set.
pub fn vnode_flags(fflags: u32) -> u64 {
    composite(libc::EV_CLEAR as u16, FILTER_VNODE, fflags)
}

/// Flag word selecting the proc filter with the given `NOTE_*` set.
pub fn proc_flags(fflags: u32) -> u64 {
    composite(libc::EV_CLEAR as u16, FILTER_PROC, fflags)
}

pub fn to_native(interest: Ready) -> u64 {
    let mut actions = 0u16;
    let mut filters = 0u16;

    if interest.is_readable() {
        filters |= FILTER_READ;
    }

    if interest.is_writable() {
        filters |= FILTER_WRITE;
    }

    if interest.is_hup() {
        actions |= libc::EV_EOF as u16;
    }

    if interest.is_error() {
        actions |= libc::EV_ERROR as u16;
    }

    composite(actions, filters, 0)
}

pub fn from_native(flags: u64) -> Ready {
    let actions = extract_actions(flags);
    let filters = extract_filters(flags);
    let mut kind = Ready::empty();

    if filters & FILTER_READ != 0 {
        kind |= Ready::readable();
    }

    if filters & FILTER_WRITE != 0 {
        kind |= Ready::writable();
    }

    if actions & libc::EV_ERROR as u16 != 0 {
        kind |= Ready::error();
    }

    if actions & libc::EV_EOF as u16 != 0 {
        kind |= Ready::hup();
    }

    kind
}

/// Readiness demultiplexer over `kqueue(2)`.
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    fn control(&self, ev: &mut libc::kevent) -> io::Result<()> {
        syscall!(kevent(self.kq, ev, 1, ptr::null_mut(), 0, ptr::null()))?;
        Ok(())
    }

    pub fn add(&self, fd: RawFd, mask: u64) -> io::Result<()> {
        let filters = extract_filters(mask);

        for bit in [
            FILTER_READ,
            FILTER_WRITE,
            FILTER_VNODE,
            FILTER_PROC,
            FILTER_TIMER,
        ] {
            if filters & bit == 0 {
                continue;
            }

            let mut ev = libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: native_filter(bit),
                flags: libc::EV_ADD | (extract_actions(mask) as _),
                fflags: if bit == FILTER_TIMER {
                    0
                } else {
                    extract_fflags(mask)
                },
                data: if bit == FILTER_TIMER {
                    extract_fflags(mask) as libc::intptr_t
                } else {
                    0
                },
                udata: ptr::null_mut(),
            };
            self.control(&mut ev)?;
        }

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, mask: u64) -> io::Result<()> {
        self.add(fd, mask)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut any = false;

        for bit in [
            FILTER_READ,
            FILTER_WRITE,
            FILTER_VNODE,
            FILTER_PROC,
            FILTER_TIMER,
        ] {
            let mut ev = libc::kevent {
                ident: fd as libc::uintptr_t,
                filter: native_filter(bit),
                flags: libc::EV_DELETE,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            };
            if self.control(&mut ev).is_ok() {
                any = true;
            }
        }

        if any {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        let timeout = libc::timespec {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
        };

        let cnt = match syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.events.as_mut_ptr(),
            events.events.capacity() as libc::c_int,
            if timeout_ms < 0 { ptr::null() } else { &timeout }
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
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

/// Observed `(fd, native flag word)` pairs from one wait.
pub struct Events {
    events: Vec<libc::kevent>,
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
        self.events.get(idx).map(|ev| {
            let actions = (ev.flags & (libc::EV_EOF | libc::EV_ERROR)) as u16;
            (
                ev.ident as RawFd,
                composite(actions, filter_bit(ev.filter), ev.fflags),
            )
        })
    }
}
