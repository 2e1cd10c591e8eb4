use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::Runtime;
use crate::signal::Signal;

/// A monotonic timer surfaced as a signal.
///
/// `start` arms the timer for a first expiration after `delay`, then
/// every `interval` if one is given. Expirations coalesce: however many
/// fire between two loop turns, `expired` is raised once per wakeup.
pub struct TimerEvent {
    runtime: Runtime,
    inner: Inner,

    pub expired: Signal<()>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
struct Inner {
    timer: Arc<crate::sys::timerfd::TimerFd>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl TimerEvent {
    pub fn new(runtime: &Runtime) -> io::Result<TimerEvent> {
        use std::os::unix::io::AsRawFd;

        use crate::sys::timerfd::TimerFd;

        let timer = Arc::new(TimerFd::new()?);
        let expired: Signal<()> = Signal::new();

        let queue = runtime.queue().clone();
        let signal = expired.clone();
        let reader = timer.clone();
        runtime.backend().add(
            timer.as_raw_fd(),
            crate::sys::READ_FLAGS,
            Arc::new(move |_, _| {
                // swallow the expiration count, then raise once
                while reader.read().is_ok() {}
                signal.emit(&queue, ());
            }),
        )?;

        Ok(TimerEvent {
            runtime: runtime.clone(),
            inner: Inner { timer },
            expired,
        })
    }

    pub fn start(&self, delay: Duration, interval: Option<Duration>) -> io::Result<()> {
        use crate::sys::timerfd::TimerSpec;

        // a zero initial value would disarm; round up to the tick
        let value = if delay.is_zero() {
            Duration::from_nanos(1)
        } else {
            delay
        };

        self.inner.timer.settime(TimerSpec {
            interval: interval.unwrap_or(Duration::ZERO),
            value,
        })?;
        Ok(())
    }

    pub fn stop(&self) -> io::Result<()> {
        use crate::sys::timerfd::TimerSpec;

        self.inner.timer.settime(TimerSpec::default())?;
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for TimerEvent {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        self.runtime
            .backend()
            .remove(self.inner.timer.as_raw_fd(), crate::sys::READ_FLAGS);
    }
}

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
struct Inner {
    ident: std::os::unix::io::RawFd,
    callback: crate::backend::Callback,
    mask: std::sync::Mutex<u64>,
}

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
impl TimerEvent {
    pub fn new(runtime: &Runtime) -> io::Result<TimerEvent> {
        use std::sync::atomic::{AtomicI32, Ordering};

        // EVFILT_TIMER idents share the fd namespace of the backend
        // table; hand out values no descriptor can collide with.
        static NEXT_IDENT: AtomicI32 = AtomicI32::new(i32::MAX / 2);

        let ident = NEXT_IDENT.fetch_add(1, Ordering::Relaxed);
        let expired: Signal<()> = Signal::new();

        let queue = runtime.queue().clone();
        let signal = expired.clone();
        let callback: crate::backend::Callback = Arc::new(move |_, _| {
            signal.emit(&queue, ());
        });

        Ok(TimerEvent {
            runtime: runtime.clone(),
            inner: Inner {
                ident,
                callback,
                mask: std::sync::Mutex::new(0),
            },
            expired,
        })
    }

    /// kqueue timers are periodic from registration, so the first
    /// expiration comes after the period: the delay-then-interval shape
    /// collapses to the interval (or to `delay` for one-shot use).
    pub fn start(&self, delay: Duration, interval: Option<Duration>) -> io::Result<()> {
        let period = interval.unwrap_or(delay).as_millis().max(1) as u32;
        let flags = crate::sys::kqueue::timer_flags(period, interval.is_none());

        let mut mask = self.inner.mask.lock().unwrap();
        if *mask != 0 {
            self.runtime.backend().remove(self.inner.ident, *mask);
            *mask = 0;
        }
        self.runtime
            .backend()
            .add(self.inner.ident, flags, self.inner.callback.clone())?;
        *mask = flags;
        Ok(())
    }

    pub fn stop(&self) -> io::Result<()> {
        let mut mask = self.inner.mask.lock().unwrap();
        if *mask != 0 {
            self.runtime.backend().remove(self.inner.ident, *mask);
            *mask = 0;
        }
        Ok(())
    }
}

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
impl Drop for TimerEvent {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
struct Inner {
    reader: crate::sys::fd::FileDesc,
    _writer: crate::sys::fd::FileDesc,
    timer: libc::timer_t,
}

// timer_t is an opaque kernel id; it is never dereferenced here
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
unsafe impl Send for Inner {}
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
unsafe impl Sync for Inner {}

// POSIX interval timer delivering to a notify thread that pokes a
// self-pipe; the backend watches the read end.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
impl TimerEvent {
    pub fn new(runtime: &Runtime) -> io::Result<TimerEvent> {
        use std::io::Read;
        use std::mem;
        use std::os::unix::io::AsRawFd;

        use crate::sys::{pipe, syscall};

        extern "C" fn notify(val: libc::sigval) {
            let fd = val.sival_ptr as usize as libc::c_int;
            let byte = 1u8;
            unsafe {
                libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }

        let (reader, writer) = pipe::pair()?;
        reader.set_nonblocking(true)?;

        let expired: Signal<()> = Signal::new();

        let queue = runtime.queue().clone();
        let signal = expired.clone();
        let drain = reader.try_clone()?;
        runtime.backend().add(
            reader.as_raw_fd(),
            crate::sys::READ_FLAGS,
            Arc::new(move |_, _| {
                let mut sink = [0u8; 16];
                while (&drain).read(&mut sink).is_ok() {}
                signal.emit(&queue, ());
            }),
        )?;

        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD;
        sev.sigev_value = libc::sigval {
            sival_ptr: writer.as_raw_fd() as usize as *mut libc::c_void,
        };
        sev.sigev_notify_function = Some(notify);

        let mut timer: libc::timer_t = unsafe { mem::zeroed() };
        syscall!(timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer))?;

        Ok(TimerEvent {
            runtime: runtime.clone(),
            inner: Inner {
                reader,
                _writer: writer,
                timer,
            },
            expired,
        })
    }

    pub fn start(&self, delay: Duration, interval: Option<Duration>) -> io::Result<()> {
        use crate::sys::syscall;

        let value = if delay.is_zero() {
            Duration::from_nanos(1)
        } else {
            delay
        };
        let interval = interval.unwrap_or(Duration::ZERO);

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: interval.as_secs() as libc::time_t,
                tv_nsec: interval.subsec_nanos() as libc::c_long,
            },
            it_value: libc::timespec {
                tv_sec: value.as_secs() as libc::time_t,
                tv_nsec: value.subsec_nanos() as libc::c_long,
            },
        };

        syscall!(timer_settime(
            self.inner.timer,
            0,
            &spec,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }

    pub fn stop(&self) -> io::Result<()> {
        use crate::sys::syscall;

        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        syscall!(timer_settime(
            self.inner.timer,
            0,
            &spec,
            std::ptr::null_mut()
        ))?;
        Ok(())
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    all(
        any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "openbsd",
            target_os = "netbsd"
        ),
        not(feature = "force-poll")
    )
)))]
impl Drop for TimerEvent {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        unsafe {
            libc::timer_delete(self.inner.timer);
        }
        self.runtime
            .backend()
            .remove(self.inner.reader.as_raw_fd(), crate::sys::READ_FLAGS);
    }
}

#[cfg(test)]
#[cfg(any(target_os = "linux", target_os = "android"))]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_expires_once() {
        let rt = Runtime::new().unwrap();
        let timer = TimerEvent::new(&rt).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            timer.expired.connect_fn(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        timer.start(Duration::from_millis(20), None).unwrap();
        rt.step(Some(Duration::from_millis(500)));

        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // nothing further without a rearm
        rt.step(Some(Duration::from_millis(50)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_keeps_firing_until_stopped() {
        let rt = Runtime::new().unwrap();
        let timer = TimerEvent::new(&rt).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            timer.expired.connect_fn(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        timer
            .start(Duration::from_millis(10), Some(Duration::from_millis(10)))
            .unwrap();

        rt.step(Some(Duration::from_millis(500)));
        rt.step(Some(Duration::from_millis(500)));
        assert!(hits.load(Ordering::SeqCst) >= 2);

        timer.stop().unwrap();
        // flush any expiration that raced the disarm, then expect quiet
        rt.step(Some(Duration::from_millis(30)));
        let settled = hits.load(Ordering::SeqCst);
        rt.step(Some(Duration::from_millis(50)));
        assert_eq!(hits.load(Ordering::SeqCst), settled);
    }
}
