use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;
use super::syscall;

/// A non-blocking, cloexec timerfd on the monotonic clock.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

#[derive(Debug, Clone, Default)]
pub struct TimerSpec {
    /// Repeat interval; zero disarms repetition.
    pub interval: Duration,
    /// Delay until first expiration; zero disarms the timer.
    pub value: Duration,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let timerfd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(timerfd) },
        })
    }

    pub fn settime(&self, value: TimerSpec) -> io::Result<TimerSpec> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(value.interval),
            it_value: duration_to_timespec(value.value),
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(TimerSpec {
            interval: timespec_to_duration(old_value.it_interval),
            value: timespec_to_duration(old_value.it_value),
        })
    }

    pub fn gettime(&self) -> io::Result<TimerSpec> {
        let mut itimerspec: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_gettime(self.inner.as_raw_fd(), &mut itimerspec))?;

        Ok(TimerSpec {
            interval: timespec_to_duration(itimerspec.it_interval),
            value: timespec_to_duration(itimerspec.it_value),
        })
    }

    /// Number of expirations since the last read. `WouldBlock` when the
    /// timer has not fired.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

fn timespec_to_duration(timespec: libc::timespec) -> Duration {
    Duration::new(timespec.tv_sec as u64, timespec.tv_nsec as u32)
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn arm_and_query() {
        let timerfd = TimerFd::new().unwrap();
        timerfd
            .settime(TimerSpec {
                interval: Duration::ZERO,
                value: Duration::from_secs(10),
            })
            .unwrap();

        let left = timerfd.gettime().unwrap();
        assert!(left.value <= Duration::from_secs(10));
        assert!(left.value > Duration::from_secs(8));
    }

    #[test]
    fn expiration_count() {
        let timerfd = TimerFd::new().unwrap();
        timerfd
            .settime(TimerSpec {
                interval: Duration::ZERO,
                value: Duration::from_millis(5),
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timerfd.read().unwrap(), 1);
    }
}
