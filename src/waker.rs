use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::sys::eventfd::EventFd;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
use crate::sys::fd::FileDesc;

/// Wakes a loop blocked in the kernel. Producers call [`Waker::wakeup`]
/// after making work available; the loop thread watches the fd and calls
/// [`Waker::finish`] to swallow the token.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<EventFd>,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: Arc::new(EventFd::new()?),
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }

    pub fn finish(&self) -> io::Result<()> {
        match self.inner.read() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Pipe-based waker for hosts without eventfd.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<(FileDesc, FileDesc)>,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        let (reader, writer) = crate::sys::pipe::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Waker {
            inner: Arc::new((reader, writer)),
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        use std::io::Write;
        match (&self.inner.1).write(&[1]) {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }

    pub fn finish(&self) -> io::Result<()> {
        use std::io::Read;
        let mut buf = [0u8; 64];
        loop {
            match (&self.inner.0).read(&mut buf) {
                Ok(n) if n == buf.len() => continue,
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.0.as_raw_fd()
    }
}
