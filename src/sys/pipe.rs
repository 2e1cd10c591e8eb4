use std::io;

use super::fd::FileDesc;
use super::syscall;

/// A cloexec pipe pair `(reader, writer)`.
pub fn pair() -> io::Result<(FileDesc, FileDesc)> {
    let mut fds = [0; 2];

    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
        Ok(unsafe { (FileDesc::new(fds[0]), FileDesc::new(fds[1])) })
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        let (r, w) = unsafe { (FileDesc::new(fds[0]), FileDesc::new(fds[1])) };
        r.set_cloexec()?;
        w.set_cloexec()?;
        Ok((r, w))
    }
}
