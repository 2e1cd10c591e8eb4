use std::io::{self, ErrorKind};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use libc::{c_int, c_void};

use super::fd::FileDesc;
use super::syscall;

/// Identity of the process on the other end of a local socket, captured
/// from the kernel at connect/accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// A Unix-domain sequenced-packet socket. The kernel preserves packet
/// boundaries, so one `send` is one message on the wire.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn seqpacket() -> io::Result<Socket> {
        Socket::new_raw(libc::AF_UNIX, libc::SOCK_SEQPACKET)
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        match syscall!(socket(fam, ty | libc::SOCK_CLOEXEC, 0)) {
            Ok(fd) => return Ok(Socket(unsafe { FileDesc::new(fd) })),
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {}
            Err(e) => return Err(e),
        }

        let fd = syscall!(socket(fam, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    // no SOCK_CLOEXEC on Darwin
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(fam, ty, 0))?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;
        Ok(Socket(fd))
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    pub fn pair() -> io::Result<(Socket, Socket)> {
        let mut fds = [0, 0];

        syscall!(socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr()
        ))?;

        Ok(unsafe {
            (
                Socket(FileDesc::new(fds[0])),
                Socket(FileDesc::new(fds[1])),
            )
        })
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub fn pair() -> io::Result<(Socket, Socket)> {
        let mut fds = [0, 0];

        syscall!(socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET,
            0,
            fds.as_mut_ptr()
        ))?;

        let (a, b) = unsafe {
            (
                Socket(FileDesc::new(fds[0])),
                Socket(FileDesc::new(fds[1])),
            )
        };
        a.0.set_cloexec()?;
        b.0.set_cloexec()?;
        Ok((a, b))
    }

    pub fn bind(&self, path: &Path) -> io::Result<()> {
        let (addr, len) = unix_addr(path)?;
        syscall!(bind(
            self.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), backlog))?;
        Ok(())
    }

    pub fn connect(&self, path: &Path) -> io::Result<()> {
        let (addr, len) = unix_addr(path)?;
        super::retry_on_intr(|| {
            syscall!(connect(
                self.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                len
            ))
        })?;
        Ok(())
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    pub fn accept(&self) -> io::Result<(Socket, PathBuf)> {
        let mut storage: libc::sockaddr_un = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;

        let res = super::retry_on_intr(|| {
            syscall!(accept4(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC
            ))
        });

        let fd = match res {
            Ok(fd) => unsafe { FileDesc::new(fd) },
            Err(ref e) if e.raw_os_error() == Some(libc::ENOSYS) => {
                let fd = super::retry_on_intr(|| {
                    syscall!(accept(
                        self.as_raw_fd(),
                        &mut storage as *mut _ as *mut libc::sockaddr,
                        &mut len
                    ))
                })?;
                let fd = unsafe { FileDesc::new(fd) };
                fd.set_cloexec()?;
                fd
            }
            Err(e) => return Err(e),
        };

        Ok((Socket(fd), addr_path(&storage, len)))
    }

    // no accept4 on Darwin either
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub fn accept(&self) -> io::Result<(Socket, PathBuf)> {
        let mut storage: libc::sockaddr_un = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;

        let fd = super::retry_on_intr(|| {
            syscall!(accept(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len
            ))
        })?;
        let fd = unsafe { FileDesc::new(fd) };
        fd.set_cloexec()?;

        Ok((Socket(fd), addr_path(&storage, len)))
    }

    /// Send one packet, optionally attaching one file descriptor as
    /// `SCM_RIGHTS` ancillary data.
    pub fn send_with_fd(&self, buf: &[u8], passfd: Option<RawFd>) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };

        let mut cmsg_buf = [0u8; CMSG_CAPACITY];
        let mut header: libc::msghdr = unsafe { mem::zeroed() };
        header.msg_iov = &mut iov;
        header.msg_iovlen = 1;

        if let Some(fd) = passfd {
            header.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
            header.msg_controllen = unsafe { libc::CMSG_SPACE(FD_PAYLOAD) } as _;

            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&header);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(FD_PAYLOAD) as _;
                (libc::CMSG_DATA(cmsg) as *mut c_int).write_unaligned(fd);
            }
        }

        let sent = super::retry_on_intr(|| syscall!(sendmsg(self.as_raw_fd(), &header, 0)))?;
        Ok(sent as usize)
    }

    /// Receive one packet. Returns the payload length (zero means the
    /// peer closed) and the received descriptor, if one rode along.
    pub fn recv_with_fd(&self, buf: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };

        let mut cmsg_buf = [0u8; CMSG_CAPACITY];
        let mut header: libc::msghdr = unsafe { mem::zeroed() };
        header.msg_iov = &mut iov;
        header.msg_iovlen = 1;
        header.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        header.msg_controllen = unsafe { libc::CMSG_SPACE(FD_PAYLOAD) } as _;

        let count =
            super::retry_on_intr(|| syscall!(recvmsg(self.as_raw_fd(), &mut header, 0)))?;

        let mut passed = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&header);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                    && (*cmsg).cmsg_len == libc::CMSG_LEN(FD_PAYLOAD) as _
                {
                    let fd = (libc::CMSG_DATA(cmsg) as *const c_int).read_unaligned();
                    passed = Some(OwnedFd::from_raw_fd(fd));
                    break;
                }
                cmsg = libc::CMSG_NXTHDR(&header, cmsg);
            }
        }

        Ok((count as usize, passed))
    }

    /// Credentials of the connected peer.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn peer_credentials(&self) -> io::Result<Credentials> {
        let mut cred: libc::ucred = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;

        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut c_void,
            &mut len
        ))?;

        Ok(Credentials {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        })
    }

    /// Credentials of the connected peer. The kernel interface here
    /// reports only uid/gid; pid is zero.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn peer_credentials(&self) -> io::Result<Credentials> {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;

        syscall!(getpeereid(self.as_raw_fd(), &mut uid, &mut gid))?;

        Ok(Credentials { pid: 0, uid, gid })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut raw: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;

        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut raw as *mut _ as *mut c_void,
            &mut len
        ))?;

        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_RDWR))?;
        Ok(())
    }
}

const FD_PAYLOAD: libc::c_uint = mem::size_of::<c_int>() as libc::c_uint;

// Room for one cmsghdr plus one aligned c_int on any supported platform.
const CMSG_CAPACITY: usize = mem::size_of::<libc::cmsghdr>() + 2 * mem::size_of::<usize>();

fn unix_addr(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "socket path exceeds the maximum address length",
        ));
    }
    if bytes.contains(&0) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "socket path contains an interior nul byte",
        ));
    }

    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let base = &addr as *const _ as usize;
    let path_off = addr.sun_path.as_ptr() as usize - base;
    Ok((addr, (path_off + bytes.len() + 1) as libc::socklen_t))
}

fn addr_path(addr: &libc::sockaddr_un, len: libc::socklen_t) -> PathBuf {
    use std::ffi::OsStr;

    let base = addr as *const _ as usize;
    let path_off = addr.sun_path.as_ptr() as usize - base;
    let path_len = (len as usize).saturating_sub(path_off);

    let bytes: Vec<u8> = addr.sun_path[..path_len]
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();

    PathBuf::from(OsStr::from_bytes(&bytes))
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pair_round_trip() {
        let (a, b) = Socket::pair().unwrap();
        let sent = a.send_with_fd(b"hello", None).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 64];
        let (len, fd) = b.recv_with_fd(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert!(fd.is_none());
    }

    #[test]
    fn packet_boundaries_preserved() {
        let (a, b) = Socket::pair().unwrap();
        a.send_with_fd(b"one", None).unwrap();
        a.send_with_fd(b"two!", None).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = b.recv_with_fd(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"one");
        let (len, _) = b.recv_with_fd(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"two!");
    }

    #[test]
    fn fd_passing_same_object() {
        let (a, b) = Socket::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        a.send_with_fd(b"", Some(file.as_raw_fd())).unwrap();

        let mut buf = [0u8; 8];
        let (len, fd) = b.recv_with_fd(&mut buf).unwrap();
        assert_eq!(len, 0);
        let fd = fd.expect("descriptor should ride along");

        let orig = stat_ino(file.as_raw_fd());
        let received = stat_ino(fd.as_raw_fd());
        assert_eq!(orig, received);
    }

    #[test]
    fn credentials_of_self() {
        let (a, _b) = Socket::pair().unwrap();
        let cred = a.peer_credentials().unwrap();
        assert_eq!(cred.uid, unsafe { libc::getuid() });
        #[cfg(any(target_os = "linux", target_os = "android"))]
        assert_eq!(cred.pid, unsafe { libc::getpid() });
    }

    fn stat_ino(fd: RawFd) -> u64 {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
        st.st_ino as u64
    }
}
