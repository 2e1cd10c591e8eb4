//! Local-socket messaging: sequenced-packet connections with peer
//! credentials and single-descriptor passing, fanned out as signals.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use log::{debug, error, warn};

use crate::event::PollEvent;
use crate::ready::Ready;
use crate::runtime::Runtime;
use crate::signal::Signal;
use crate::sys::socket::Socket;

pub use crate::sys::socket::Credentials;

const RECV_BUFFER: usize = 64 * 1024;

/// One received message: the packet payload plus the descriptor that
/// rode along, if any. The descriptor is shared between slots; the last
/// holder to drop it closes it.
#[derive(Debug, Clone)]
pub struct Message {
    pub data: Vec<u8>,
    pub fd: Option<Arc<OwnedFd>>,
}

/// The connecting end of a local seqpacket socket.
///
/// `connect` completes the transport, records the peer's credentials and
/// raises `connected`; incoming packets surface through `new_message`;
/// loss of the peer collapses into `disconnected`.
pub struct ClientSocket {
    inner: Arc<ClientInner>,

    /// `(fd, peer address, peer credentials)` once the transport is up.
    pub connected: Signal<(RawFd, PathBuf, Credentials)>,
    /// `(fd, message)` per received packet.
    pub new_message: Signal<(RawFd, Message)>,
    /// `(fd, bytes written)` per completed write.
    pub write_finished: Signal<(RawFd, usize)>,
    /// The connection is gone; carries the (now closed) fd for bookkeeping.
    pub disconnected: Signal<RawFd>,
}

struct ClientInner {
    runtime: Runtime,
    socket: Socket,
    connected: AtomicBool,
    watch: Mutex<Option<PollEvent>>,

    connected_signal: Signal<(RawFd, PathBuf, Credentials)>,
    new_message: Signal<(RawFd, Message)>,
    disconnected: Signal<RawFd>,
}

impl ClientSocket {
    pub fn new(runtime: &Runtime) -> io::Result<ClientSocket> {
        Ok(ClientSocket::wrap(runtime, Socket::seqpacket()?, false))
    }

    /// Adopt an already-connected socket (the server's accept path).
    fn from_accepted(runtime: &Runtime, socket: Socket) -> io::Result<ClientSocket> {
        let client = ClientSocket::wrap(runtime, socket, true);
        client.inner.socket.set_nonblocking(true)?;
        client.inner.start_watch()?;
        Ok(client)
    }

    fn wrap(runtime: &Runtime, socket: Socket, connected: bool) -> ClientSocket {
        let inner = Arc::new(ClientInner {
            runtime: runtime.clone(),
            socket,
            connected: AtomicBool::new(connected),
            watch: Mutex::new(None),
            connected_signal: Signal::new(),
            new_message: Signal::new(),
            disconnected: Signal::new(),
        });

        ClientSocket {
            connected: inner.connected_signal.clone(),
            new_message: inner.new_message.clone(),
            write_finished: Signal::new(),
            disconnected: inner.disconnected.clone(),
            inner,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.socket.as_raw_fd()
    }

    /// Connect to a listening socket at `path`. Blocks until the
    /// transport completes, then raises `connected` with the peer's
    /// credentials.
    pub fn connect<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        if self.is_connected() {
            error!("connect() on a socket that is already connected");
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "socket is already connected",
            ));
        }

        let path = path.as_ref();
        self.inner.socket.connect(path)?;
        self.inner.connected.store(true, Ordering::Release);

        let creds = self.inner.socket.peer_credentials()?;
        self.inner.socket.set_nonblocking(true)?;
        self.inner.start_watch()?;

        debug!(
            "connected to {:?} (peer pid {} uid {} gid {})",
            path, creds.pid, creds.uid, creds.gid
        );
        self.inner.connected_signal.emit(
            self.inner.runtime.queue(),
            (self.fd(), path.to_path_buf(), creds),
        );
        Ok(())
    }

    /// Send one packet, optionally passing one descriptor. Raises
    /// `write_finished` with the byte count on success.
    pub fn write(&self, buffer: &[u8], passfd: Option<RawFd>) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not connected",
            ));
        }

        let written = self.inner.socket.send_with_fd(buffer, passfd)?;
        self.write_finished
            .emit(self.inner.runtime.queue(), (self.fd(), written));
        Ok(written)
    }
}

impl ClientInner {
    /// Register the readiness watch; incoming packets and hangups then
    /// arrive through the loop.
    fn start_watch(self: &Arc<Self>) -> io::Result<()> {
        let watch = PollEvent::new(
            &self.runtime,
            self.socket.as_raw_fd(),
            Ready::readable() | Ready::hup(),
        )?;

        watch.activated.connect(self, |inner, &(_, flags)| {
            if flags.is_readable() {
                inner.read_ready();
            }
            if flags.is_hup() || flags.is_error() {
                inner.disconnect();
            }
        });

        *self.watch.lock().unwrap() = Some(watch);
        Ok(())
    }

    fn read_ready(&self) {
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            match self.socket.recv_with_fd(&mut buf) {
                Ok((0, None)) => {
                    // orderly shutdown from the peer
                    self.disconnect();
                    return;
                }
                Ok((len, fd)) => {
                    let message = Message {
                        data: buf[..len].to_vec(),
                        fd: fd.map(Arc::new),
                    };
                    self.new_message.emit(
                        self.runtime.queue(),
                        (self.socket.as_raw_fd(), message),
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.raw_os_error() == Some(libc::ECONNRESET) => {
                    self.disconnect();
                    return;
                }
                Err(e) => {
                    warn!("recvmsg failure: {}", e);
                    return;
                }
            }
        }
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }

        self.watch.lock().unwrap().take();
        let _ = self.socket.shutdown();
        self.disconnected
            .emit(self.runtime.queue(), self.socket.as_raw_fd());
    }
}

struct Peer {
    // taken when the peer is accepted; the record itself stays for
    // peer_data lookups until the connection drops
    socket: Option<Socket>,
    addr: PathBuf,
    creds: Credentials,
}

/// The listening end of a local seqpacket socket.
///
/// Accepted transports are not handed to user code directly: the server
/// records the peer and raises `new_peer_request`; the application
/// answers with [`ServerSocket::accept_peer_request`] or
/// [`ServerSocket::reject_peer_request`]. Accepted peers become internal
/// client sockets whose messages fan into `new_peer_message`.
pub struct ServerSocket {
    inner: Arc<ServerInner>,

    /// `(fd, peer address, peer credentials)` awaiting accept/reject.
    pub new_peer_request: Signal<(RawFd, PathBuf, Credentials)>,
    /// A peer was accepted and is ready for traffic.
    pub connected_peer: Signal<RawFd>,
    /// An accepted peer's connection dropped.
    pub disconnected_peer: Signal<RawFd>,
    /// `(fd, message)` from any accepted peer.
    pub new_peer_message: Signal<(RawFd, Message)>,
}

struct ServerInner {
    runtime: Runtime,
    socket: Socket,
    bound: AtomicBool,
    bound_path: Mutex<Option<PathBuf>>,
    watch: Mutex<Option<PollEvent>>,
    peers: Mutex<IndexMap<RawFd, Peer>>,
    connections: Mutex<IndexMap<RawFd, ClientSocket>>,

    new_peer_request: Signal<(RawFd, PathBuf, Credentials)>,
    connected_peer: Signal<RawFd>,
    disconnected_peer: Signal<RawFd>,
    new_peer_message: Signal<(RawFd, Message)>,
}

impl ServerSocket {
    pub fn new(runtime: &Runtime) -> io::Result<ServerSocket> {
        let inner = Arc::new(ServerInner {
            runtime: runtime.clone(),
            socket: Socket::seqpacket()?,
            bound: AtomicBool::new(false),
            bound_path: Mutex::new(None),
            watch: Mutex::new(None),
            peers: Mutex::new(IndexMap::new()),
            connections: Mutex::new(IndexMap::new()),
            new_peer_request: Signal::new(),
            connected_peer: Signal::new(),
            disconnected_peer: Signal::new(),
            new_peer_message: Signal::new(),
        });

        Ok(ServerSocket {
            new_peer_request: inner.new_peer_request.clone(),
            connected_peer: inner.connected_peer.clone(),
            disconnected_peer: inner.disconnected_peer.clone(),
            new_peer_message: inner.new_peer_message.clone(),
            inner,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.socket.as_raw_fd()
    }

    /// Create, bind and listen. Connection attempts then surface as
    /// `new_peer_request` signals.
    pub fn bind<P: AsRef<Path>>(&self, path: P, backlog: i32) -> io::Result<()> {
        if self.inner.bound.load(Ordering::Acquire) {
            error!("bind() on a socket that is already bound");
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "server socket is already bound",
            ));
        }

        let path = path.as_ref();
        self.inner.socket.bind(path)?;
        self.inner.socket.listen(backlog)?;
        self.inner.socket.set_nonblocking(true)?;
        self.inner.bound.store(true, Ordering::Release);
        *self.inner.bound_path.lock().unwrap() = Some(path.to_path_buf());

        let watch = PollEvent::new(&self.inner.runtime, self.fd(), Ready::readable())?;
        watch.activated.connect(&self.inner, |inner, &(_, flags)| {
            if flags.is_readable() {
                inner.accept_ready();
            }
        });
        *self.inner.watch.lock().unwrap() = Some(watch);

        debug!("listening on {:?}", path);
        Ok(())
    }

    /// Address and credentials recorded for a pending or accepted peer.
    pub fn peer_data(&self, fd: RawFd) -> Option<(PathBuf, Credentials)> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .get(&fd)
            .map(|peer| (peer.addr.clone(), peer.creds))
    }

    /// Promote a pending peer to a live connection.
    pub fn accept_peer_request(&self, fd: RawFd) -> io::Result<()> {
        let peer_socket = {
            let mut peers = self.inner.peers.lock().unwrap();
            peers
                .get_mut(&fd)
                .and_then(|peer| peer.socket.take())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no pending peer on that descriptor")
                })?
        };

        let connection = ClientSocket::from_accepted(&self.inner.runtime, peer_socket)?;

        connection
            .new_message
            .connect_signal(&self.inner.new_peer_message);
        connection
            .disconnected
            .connect(&self.inner, |inner, &fd| inner.drop_peer(fd));

        self.inner.connections.lock().unwrap().insert(fd, connection);
        self.inner
            .connected_peer
            .emit(self.inner.runtime.queue(), fd);
        Ok(())
    }

    /// Close and discard a pending peer.
    pub fn reject_peer_request(&self, fd: RawFd) {
        self.inner.peers.lock().unwrap().shift_remove(&fd);
    }

    /// Send one packet to an accepted peer.
    pub fn write(&self, fd: RawFd, buffer: &[u8], passfd: Option<RawFd>) -> io::Result<usize> {
        let connections = self.inner.connections.lock().unwrap();
        match connections.get(&fd) {
            Some(connection) => connection.write(buffer, passfd),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no accepted peer on that descriptor",
            )),
        }
    }
}

impl ServerInner {
    fn accept_ready(&self) {
        loop {
            let (socket, addr) = match self.socket.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failure: {}", e);
                    return;
                }
            };

            let creds = match socket.peer_credentials() {
                Ok(creds) => creds,
                Err(e) => {
                    warn!("peer credential lookup failed: {}", e);
                    continue;
                }
            };

            let fd = socket.as_raw_fd();
            self.peers.lock().unwrap().insert(
                fd,
                Peer {
                    socket: Some(socket),
                    addr: addr.clone(),
                    creds,
                },
            );

            self.new_peer_request
                .emit(self.runtime.queue(), (fd, addr, creds));
        }
    }

    fn drop_peer(&self, fd: RawFd) {
        self.peers.lock().unwrap().shift_remove(&fd);
        self.connections.lock().unwrap().shift_remove(&fd);
        self.disconnected_peer.emit(self.runtime.queue(), fd);
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(path) = self.bound_path.lock().unwrap().take() {
            let _ = std::fs::remove_file(path);
        }
    }
}
