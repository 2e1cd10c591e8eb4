//! Server/client handshake, message exchange and descriptor passing
//! over a sequenced-packet local socket, driven on one runtime.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_io::{ClientSocket, Message, Runtime, ServerSocket};

fn step_until<F: Fn() -> bool>(rt: &Runtime, ready: F) {
    for _ in 0..40 {
        rt.step(Some(Duration::from_millis(100)));
        if ready() {
            return;
        }
    }
    panic!("condition not reached within the stepping budget");
}

fn stat_ino(fd: RawFd) -> u64 {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
    st.st_ino as u64
}

#[test]
fn handshake_messages_and_fd_passing() {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.sock");

    let server = ServerSocket::new(&rt).unwrap();
    server.bind(&path, 16).unwrap();

    let requests: Arc<Mutex<Vec<RawFd>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let requests = requests.clone();
        server
            .new_peer_request
            .connect_fn(move |&(fd, _, creds)| {
                assert_eq!(creds.uid, unsafe { libc::getuid() });
                requests.lock().unwrap().push(fd);
            });
    }

    let peer_messages: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let peer_messages = peer_messages.clone();
        server
            .new_peer_message
            .connect_fn(move |(_, message)| peer_messages.lock().unwrap().push(message.clone()));
    }

    // connect and let the accept path surface the request
    let client = ClientSocket::new(&rt).unwrap();

    let connected = Arc::new(Mutex::new(false));
    {
        let connected = connected.clone();
        client.connected.connect_fn(move |&(_, _, creds)| {
            assert_eq!(creds.pid, unsafe { libc::getpid() });
            *connected.lock().unwrap() = true;
        });
    }

    client.connect(&path).unwrap();
    assert!(client.is_connected());

    step_until(&rt, || !requests.lock().unwrap().is_empty());
    assert!(*connected.lock().unwrap());

    let peer_fd = requests.lock().unwrap()[0];
    assert!(server.peer_data(peer_fd).is_some());
    server.accept_peer_request(peer_fd).unwrap();
    rt.drain();

    // one write, one packet, one message
    client.write(b"ping", None).unwrap();
    step_until(&rt, || !peer_messages.lock().unwrap().is_empty());
    {
        let messages = peer_messages.lock().unwrap();
        assert_eq!(messages[0].data, b"ping");
        assert!(messages[0].fd.is_none());
    }

    // a zero-byte payload carrying a descriptor arrives as a message,
    // and the descriptor refers to the same inode
    let file = tempfile::tempfile().unwrap();
    client.write(b"", Some(file.as_raw_fd())).unwrap();
    step_until(&rt, || peer_messages.lock().unwrap().len() >= 2);
    {
        let messages = peer_messages.lock().unwrap();
        assert!(messages[1].data.is_empty());
        let received = messages[1].fd.as_ref().expect("descriptor should arrive");
        assert_eq!(stat_ino(received.as_raw_fd()), stat_ino(file.as_raw_fd()));
    }

    // server -> client direction
    let client_messages: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let client_messages = client_messages.clone();
        client
            .new_message
            .connect_fn(move |(_, message)| client_messages.lock().unwrap().push(message.data.clone()));
    }

    server.write(peer_fd, b"pong", None).unwrap();
    step_until(&rt, || !client_messages.lock().unwrap().is_empty());
    assert_eq!(client_messages.lock().unwrap()[0], b"pong");
}

#[test]
fn rejected_peers_are_closed_and_forgotten() {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reject.sock");

    let server = ServerSocket::new(&rt).unwrap();
    server.bind(&path, 4).unwrap();

    let requests: Arc<Mutex<Vec<RawFd>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let requests = requests.clone();
        server
            .new_peer_request
            .connect_fn(move |&(fd, _, _)| requests.lock().unwrap().push(fd));
    }

    let client = ClientSocket::new(&rt).unwrap();
    client.connect(&path).unwrap();

    step_until(&rt, || !requests.lock().unwrap().is_empty());

    let peer_fd = requests.lock().unwrap()[0];
    server.reject_peer_request(peer_fd);
    assert!(server.peer_data(peer_fd).is_none());

    // writing to a never-accepted peer is refused
    assert!(server.write(peer_fd, b"x", None).is_err());
}

#[test]
fn peer_disconnect_surfaces_as_a_signal() {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hup.sock");

    let server = ServerSocket::new(&rt).unwrap();
    server.bind(&path, 4).unwrap();

    let requests: Arc<Mutex<Vec<RawFd>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let requests = requests.clone();
        server
            .new_peer_request
            .connect_fn(move |&(fd, _, _)| requests.lock().unwrap().push(fd));
    }

    let dropped: Arc<Mutex<Vec<RawFd>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let dropped = dropped.clone();
        server
            .disconnected_peer
            .connect_fn(move |&fd| dropped.lock().unwrap().push(fd));
    }

    let client = ClientSocket::new(&rt).unwrap();
    client.connect(&path).unwrap();
    step_until(&rt, || !requests.lock().unwrap().is_empty());

    let peer_fd = requests.lock().unwrap()[0];
    server.accept_peer_request(peer_fd).unwrap();
    rt.drain();

    drop(client);
    step_until(&rt, || !dropped.lock().unwrap().is_empty());
    assert_eq!(dropped.lock().unwrap()[0], peer_fd);
}

#[test]
fn write_on_unconnected_socket_is_refused() {
    let rt = Runtime::new().unwrap();
    let client = ClientSocket::new(&rt).unwrap();
    assert!(client.write(b"nope", None).is_err());
}
