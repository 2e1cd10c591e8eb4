//! Seqpacket echo server: accepts every peer, logs its credentials, and
//! echoes each message back. Run, then talk to it with a seqpacket
//! client (or the library's `ClientSocket`) at the printed path.

use std::sync::{Arc, Mutex};

use relay_io::{Runtime, ServerSocket};

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/relay-echo.sock".to_string());
    let _ = std::fs::remove_file(&path);

    let runtime = Runtime::new().expect("runtime construction");
    let server = Arc::new(ServerSocket::new(&runtime).expect("server socket"));
    server.bind(&path, 16).expect("bind");
    println!("echo server listening on {}", path);

    // accept everyone
    server
        .new_peer_request
        .connect(&server, |server, &(fd, _, creds)| {
            println!(
                "peer request on fd {} from pid {} (uid {}, gid {})",
                fd, creds.pid, creds.uid, creds.gid
            );
            if let Err(e) = server.accept_peer_request(fd) {
                eprintln!("accept failed: {}", e);
            }
        });

    let echoed = Arc::new(Mutex::new(0usize));
    {
        let echoed = echoed.clone();
        server
            .new_peer_message
            .connect(&server, move |server, (fd, message)| {
                *echoed.lock().unwrap() += 1;
                if let Err(e) = server.write(*fd, &message.data, None) {
                    eprintln!("echo to fd {} failed: {}", fd, e);
                }
            });
    }

    server
        .disconnected_peer
        .connect_fn(|&fd| println!("peer on fd {} left", fd));

    std::process::exit(runtime.exec());
}
