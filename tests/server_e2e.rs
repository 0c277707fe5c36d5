//! End-to-end tests: a live server on loopback, plain TCP clients speaking
//! literal wire bytes.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use ember_ws::{Server, ServerStats, ShutdownHandle};

const UPGRADE_REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    \r\n";

const UPGRADE_RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
    \r\n";

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    stats: Arc<ServerStats>,
    join: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Spawn a server configured by `setup` on an ephemeral port.
    fn start(setup: impl FnOnce(&mut Server)) -> TestServer {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut server = Server::bind(0, "127.0.0.1").unwrap();
        server.set_poll_timeout_ms(20);
        setup(&mut server);

        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let stats = server.stats();
        let join = thread::spawn(move || {
            server.run().unwrap();
        });

        TestServer {
            addr,
            shutdown,
            stats,
            join: Some(join),
        }
    }

    fn connect_raw(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    /// Connect and complete the upgrade handshake, asserting the exact
    /// response literal.
    fn connect_ws(&self) -> TcpStream {
        let mut stream = self.connect_raw();
        stream.write_all(UPGRADE_REQUEST).unwrap();
        let mut response = vec![0u8; UPGRADE_RESPONSE.len()];
        stream.read_exact(&mut response).unwrap();
        assert_eq!(response, UPGRADE_RESPONSE);
        stream
    }

    fn wait_for_active(&self, n: u64) {
        for _ in 0..500 {
            if self.stats.active_connections.load(Ordering::Relaxed) == n {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!(
            "expected {} active connections, have {}",
            n,
            self.stats.active_connections.load(Ordering::Relaxed)
        );
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.stop();
        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}

fn masked_text_frame(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4]),
    );
    frame
}

#[test]
fn handshake_and_echo() {
    let server = TestServer::start(|s| {
        s.on_message(|conn, msg| {
            conn.send(msg).unwrap();
        });
    });

    let mut client = server.connect_ws();

    // masked "Hello", the RFC example bytes
    client
        .write_all(&[
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ])
        .unwrap();

    let mut echoed = [0u8; 7];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);

    let snapshot = server.stats.snapshot();
    assert_eq!(snapshot.messages_in, 1);
    assert_eq!(snapshot.messages_out, 1);
    assert_eq!(snapshot.total_connections, 1);
    assert_eq!(snapshot.handshake_errors, 0);
}

#[test]
fn ping_is_answered_with_pong() {
    let server = TestServer::start(|_| {});
    let mut client = server.connect_ws();

    client.write_all(&[0x89, 0x00]).unwrap();
    let mut pong = [0u8; 2];
    client.read_exact(&mut pong).unwrap();
    assert_eq!(pong, [0x8A, 0x00]);

    // a ping is not a message
    assert_eq!(server.stats.snapshot().messages_in, 0);
}

#[test]
fn client_close_reaps_connection() {
    let server = TestServer::start(|_| {});
    let mut client = server.connect_ws();
    server.wait_for_active(1);

    // close frame, status 1000
    client.write_all(&[0x88, 0x02, 0x03, 0xE8]).unwrap();

    // server shuts the socket down; the client observes EOF (or a reset)
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes after close", n),
    }
    server.wait_for_active(0);
}

#[test]
fn admission_rejects_over_limit() {
    let server = TestServer::start(|s| {
        s.set_max_connections(3);
    });

    let _c1 = server.connect_ws();
    let _c2 = server.connect_ws();
    let _c3 = server.connect_ws();
    server.wait_for_active(3);

    // the fourth TCP connect is accepted and immediately closed
    let mut rejected = server.connect_raw();
    let mut buf = [0u8; 1];
    match rejected.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes on rejected connection", n),
    }

    for _ in 0..500 {
        if server.stats.rejected_connections.load(Ordering::Relaxed) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(
        server.stats.rejected_connections.load(Ordering::Relaxed),
        1
    );
    assert_eq!(server.stats.active_connections.load(Ordering::Relaxed), 3);
}

#[test]
fn bad_handshake_counts_and_disconnects() {
    let server = TestServer::start(|_| {});
    let mut client = server.connect_raw();

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes after bad handshake", n),
    }

    for _ in 0..500 {
        if server.stats.handshake_errors.load(Ordering::Relaxed) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(server.stats.handshake_errors.load(Ordering::Relaxed), 1);
}

#[test]
fn relay_broadcasts_to_all_clients() {
    let server = TestServer::start(|s| {
        s.on_message(|conn, msg| {
            conn.relay_all(msg);
        });
    });

    let mut sender = server.connect_ws();
    let mut observer = server.connect_ws();
    server.wait_for_active(2);

    let frame = masked_text_frame(b"hi all", [0x11, 0x22, 0x33, 0x44]);
    sender.write_all(&frame).unwrap();

    let expected = [&[0x81u8, 0x06][..], b"hi all"].concat();
    for client in [&mut sender, &mut observer] {
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }
}

#[test]
fn scalar_write_path_echoes() {
    let server = TestServer::start(|s| {
        s.set_use_writev(false);
        s.on_message(|conn, msg| {
            conn.send_binary(msg).unwrap();
        });
    });

    let mut client = server.connect_ws();
    let frame = masked_text_frame(b"scalar", [9, 8, 7, 6]);
    client.write_all(&frame).unwrap();

    let mut got = [0u8; 8];
    client.read_exact(&mut got).unwrap();
    assert_eq!(&got[..2], &[0x82, 0x06]);
    assert_eq!(&got[2..], b"scalar");
}

#[test]
fn stats_track_bytes_both_directions() {
    let server = TestServer::start(|s| {
        s.on_message(|conn, msg| {
            conn.send(msg).unwrap();
        });
    });

    let mut client = server.connect_ws();
    client
        .write_all(&masked_text_frame(b"abc", [1, 2, 3, 4]))
        .unwrap();
    let mut got = [0u8; 5];
    client.read_exact(&mut got).unwrap();

    let snapshot = server.stats.snapshot();
    // request + one masked frame inbound, response + one frame outbound
    assert!(snapshot.bytes_in >= (UPGRADE_REQUEST.len() + 9) as u64);
    assert!(snapshot.bytes_out >= (UPGRADE_RESPONSE.len() + 5) as u64);
    assert!(snapshot.max_poll_latency_us >= snapshot.last_poll_latency_us);
}
