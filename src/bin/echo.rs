//! Echo server: replies to every message with `Echo: <message>`.
//!
//! Usage: `echo [port]` (default 8080). Set `RUST_LOG=debug` for wire-level
//! detail.

use ember_ws::Server;
use log::{error, info};

fn main() {
    env_logger::init();

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8080);

    let mut server = match Server::bind(port, "") {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind port {}: {}", port, e);
            std::process::exit(1);
        }
    };

    server
        .on_connect(|conn| {
            info!("client #{} connected", conn.id());
        })
        .on_message(|conn, msg| {
            info!(
                "client #{} sent: {}",
                conn.id(),
                String::from_utf8_lossy(msg)
            );
            let mut reply = Vec::with_capacity(6 + msg.len());
            reply.extend_from_slice(b"Echo: ");
            reply.extend_from_slice(msg);
            if let Err(e) = conn.send(&reply) {
                error!("client #{}: send failed: {}", conn.id(), e);
            }
        })
        .on_close(|conn, clean| {
            info!(
                "client #{} closed ({})",
                conn.id(),
                if clean { "clean" } else { "unclean" }
            );
        })
        .on_error(|conn| {
            error!("client #{} error: {:?}", conn.id(), conn.last_error());
        });

    if let Err(e) = server.run() {
        error!("server failed: {}", e);
        std::process::exit(1);
    }
}
