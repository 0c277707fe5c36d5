//! Broadcast server: every message is relayed to all connected clients,
//! prefixed with the sender's connection id.
//!
//! Usage: `broadcast [port]` (default 8080).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

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

    let clients: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let on_connect_clients = clients.clone();
    let on_close_clients = clients.clone();

    server
        .on_connect(move |conn| {
            let mut clients = on_connect_clients.lock().unwrap();
            clients.insert(conn.id());
            info!(
                "client #{} connected ({} total)",
                conn.id(),
                clients.len()
            );
        })
        .on_message(|conn, msg| {
            let mut relayed = format!("#{}: ", conn.id()).into_bytes();
            relayed.extend_from_slice(msg);
            conn.relay_all(&relayed);
        })
        .on_close(move |conn, clean| {
            let mut clients = on_close_clients.lock().unwrap();
            clients.remove(&conn.id());
            info!(
                "client #{} closed ({}, {} remaining)",
                conn.id(),
                if clean { "clean" } else { "unclean" },
                clients.len()
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
