//! The reactor: one listening socket, a bounded set of connections, one
//! thread
//!
//! Each loop iteration re-arms readiness interest (writable only while a
//! connection has queued bytes), blocks on the kernel, dispatches
//! read/write/error events, enforces handshake and close deadlines, and
//! sweeps closed slots. Everything, user callbacks included, runs on the
//! thread that called [`Server::run`]; a callback that blocks stalls the
//! whole server.

use std::io;
use std::net::SocketAddr;
#[cfg(target_os = "linux")]
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::MAX_CONNECTIONS;
use crate::connection::{Callbacks, Connection, ConnectionState, Relay};
use crate::error::Error;
use crate::stats::ServerStats;

const LISTENER: Token = Token(usize::MAX);
const LISTEN_BACKLOG: i32 = 128;
const DEFAULT_ADMISSION_LIMIT: usize = 50;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Per-socket TCP options applied to every accepted connection.
///
/// Options the running kernel does not support are skipped silently.
#[derive(Debug, Clone)]
pub struct TcpTuning {
    /// Disable Nagle's algorithm (TCP_NODELAY)
    pub nodelay: bool,
    /// Reduce delayed-ACK latency (TCP_QUICKACK, Linux only)
    pub quickack: bool,
    /// Enable keepalive probes (SO_KEEPALIVE)
    pub keepalive: bool,
    /// Idle time before the first probe (TCP_KEEPIDLE)
    pub keepalive_idle: Duration,
    /// Interval between probes (TCP_KEEPINTVL)
    pub keepalive_interval: Duration,
    /// Probes before the connection is dropped (TCP_KEEPCNT)
    pub keepalive_count: u32,
}

impl Default for TcpTuning {
    fn default() -> Self {
        Self {
            nodelay: false,
            quickack: false,
            keepalive: false,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_count: 5,
        }
    }
}

/// Cloneable handle that asks a running server to exit its loop.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy)]
struct EventInfo {
    token: usize,
    readable: bool,
    writable: bool,
    closed: bool,
    error: bool,
}

/// The WebSocket server. Construct with [`Server::bind`], configure with
/// the builder-style setters, attach callbacks, then call [`Server::run`].
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    scratch: Vec<EventInfo>,
    connections: Vec<Connection>,
    max_connections: usize,
    poll_timeout: Duration,
    tuning: TcpTuning,
    use_writev: bool,
    callbacks: Callbacks,
    stats: Arc<ServerStats>,
    relay: Arc<Relay>,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Create the listening socket and bind it. An empty `bind_addr` binds
    /// all interfaces. Bind or listen failure is fatal.
    pub fn bind(port: u16, bind_addr: &str) -> io::Result<Server> {
        let addr_str = if bind_addr.is_empty() {
            format!("0.0.0.0:{}", port)
        } else {
            format!("{}:{}", bind_addr, port)
        };
        let addr: SocketAddr = addr_str
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let mut listener = TcpListener::from_std(socket.into());
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            poll,
            events: Events::with_capacity(MAX_CONNECTIONS + 1),
            scratch: Vec::with_capacity(MAX_CONNECTIONS + 1),
            connections: Vec::with_capacity(MAX_CONNECTIONS),
            max_connections: DEFAULT_ADMISSION_LIMIT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            tuning: TcpTuning::default(),
            use_writev: true,
            callbacks: Callbacks::default(),
            stats: Arc::new(ServerStats::new()),
            relay: Arc::new(Relay::default()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    // --- Configuration (before run) ---

    /// Admission limit, clamped to the compile-time slot count.
    pub fn set_max_connections(&mut self, max: usize) -> &mut Self {
        self.max_connections = max.min(MAX_CONNECTIONS);
        self
    }

    pub fn set_poll_timeout_ms(&mut self, ms: u64) -> &mut Self {
        self.poll_timeout = Duration::from_millis(ms);
        self
    }

    pub fn set_tcp_tuning(&mut self, tuning: TcpTuning) -> &mut Self {
        self.tuning = tuning;
        self
    }

    /// Switch between the vectored (default) and scalar flush paths.
    pub fn set_use_writev(&mut self, enable: bool) -> &mut Self {
        self.use_writev = enable;
        self
    }

    // --- Callback slots (copied into every accepted connection) ---

    pub fn on_connect(&mut self, f: impl Fn(&mut Connection) + Send + Sync + 'static) -> &mut Self {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_message(
        &mut self,
        f: impl Fn(&mut Connection, &[u8]) + Send + Sync + 'static,
    ) -> &mut Self {
        self.callbacks.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_close(
        &mut self,
        f: impl Fn(&mut Connection, bool) + Send + Sync + 'static,
    ) -> &mut Self {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error(&mut self, f: impl Fn(&mut Connection) + Send + Sync + 'static) -> &mut Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_backpressure(
        &mut self,
        f: impl Fn(&mut Connection) + Send + Sync + 'static,
    ) -> &mut Self {
        self.callbacks.on_backpressure = Some(Arc::new(f));
        self
    }

    pub fn on_drain(&mut self, f: impl Fn(&mut Connection) + Send + Sync + 'static) -> &mut Self {
        self.callbacks.on_drain = Some(Arc::new(f));
        self
    }

    // --- Status ---

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Shared counters; safe to read from another thread.
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Handle for stopping the loop from a callback or another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.running.clone())
    }

    /// Ask the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    // --- Reactor loop ---

    /// Drive the reactor until [`stop`] is called. Blocking.
    ///
    /// [`stop`]: Server::stop
    pub fn run(&mut self) -> io::Result<()> {
        self.running.store(true, Ordering::Relaxed);
        info!("server starting");

        while self.running.load(Ordering::Relaxed) {
            self.update_interests()?;

            let wait_start = Instant::now();
            if let Err(e) = self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {}", e);
                return Err(e);
            }
            self.stats
                .record_poll_latency(wait_start.elapsed().as_micros() as u64);

            // copy event bits out so connections can be mutated during
            // dispatch
            self.scratch.clear();
            for event in self.events.iter() {
                self.scratch.push(EventInfo {
                    token: event.token().0,
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    closed: event.is_read_closed() || event.is_write_closed(),
                    error: event.is_error(),
                });
            }

            for i in 0..self.scratch.len() {
                let ev = self.scratch[i];
                if ev.token == LISTENER.0 {
                    if ev.readable {
                        self.accept_pending();
                    }
                    continue;
                }
                self.dispatch(ev);
            }

            self.drain_relay();
            self.enforce_timeouts();
            self.sweep_closed();
        }

        info!("server stopped");
        Ok(())
    }

    /// Deliver cross-connection messages queued by callbacks during
    /// dispatch. Unknown or non-open targets drop silently.
    fn drain_relay(&mut self) {
        for cmd in self.relay.take() {
            match cmd.target {
                Some(id) => {
                    if let Some(conn) = self.connections.iter_mut().find(|c| c.id() == id) {
                        if conn.state() == ConnectionState::Open {
                            let _ = conn.send(&cmd.payload);
                        }
                    }
                }
                None => {
                    for conn in &mut self.connections {
                        if conn.state() == ConnectionState::Open {
                            let _ = conn.send(&cmd.payload);
                        }
                    }
                }
            }
        }
    }

    /// Re-register any connection whose desired interest changed: readable
    /// always, writable only while bytes are queued. Re-registration also
    /// re-arms edge-triggered readiness.
    fn update_interests(&mut self) -> io::Result<()> {
        for conn in &mut self.connections {
            if conn.is_closed() {
                continue;
            }
            let want_writable = conn.has_data_to_send();
            if want_writable != conn.registered_writable {
                let interest = if want_writable {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                let token = Token(conn.id() as usize);
                self.poll
                    .registry()
                    .reregister(conn.stream_mut(), token, interest)?;
                conn.registered_writable = want_writable;
            }
        }
        Ok(())
    }

    /// Accept every pending connection, applying admission control to each.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.stats.is_overloaded(self.max_connections)
                        || self.connections.len() >= self.max_connections
                        || self.connections.len() >= MAX_CONNECTIONS
                    {
                        // accept-and-close keeps the backlog draining
                        self.stats
                            .rejected_connections
                            .fetch_add(1, Ordering::Relaxed);
                        debug!("rejected connection from {}: at capacity", peer);
                        drop(stream);
                        continue;
                    }

                    self.apply_tcp_tuning(&stream);

                    let mut conn = Connection::new(
                        stream,
                        self.callbacks.clone(),
                        self.stats.clone(),
                        self.relay.clone(),
                    );
                    let token = Token(conn.id() as usize);
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(conn.stream_mut(), token, Interest::READABLE)
                    {
                        error!("conn {}: register failed: {}", conn.id(), e);
                        self.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    debug!("conn {}: accepted from {}", conn.id(), peer);
                    self.connections.push(conn);
                    self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .active_connections
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, ev: EventInfo) {
        let conn = match self
            .connections
            .iter_mut()
            .find(|c| c.id() as usize == ev.token)
        {
            Some(conn) => conn,
            None => return, // reaped earlier this iteration
        };

        if ev.readable {
            if let Err(err) = conn.on_readable() {
                debug!("conn {}: read failed: {}", conn.id(), err);
                conn.abort(err);
                return;
            }
        }

        if ev.writable && !conn.is_closed() && conn.has_data_to_send() {
            let result = if self.use_writev {
                conn.on_writable()
            } else {
                conn.on_writable_scalar()
            };
            if let Err(err) = result {
                debug!("conn {}: write failed: {}", conn.id(), err);
                conn.abort(err);
                return;
            }
        }

        if (ev.closed || ev.error) && !conn.is_closed() {
            let _ = conn.close(1000);
        }
    }

    fn enforce_timeouts(&mut self) {
        for conn in &mut self.connections {
            if conn.is_handshake_timed_out() {
                debug!("conn {}: handshake deadline exceeded", conn.id());
                conn.abort(Error::Timeout);
            } else if conn.is_close_timed_out() {
                debug!("conn {}: close deadline exceeded", conn.id());
                conn.note_timeout();
                let _ = conn.close(1000);
            }
        }
    }

    /// Swap-remove every closed slot; ordering is not preserved.
    fn sweep_closed(&mut self) {
        let mut removed = 0u64;
        let mut i = 0;
        while i < self.connections.len() {
            if self.connections[i].is_closed() {
                let mut conn = self.connections.swap_remove(i);
                let _ = self.poll.registry().deregister(conn.stream_mut());
                removed += 1;
            } else {
                i += 1;
            }
        }
        if removed > 0 {
            self.stats
                .active_connections
                .fetch_sub(removed, Ordering::Relaxed);
        }
    }

    fn apply_tcp_tuning(&self, stream: &TcpStream) {
        let tuning = &self.tuning;
        let sock = socket2::SockRef::from(stream);

        if tuning.nodelay {
            if let Err(e) = sock.set_nodelay(true) {
                debug!("TCP_NODELAY not applied: {}", e);
            }
        }

        #[cfg(target_os = "linux")]
        if tuning.quickack {
            let opt: libc::c_int = 1;
            let rc = unsafe {
                libc::setsockopt(
                    stream.as_raw_fd(),
                    libc::IPPROTO_TCP,
                    libc::TCP_QUICKACK,
                    &opt as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                debug!("TCP_QUICKACK not applied");
            }
        }

        if tuning.keepalive {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(tuning.keepalive_idle)
                .with_interval(tuning.keepalive_interval)
                .with_retries(tuning.keepalive_count);
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                debug!("SO_KEEPALIVE not applied: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_port() {
        let server = Server::bind(0, "127.0.0.1").unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn builder_configuration() {
        let mut server = Server::bind(0, "127.0.0.1").unwrap();
        server
            .set_max_connections(1000)
            .set_poll_timeout_ms(10)
            .set_use_writev(false)
            .set_tcp_tuning(TcpTuning {
                nodelay: true,
                ..Default::default()
            });
        // admission limit is clamped to the compile-time slot count
        assert_eq!(server.max_connections, MAX_CONNECTIONS);
        assert_eq!(server.poll_timeout, Duration::from_millis(10));
        assert!(!server.use_writev);
        assert!(server.tuning.nodelay);
    }

    #[test]
    fn bind_conflict_is_fatal() {
        let first = Server::bind(0, "127.0.0.1").unwrap();
        let port = first.local_addr().unwrap().port();
        // SO_REUSEADDR does not allow two live listeners on one port
        assert!(Server::bind(port, "127.0.0.1").is_err());
    }

    #[test]
    fn stop_before_run_is_harmless() {
        let server = Server::bind(0, "127.0.0.1").unwrap();
        server.stop();
        server.shutdown_handle().stop();
    }
}
