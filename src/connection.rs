//! Per-connection protocol state machine and ring-buffered I/O
//!
//! A connection moves Handshaking → Open → Closing → Closed. The current
//! state is a pointer to a constant table of three function pointers
//! (data/send/close), so transitions are a pointer store and dispatch is one
//! indirect call, with no boxing and no allocation.
//!
//! All methods run on the reactor thread. User callbacks are invoked
//! synchronously from inside these methods and may call back into the
//! connection (`send`, `close`, ...) reentrantly; the callback slots are
//! cloned `Arc`s so the borrow of the connection itself stays free.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, trace};
use mio::net::TcpStream;

use crate::error::{Error, Result};
use crate::frame::{self, OpCode};
use crate::handshake;
use crate::mask::apply_mask;
use crate::ring::RingBuffer;
use crate::stats::ServerStats;
use crate::{
    CLOSE_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_FRAME_HEADER_SIZE, RX_BUFFER_SIZE, SCALAR_WRITE_CHUNK,
    TX_BUFFER_SIZE, TX_HIGH_WATERMARK, TX_LOW_WATERMARK,
};

/// Bytes of the receive ring inspected while waiting for the upgrade
/// request terminator.
const HANDSHAKE_SNAPSHOT: usize = 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the HTTP upgrade request
    Handshaking,
    /// WebSocket established, frames flowing
    Open,
    /// Close frame queued, waiting for the peer's
    Closing,
    /// Socket shut down; the reactor will reap this slot
    Closed,
}

/// Callback invoked with the connection alone.
pub type ConnFn = Arc<dyn Fn(&mut Connection) + Send + Sync>;
/// Callback invoked with a received message payload.
pub type MessageFn = Arc<dyn Fn(&mut Connection, &[u8]) + Send + Sync>;
/// Callback invoked when the connection closes; the flag is true for a
/// clean, application-initiated close.
pub type CloseFn = Arc<dyn Fn(&mut Connection, bool) + Send + Sync>;

/// The user callback slots. The server holds one set and clones it into
/// every accepted connection.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<ConnFn>,
    pub on_message: Option<MessageFn>,
    pub on_close: Option<CloseFn>,
    pub on_error: Option<ConnFn>,
    pub on_backpressure: Option<ConnFn>,
    pub on_drain: Option<ConnFn>,
}

/// A queued cross-connection send.
///
/// Callbacks only borrow the connection the event fired on; to reach a
/// *different* connection they queue a relay command by id and the reactor
/// resolves it through the container after the current dispatch completes.
pub(crate) struct RelayCmd {
    pub(crate) target: Option<u64>,
    pub(crate) payload: Vec<u8>,
}

/// Shared relay queue, one per server, cloned into every connection.
#[derive(Default)]
pub struct Relay {
    queue: Mutex<Vec<RelayCmd>>,
}

impl Relay {
    pub(crate) fn take(&self) -> Vec<RelayCmd> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *queue)
    }

    fn push(&self, cmd: RelayCmd) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(cmd);
    }
}

/// Per-state operation table.
struct StateOps {
    state: ConnectionState,
    on_data: fn(&mut Connection) -> Result<()>,
    on_send: fn(&mut Connection, &[u8], OpCode) -> Result<()>,
    on_close: fn(&mut Connection, u16) -> Result<()>,
}

static HANDSHAKING_OPS: StateOps = StateOps {
    state: ConnectionState::Handshaking,
    on_data: handshaking_on_data,
    on_send: handshaking_on_send,
    on_close: handshaking_on_close,
};

static OPEN_OPS: StateOps = StateOps {
    state: ConnectionState::Open,
    on_data: open_on_data,
    on_send: open_on_send,
    on_close: open_on_close,
};

static CLOSING_OPS: StateOps = StateOps {
    state: ConnectionState::Closing,
    on_data: closing_on_data,
    on_send: closing_on_send,
    on_close: closing_on_close,
};

static CLOSED_OPS: StateOps = StateOps {
    state: ConnectionState::Closed,
    on_data: closed_on_data,
    on_send: closed_on_send,
    on_close: closed_on_close,
};

/// One accepted client socket with its protocol state and I/O rings.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    rx: RingBuffer<RX_BUFFER_SIZE>,
    tx: RingBuffer<TX_BUFFER_SIZE>,
    ops: &'static StateOps,
    last_error: Option<Error>,
    write_paused: bool,
    created_at: Instant,
    closing_at: Option<Instant>,
    last_activity: Instant,
    callbacks: Callbacks,
    stats: Arc<ServerStats>,
    relay: Arc<Relay>,
    /// Interest the reactor last registered for this socket.
    pub(crate) registered_writable: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        callbacks: Callbacks,
        stats: Arc<ServerStats>,
        relay: Arc<Relay>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            ops: &HANDSHAKING_OPS,
            last_error: None,
            write_paused: false,
            created_at: now,
            closing_at: None,
            last_activity: now,
            callbacks,
            stats,
            relay,
            registered_writable: false,
        }
    }

    // --- Reactor I/O ---

    /// Drain the socket into the receive ring, dispatching the state's data
    /// handler after every successful read.
    ///
    /// Loops until the kernel reports would-block: under edge-triggered
    /// readiness, leaving bytes in the socket would lose the wakeup.
    pub fn on_readable(&mut self) -> Result<()> {
        loop {
            if self.is_closed() {
                return Ok(());
            }
            let n = {
                let (head, tail) = self.rx.writable_slices();
                if head.is_empty() && tail.is_empty() {
                    // data pending that the fixed ring can never hold
                    self.stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                    return Err(self.fail(Error::BufferFull));
                }
                let mut iov = [IoSliceMut::new(head), IoSliceMut::new(tail)];
                match self.stream.read_vectored(&mut iov) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(self.socket_failure(e)),
                }
            };
            if n == 0 {
                return Err(self.fail(Error::ConnectionClosed));
            }
            self.rx.commit_write(n);
            self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
            self.last_activity = Instant::now();
            (self.ops.on_data)(self)?;
        }
    }

    /// Flush the transmit ring with vectored writes until it is empty or
    /// the kernel reports would-block.
    pub fn on_writable(&mut self) -> Result<()> {
        loop {
            if self.tx.is_empty() {
                return Ok(());
            }
            let n = {
                let (head, tail) = self.tx.readable_slices();
                let iov = [IoSlice::new(head), IoSlice::new(tail)];
                match self.stream.write_vectored(&iov) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(self.socket_failure(e)),
                }
            };
            if n == 0 {
                return Err(self.fail(Error::ConnectionClosed));
            }
            self.tx.advance(n);
            self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            self.check_low_watermark();
        }
    }

    /// Scalar flush path: copy through a small temp buffer and plain
    /// `write`. Selected by `Server::set_use_writev(false)`.
    pub fn on_writable_scalar(&mut self) -> Result<()> {
        loop {
            if self.tx.is_empty() {
                return Ok(());
            }
            let mut temp = [0u8; SCALAR_WRITE_CHUNK];
            let len = self.tx.peek(&mut temp);
            let n = match self.stream.write(&temp[..len]) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.socket_failure(e)),
            };
            if n == 0 {
                return Err(self.fail(Error::ConnectionClosed));
            }
            self.tx.advance(n);
            self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
            self.check_low_watermark();
        }
    }

    // --- User API ---

    /// Queue a text message. Only observable in Open state.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        (self.ops.on_send)(self, payload, OpCode::Text)
    }

    /// Queue a binary message. Only observable in Open state.
    pub fn send_binary(&mut self, payload: &[u8]) -> Result<()> {
        (self.ops.on_send)(self, payload, OpCode::Binary)
    }

    /// Initiate a close with the given status code. Idempotent: in Open a
    /// close frame is queued and the connection enters Closing; in
    /// Handshaking or Closing the socket is shut down immediately.
    pub fn close(&mut self, code: u16) -> Result<()> {
        (self.ops.on_close)(self, code)
    }

    /// Queue a text message for the connection with id `target`. The
    /// reactor delivers it after the current dispatch completes; unknown or
    /// non-open targets drop the message.
    pub fn relay(&self, target: u64, payload: &[u8]) {
        self.relay.push(RelayCmd {
            target: Some(target),
            payload: payload.to_vec(),
        });
    }

    /// Queue a text message for every open connection, the sender included.
    pub fn relay_all(&self, payload: &[u8]) {
        self.relay.push(RelayCmd {
            target: None,
            payload: payload.to_vec(),
        });
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.ops.state
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.ops.state == ConnectionState::Closed
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Last error recorded by a failed operation, for diagnostics.
    #[inline]
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    /// Bytes queued in the transmit ring.
    #[inline]
    pub fn tx_buffer_usage(&self) -> usize {
        self.tx.len()
    }

    #[inline]
    pub fn is_write_paused(&self) -> bool {
        self.write_paused
    }

    #[inline]
    pub fn has_data_to_send(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Milliseconds since the last successful read.
    pub fn idle_ms(&self) -> u64 {
        self.last_activity.elapsed().as_millis() as u64
    }

    // --- Reactor bookkeeping ---

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn is_handshake_timed_out(&self) -> bool {
        self.ops.state == ConnectionState::Handshaking
            && self.created_at.elapsed() > HANDSHAKE_TIMEOUT
    }

    pub(crate) fn is_close_timed_out(&self) -> bool {
        self.ops.state == ConnectionState::Closing
            && self
                .closing_at
                .map(|at| at.elapsed() > CLOSE_TIMEOUT)
                .unwrap_or(false)
    }

    /// Record a deadline miss before the reactor closes this connection.
    pub(crate) fn note_timeout(&mut self) {
        self.last_error = Some(Error::Timeout);
    }

    /// Tear down after a failed read/write: record the error, notify the
    /// application, move to Closed.
    pub(crate) fn abort(&mut self, err: Error) {
        self.last_error = Some(err);
        if !matches!(err, Error::ConnectionClosed) {
            if let Some(cb) = self.callbacks.on_error.clone() {
                cb(self);
            }
        }
        self.transition_to_closed(false);
    }

    // --- Internals ---

    fn fail(&mut self, err: Error) -> Error {
        self.last_error = Some(err);
        err
    }

    fn socket_failure(&mut self, e: io::Error) -> Error {
        let err = Error::from(e);
        if matches!(err, Error::SocketError(_)) {
            self.stats.socket_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.fail(err)
    }

    fn transition_to_open(&mut self) {
        trace!("conn {}: open", self.id);
        self.ops = &OPEN_OPS;
        if let Some(cb) = self.callbacks.on_open.clone() {
            cb(self);
        }
    }

    fn transition_to_closing(&mut self) {
        trace!("conn {}: closing", self.id);
        self.ops = &CLOSING_OPS;
        self.closing_at = Some(Instant::now());
    }

    /// Move to Closed, shut the socket, and fire `on_close` exactly once.
    /// `clean` is true only on the application-initiated path.
    fn transition_to_closed(&mut self, clean: bool) {
        if self.ops.state == ConnectionState::Closed {
            return;
        }
        trace!("conn {}: closed (clean={})", self.id, clean);
        self.ops = &CLOSED_OPS;
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(cb) = self.callbacks.on_close.clone() {
            cb(self, clean);
        }
    }

    /// Encode and queue one unfragmented frame. All-or-nothing: a frame
    /// that does not fit the transmit ring is dropped and counted.
    fn write_frame(&mut self, payload: &[u8], opcode: OpCode) -> Result<()> {
        let mut header = [0u8; MAX_FRAME_HEADER_SIZE];
        let header_len =
            frame::encode_frame_header(&mut header, opcode, payload.len() as u64, false);
        if self.tx.available() < header_len + payload.len() {
            self.stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
            return Err(self.fail(Error::BufferFull));
        }
        let pushed = self.tx.push(&header[..header_len]) && self.tx.push(payload);
        debug_assert!(pushed);
        Ok(())
    }

    fn write_close_frame(&mut self, code: u16) -> Result<()> {
        self.write_frame(&code.to_be_bytes(), OpCode::Close)
    }

    fn check_high_watermark(&mut self) {
        if !self.write_paused && self.tx.len() > TX_HIGH_WATERMARK {
            self.write_paused = true;
            if let Some(cb) = self.callbacks.on_backpressure.clone() {
                cb(self);
            }
        }
    }

    fn check_low_watermark(&mut self) {
        if self.write_paused && self.tx.len() < TX_LOW_WATERMARK {
            self.write_paused = false;
            if let Some(cb) = self.callbacks.on_drain.clone() {
                cb(self);
            }
        }
    }

    /// Open-state frame loop: deliver every complete frame in the receive
    /// ring, one `on_message` per data frame.
    fn parse_frames(&mut self) -> Result<()> {
        loop {
            if self.ops.state != ConnectionState::Open {
                // a callback closed the connection mid-loop
                return Ok(());
            }
            let mut snapshot = [0u8; RX_BUFFER_SIZE];
            let len = self.rx.peek(&mut snapshot);
            if len == 0 {
                return Ok(());
            }
            let (header, header_len) = match frame::parse_frame_header(&snapshot[..len]) {
                Some(parsed) => parsed,
                None => return Ok(()), // incomplete header
            };

            let total = header_len as u64 + header.payload_len;
            if total > RX_BUFFER_SIZE as u64 {
                // the frame can never fit the fixed ring
                self.stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                return Err(self.fail(Error::BufferFull));
            }
            let total = total as usize;
            if len < total {
                return Ok(()); // incomplete payload
            }

            let payload = &mut snapshot[header_len..total];
            if let Some(key) = header.mask {
                apply_mask(payload, key);
            }

            match OpCode::from_u8(header.opcode) {
                Some(OpCode::Text) | Some(OpCode::Binary) => {
                    self.stats.messages_in.fetch_add(1, Ordering::Relaxed);
                    if let Some(cb) = self.callbacks.on_message.clone() {
                        cb(self, payload);
                    }
                }
                Some(OpCode::Close) => {
                    self.rx.advance(total);
                    self.transition_to_closed(false);
                    return Ok(());
                }
                Some(OpCode::Ping) => {
                    if self.write_frame(payload, OpCode::Pong).is_err() {
                        debug!("conn {}: pong dropped, tx full", self.id);
                    }
                }
                // pong, stray continuation, reserved opcodes
                Some(OpCode::Pong) | Some(OpCode::Continuation) | None => {}
            }

            self.rx.advance(total);
        }
    }
}

// --- State handlers ---

fn handshaking_on_data(conn: &mut Connection) -> Result<()> {
    let mut snapshot = [0u8; HANDSHAKE_SNAPSHOT];
    let len = conn.rx.peek(&mut snapshot);

    match handshake::parse_request(&snapshot[..len]) {
        Ok(None) => Ok(()),
        Ok(Some((req, consumed))) => {
            let accept = handshake::accept_key(req.key);
            let response = handshake::build_response(&accept);
            conn.rx.advance(consumed);
            if !conn.tx.push(&response) {
                conn.stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                conn.stats.handshake_errors.fetch_add(1, Ordering::Relaxed);
                return Err(conn.fail(Error::BufferFull));
            }
            conn.transition_to_open();
            // a pipelined first frame may already sit behind the request
            (conn.ops.on_data)(conn)
        }
        Err(err) => {
            conn.stats.handshake_errors.fetch_add(1, Ordering::Relaxed);
            Err(conn.fail(err))
        }
    }
}

fn handshaking_on_send(_conn: &mut Connection, _payload: &[u8], _opcode: OpCode) -> Result<()> {
    Err(Error::InvalidState)
}

fn handshaking_on_close(conn: &mut Connection, _code: u16) -> Result<()> {
    conn.transition_to_closed(true);
    Ok(())
}

fn open_on_data(conn: &mut Connection) -> Result<()> {
    conn.parse_frames()
}

fn open_on_send(conn: &mut Connection, payload: &[u8], opcode: OpCode) -> Result<()> {
    conn.write_frame(payload, opcode)?;
    conn.stats.messages_out.fetch_add(1, Ordering::Relaxed);
    conn.check_high_watermark();
    Ok(())
}

fn open_on_close(conn: &mut Connection, code: u16) -> Result<()> {
    if conn.write_close_frame(code).is_err() {
        debug!("conn {}: close frame dropped, tx full", conn.id);
    }
    conn.transition_to_closing();
    Ok(())
}

fn closing_on_data(conn: &mut Connection) -> Result<()> {
    // only the peer's close frame matters now
    let mut snapshot = [0u8; HANDSHAKE_SNAPSHOT];
    let len = conn.rx.peek(&mut snapshot);
    if let Some((header, _)) = frame::parse_frame_header(&snapshot[..len]) {
        if header.opcode == OpCode::Close as u8 {
            conn.transition_to_closed(true);
        }
    }
    Ok(())
}

fn closing_on_send(_conn: &mut Connection, _payload: &[u8], _opcode: OpCode) -> Result<()> {
    Err(Error::InvalidState)
}

fn closing_on_close(conn: &mut Connection, _code: u16) -> Result<()> {
    conn.transition_to_closed(true);
    Ok(())
}

fn closed_on_data(_conn: &mut Connection) -> Result<()> {
    Err(Error::ConnectionClosed)
}

fn closed_on_send(_conn: &mut Connection, _payload: &[u8], _opcode: OpCode) -> Result<()> {
    Err(Error::ConnectionClosed)
}

fn closed_on_close(_conn: &mut Connection, _code: u16) -> Result<()> {
    Err(Error::ConnectionClosed)
}
