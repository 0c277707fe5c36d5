//! # Ember-WS: embedded WebSocket server
//!
//! A single-threaded RFC 6455 server for small Linux targets (ARM/x86).
//! One mio-driven reactor multiplexes a listening socket and a bounded set
//! of client connections; each connection runs a four-state protocol
//! machine over fixed-capacity ring buffers that feed vectored socket I/O.
//! Nothing on the per-frame path allocates.
//!
//! ## Design points
//!
//! - **Fixed memory**: 4 KiB receive and 8 KiB transmit ring per
//!   connection, 64 connection slots, all sized at construction
//! - **Zero-copy I/O**: ring buffers expose two-slice scatter/gather views
//!   consumed by `readv`/`writev`
//! - **Backpressure watermarks**: `on_backpressure` at 75% transmit fill,
//!   `on_drain` at 25%
//! - **Bounded admission**: connections past the limit are accepted and
//!   immediately closed so the backlog keeps draining
//! - **Atomic counters**: an operator thread can snapshot server stats
//!   while the reactor runs
//!
//! ## Example
//!
//! ```no_run
//! use ember_ws::Server;
//!
//! let mut server = Server::bind(8080, "")?;
//! server.on_message(|conn, msg| {
//!     let _ = conn.send(msg);
//! });
//! server.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod pool;
pub mod ring;
pub mod server;
pub mod stats;

pub use connection::{Callbacks, Connection, ConnectionState};
pub use error::{Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use pool::ObjectPool;
pub use ring::RingBuffer;
pub use server::{Server, ShutdownHandle, TcpTuning};
pub use stats::{ServerStats, StatsSnapshot};

use std::time::Duration;

/// WebSocket GUID appended to the client key for the accept hash (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest possible frame header: 2 base + 8 extended length + 4 mask key
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Receive ring capacity per connection
pub const RX_BUFFER_SIZE: usize = 4096;

/// Transmit ring capacity per connection
pub const TX_BUFFER_SIZE: usize = 8192;

/// Transmit fill level that pauses writes (75%)
pub const TX_HIGH_WATERMARK: usize = TX_BUFFER_SIZE * 3 / 4;

/// Transmit fill level that resumes writes (25%)
pub const TX_LOW_WATERMARK: usize = TX_BUFFER_SIZE / 4;

/// Time allowed for the HTTP upgrade, measured from accept
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Time allowed for the peer to answer a close frame
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Compile-time connection slot count
pub const MAX_CONNECTIONS: usize = 64;

/// Temp-copy size for the non-vectored write path
pub const SCALAR_WRITE_CHUNK: usize = 512;
