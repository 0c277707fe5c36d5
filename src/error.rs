//! Error types for the embedded WebSocket server

use std::fmt;
use std::io;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error tags carried on operation results.
///
/// The enum is `Copy` so a connection can cache the most recent error for
/// diagnostics without holding on to an `io::Error` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A ring buffer cannot accept the bytes
    BufferFull,
    /// Write requested with an empty transmit buffer
    BufferEmpty,
    /// Malformed HTTP upgrade request
    HandshakeFailed(&'static str),
    /// Malformed WebSocket frame
    FrameParse(&'static str),
    /// Peer closed the connection, or an operation hit a Closed connection
    ConnectionClosed,
    /// Operation not permitted in the current connection state
    InvalidState,
    /// Non-retryable socket error
    SocketError(io::ErrorKind),
    /// Handshake or close deadline exceeded
    Timeout,
    /// Admission control rejected a new connection
    MaxConnectionsExceeded,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BufferFull => write!(f, "buffer full"),
            Error::BufferEmpty => write!(f, "buffer empty"),
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            Error::FrameParse(msg) => write!(f, "frame parse error: {}", msg),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::InvalidState => write!(f, "invalid state for operation"),
            Error::SocketError(kind) => write!(f, "socket error: {}", kind),
            Error::Timeout => write!(f, "deadline exceeded"),
            Error::MaxConnectionsExceeded => write!(f, "max connections exceeded"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            kind => Error::SocketError(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(Error::from(reset), Error::ConnectionClosed);

        let pipe = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(Error::from(pipe), Error::ConnectionClosed);

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            Error::from(refused),
            Error::SocketError(io::ErrorKind::ConnectionRefused)
        );
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::BufferFull.to_string(), "buffer full");
        assert_eq!(
            Error::HandshakeFailed("missing key").to_string(),
            "handshake failed: missing key"
        );
    }
}
