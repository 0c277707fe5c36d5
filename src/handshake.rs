//! HTTP upgrade handshake
//!
//! The server-side half of the RFC 6455 opening handshake, scanning a peeked
//! snapshot of the receive ring. The parse is deliberately minimal: a `GET `
//! request line and a non-empty `Sec-WebSocket-Key` header are required,
//! everything else (`Host`, `Origin`, `Sec-WebSocket-Version`, subprotocols,
//! extensions) is ignored. A full HTTP parser would reject requests this
//! contract accepts.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, Result};

const KEY_HEADER: &[u8] = b"Sec-WebSocket-Key: ";
const KEY_HEADER_LOWER: &[u8] = b"sec-websocket-key: ";

/// A parsed WebSocket upgrade request.
#[derive(Debug)]
pub struct UpgradeRequest<'a> {
    /// The Sec-WebSocket-Key value, whitespace-trimmed
    pub key: &'a [u8],
}

/// Parse a WebSocket upgrade request from the start of `buf`.
///
/// Returns `Ok(None)` while the terminating `\r\n\r\n` has not arrived,
/// `Ok(Some((request, consumed)))` once the request is complete, where
/// `consumed` counts through the terminator, and `Err(HandshakeFailed)` for requests
/// that can never become valid.
pub fn parse_request(buf: &[u8]) -> Result<Option<(UpgradeRequest<'_>, usize)>> {
    let end = match find(buf, b"\r\n\r\n") {
        Some(pos) => pos,
        None => return Ok(None),
    };
    let consumed = end + 4;
    let head = &buf[..consumed];

    if !head.starts_with(b"GET ") {
        return Err(Error::HandshakeFailed("request line is not GET"));
    }

    let key_pos = find(head, KEY_HEADER)
        .or_else(|| find(head, KEY_HEADER_LOWER))
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;

    let value_start = key_pos + KEY_HEADER.len();
    let value_end = find(&head[value_start..], b"\r\n")
        .map(|pos| value_start + pos)
        .ok_or(Error::HandshakeFailed("unterminated Sec-WebSocket-Key"))?;

    let mut key = &head[value_start..value_end];
    while let [rest @ .., b' ' | b'\t'] = key {
        key = rest;
    }
    if key.is_empty() {
        return Err(Error::HandshakeFailed("empty Sec-WebSocket-Key"));
    }

    Ok(Some((UpgradeRequest { key }, consumed)))
}

/// Compute the Sec-WebSocket-Accept value: Base64(SHA1(key ++ GUID)).
pub fn accept_key(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the 101 Switching Protocols response.
pub fn build_response(accept: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(160);
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.freeze()
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
