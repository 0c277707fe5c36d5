//! WebSocket payload masking
//!
//! Clients XOR every outbound payload with a 4-byte key (RFC 6455 §5.3).
//! The server only ever unmasks, which is the same operation.

/// XOR `buf` in place with the repeating 4-byte `key`.
///
/// Processes 8 bytes at a time; the tail falls back to byte-wise XOR.
/// Applying the same key twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let key64 = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ key64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, b) in chunks.into_remainder().iter_mut().enumerate() {
        *b ^= key[i & 3];
    }
}
