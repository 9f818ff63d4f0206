//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or AEAD tag
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include the MAC or the length field itself
//! - `padding_length` is at least 4 and at most 255
//! - The packet is a multiple of the cipher block size (at least 8); AEAD
//!   ciphers leave the length field out of the alignment
//! - Packets above 35000 bytes are rejected
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::packet::{frame, unframe};
//!
//! let framed = frame(b"payload", 8, false).unwrap();
//! assert_eq!(framed.len() % 8, 0);
//!
//! let payload = unframe(&framed[4..]).unwrap();
//! assert_eq!(payload, b"payload");
//! ```

use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};
use rand::RngCore;

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Largest uncompressed payload sent (RFC 4253 Section 6.1).
pub const MAX_PAYLOAD_SIZE: usize = 32768;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Builds `packet_length || padding_length || payload || padding`.
///
/// Padding is random and brings the packet to a multiple of `block_size`.
/// With `excludes_length` the 4-byte length field is not counted.
///
/// # Errors
///
/// Returns [`KeygateError::Protocol`] if the result would exceed
/// [`MAX_PACKET_SIZE`].
pub fn frame(payload: &[u8], block_size: usize, excludes_length: bool) -> KeygateResult<Vec<u8>> {
    let block_size = block_size.max(8);
    let aligned = if excludes_length { 1 } else { 5 } + payload.len();

    let mut padding_len = block_size - aligned % block_size;
    if padding_len < MIN_PADDING_LEN {
        padding_len += block_size;
    }
    debug_assert!(padding_len <= MAX_PADDING_LEN);

    let packet_length = 1 + payload.len() + padding_len;
    if packet_length + 4 > MAX_PACKET_SIZE {
        return Err(KeygateError::Protocol(format!(
            "Packet size {} exceeds maximum {}",
            packet_length + 4,
            MAX_PACKET_SIZE
        )));
    }

    let mut padding = vec![0u8; padding_len];
    rand::thread_rng().fill_bytes(&mut padding);

    let mut buf = BytesMut::with_capacity(4 + packet_length + 64);
    buf.put_u32(packet_length as u32);
    buf.put_u8(padding_len as u8);
    buf.put_slice(payload);
    buf.put_slice(&padding);
    Ok(buf.to_vec())
}

/// Validates a received `packet_length` before the body is read.
pub fn check_length(
    packet_length: u32,
    block_size: usize,
    excludes_length: bool,
    already_read: usize,
) -> KeygateResult<()> {
    let packet_length = packet_length as usize;
    if packet_length + 4 > MAX_PACKET_SIZE {
        return Err(KeygateError::Protocol(format!(
            "Packet too large: {} bytes (max {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    if packet_length < 1 + MIN_PADDING_LEN || packet_length + 4 < already_read {
        return Err(KeygateError::Protocol(format!(
            "Packet too small: {} bytes",
            packet_length
        )));
    }

    let aligned = if excludes_length { packet_length } else { packet_length + 4 };
    if aligned % block_size.max(8) != 0 {
        return Err(KeygateError::Protocol(format!(
            "Packet length {} not aligned to block size {}",
            packet_length, block_size
        )));
    }
    Ok(())
}

/// Extracts the payload from `padding_length || payload || padding`.
pub fn unframe(body: &[u8]) -> KeygateResult<Vec<u8>> {
    let (&padding_len, rest) = body
        .split_first()
        .ok_or_else(|| KeygateError::Protocol("Empty packet body".to_string()))?;
    let padding_len = padding_len as usize;

    if padding_len < MIN_PADDING_LEN {
        return Err(KeygateError::Protocol(format!(
            "Padding too short: {} bytes (min {})",
            padding_len, MIN_PADDING_LEN
        )));
    }
    if padding_len > rest.len() {
        return Err(KeygateError::Protocol(format!(
            "Padding length {} exceeds packet body {}",
            padding_len,
            rest.len()
        )));
    }

    Ok(rest[..rest.len() - padding_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_alignment() {
        for len in 0..40 {
            let payload = vec![0xaa; len];
            let framed = frame(&payload, 8, false).unwrap();
            assert_eq!(framed.len() % 8, 0);
            assert!(framed[4] as usize >= MIN_PADDING_LEN);

            let framed = frame(&payload, 16, true).unwrap();
            assert_eq!((framed.len() - 4) % 16, 0);
        }
    }

    #[test]
    fn test_frame_length_field() {
        let framed = frame(b"abc", 8, false).unwrap();
        let length = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(length + 4, framed.len());
        assert_eq!(unframe(&framed[4..]).unwrap(), b"abc");
    }

    #[test]
    fn test_frame_too_large() {
        let payload = vec![0u8; MAX_PACKET_SIZE];
        assert!(frame(&payload, 8, false).is_err());
    }

    #[test]
    fn test_check_length() {
        assert!(check_length(12, 8, false, 4).is_ok());
        assert!(check_length(16, 16, true, 4).is_ok());
        assert!(check_length(13, 8, false, 4).is_err());
        assert!(check_length(2, 8, false, 4).is_err());
        assert!(check_length(40_000, 8, false, 4).is_err());
        assert!(check_length(8, 8, true, 16).is_err());
    }

    #[test]
    fn test_unframe_rejects_bad_padding() {
        assert!(unframe(&[]).is_err());
        assert!(unframe(&[3, 1, 2, 3]).is_err());
        assert!(unframe(&[9, 1, 2, 3, 4]).is_err());
    }
}
