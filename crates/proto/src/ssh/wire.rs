//! SSH data type encoding (RFC 4251 Section 5).
//!
//! All SSH messages are built from a handful of primitive types:
//!
//! ```text
//! byte, boolean, uint32, uint64, string, mpint, name-list
//! ```
//!
//! [`WireWrite`] adds writers for these types to [`BytesMut`], and [`WireReader`]
//! is a bounds-checked cursor that decodes them from a message payload.

use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};

/// Writers for SSH primitive types.
pub trait WireWrite {
    /// Writes a boolean as a single byte.
    fn put_bool(&mut self, value: bool);
    /// Writes a length-prefixed byte string.
    fn put_string(&mut self, data: &[u8]);
    /// Writes a length-prefixed UTF-8 string.
    fn put_str(&mut self, s: &str);
    /// Writes an unsigned big-endian integer as an mpint.
    fn put_mpint(&mut self, magnitude: &[u8]);
    /// Writes a comma-separated name-list.
    fn put_name_list(&mut self, names: &[String]);
}

impl WireWrite for BytesMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    fn put_str(&mut self, s: &str) {
        self.put_string(s.as_bytes());
    }

    fn put_mpint(&mut self, magnitude: &[u8]) {
        self.put_string(&encode_mpint(magnitude));
    }

    fn put_name_list(&mut self, names: &[String]) {
        self.put_str(&names.join(","));
    }
}

/// Encodes an unsigned big-endian magnitude as the body of an SSH mpint.
///
/// Leading zero bytes are stripped and a single zero byte is prepended when the
/// high bit of the first remaining byte is set. Zero encodes as an empty string.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let first_nonzero = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[first_nonzero..];

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().map_or(false, |b| b & 0x80 != 0) {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Bounds-checked decoder over a message payload.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns true when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize, what: &str) -> KeygateResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(KeygateError::Protocol(format!(
                "Truncated {}: need {} bytes, have {}",
                what,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> KeygateResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a boolean.
    pub fn read_bool(&mut self) -> KeygateResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> KeygateResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian uint64.
    pub fn read_u64(&mut self) -> KeygateResult<u64> {
        let b = self.take(8, "uint64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    /// Reads a fixed number of raw bytes.
    pub fn read_raw(&mut self, len: usize) -> KeygateResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads a length-prefixed byte string.
    pub fn read_string(&mut self) -> KeygateResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_utf8(&mut self) -> KeygateResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| KeygateError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads an mpint and returns its unsigned magnitude.
    pub fn read_mpint(&mut self) -> KeygateResult<&'a [u8]> {
        let bytes = self.read_string()?;
        if bytes.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(KeygateError::Protocol(
                "Negative mpint not allowed".to_string(),
            ));
        }
        let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(&bytes[first_nonzero..])
    }

    /// Reads a comma-separated name-list.
    pub fn read_name_list(&mut self) -> KeygateResult<Vec<String>> {
        let s = self.read_utf8()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(String::from).collect())
    }

    /// Reads the leading message-type byte and checks it.
    pub fn expect_message(&mut self, expected: u8, name: &str) -> KeygateResult<()> {
        let got = self
            .read_u8()
            .map_err(|_| KeygateError::Protocol(format!("{} message is empty", name)))?;
        if got != expected {
            return Err(KeygateError::Protocol(format!(
                "Invalid message type: expected {} ({}), got {}",
                expected, name, got
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpint_encoding() {
        assert_eq!(encode_mpint(&[]), Vec::<u8>::new());
        assert_eq!(encode_mpint(&[0, 0]), Vec::<u8>::new());
        assert_eq!(encode_mpint(&[0x7f]), vec![0x7f]);
        assert_eq!(encode_mpint(&[0x80]), vec![0x00, 0x80]);
        assert_eq!(encode_mpint(&[0x00, 0x00, 0x91, 0x02]), vec![0x00, 0x91, 0x02]);
    }

    #[test]
    fn test_reader_primitives() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_bool(true);
        buf.put_u32(0xdead_beef);
        buf.put_u64(42);
        buf.put_str("ssh-userauth");
        buf.put_name_list(&["a".to_string(), "b".to_string()]);
        buf.put_mpint(&[0x80, 0x01]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert_eq!(r.read_utf8().unwrap(), "ssh-userauth");
        assert_eq!(r.read_name_list().unwrap(), vec!["a", "b"]);
        assert_eq!(r.read_mpint().unwrap(), &[0x80, 0x01]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_truncated_string() {
        let data = [0, 0, 0, 10, b'a'];
        let mut r = WireReader::new(&data);
        assert!(matches!(r.read_string(), Err(KeygateError::Protocol(_))));
    }

    #[test]
    fn test_empty_name_list() {
        let mut buf = BytesMut::new();
        buf.put_name_list(&[]);
        let mut r = WireReader::new(&buf);
        assert!(r.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_expect_message() {
        let data = [51u8];
        assert!(WireReader::new(&data).expect_message(51, "SSH_MSG_USERAUTH_FAILURE").is_ok());
        assert!(WireReader::new(&data).expect_message(52, "SSH_MSG_USERAUTH_SUCCESS").is_err());
        assert!(WireReader::new(&[]).expect_message(52, "SSH_MSG_USERAUTH_SUCCESS").is_err());
    }
}
