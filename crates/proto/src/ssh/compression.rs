//! Payload compression (RFC 4253 Section 6.2).
//!
//! - `zlib`: active immediately after NEWKEYS
//! - `zlib@openssh.com`: active once user authentication succeeds
//! - `none`
//!
//! Each direction keeps one zlib stream for the life of the connection and
//! every packet ends with a sync flush, so the peer can decode it without
//! waiting for more data.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use keygate_platform::{KeygateError, KeygateResult};

/// Upper bound on one decompressed payload.
const MAX_INFLATED_SIZE: usize = 256 * 1024;

/// Compression algorithm negotiated for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib, active after NEWKEYS
    Zlib,
    /// zlib, active after USERAUTH_SUCCESS
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Parses a compression algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    /// True for the OpenSSH delayed variant.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenssh)
    }
}

fn compress_error(err: impl std::fmt::Display) -> KeygateError {
    KeygateError::Protocol(format!("Compression failed: {}", err))
}

fn decompress_error(err: impl std::fmt::Display) -> KeygateError {
    KeygateError::Protocol(format!("Decompression failed: {}", err))
}

/// Outgoing compression state.
pub enum Compressor {
    /// Payloads pass through untouched
    None,
    /// zlib stream
    Zlib(Box<Compress>),
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compressor::None => f.write_str("Compressor::None"),
            Compressor::Zlib(_) => f.write_str("Compressor::Zlib"),
        }
    }
}

impl Compressor {
    /// Starts a new zlib stream.
    pub fn zlib() -> Self {
        Compressor::Zlib(Box::new(Compress::new(Compression::default(), true)))
    }

    /// True if payloads are compressed.
    pub fn is_active(&self) -> bool {
        matches!(self, Compressor::Zlib(_))
    }

    /// Compresses one payload.
    pub fn compress(&mut self, data: &[u8]) -> KeygateResult<Vec<u8>> {
        let stream = match self {
            Compressor::None => return Ok(data.to_vec()),
            Compressor::Zlib(stream) => stream,
        };

        let start = stream.total_in();
        let mut out = Vec::with_capacity(data.len() + 64);
        loop {
            let consumed = (stream.total_in() - start) as usize;
            stream
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(compress_error)?;

            let consumed = (stream.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

/// Incoming decompression state.
pub enum Decompressor {
    /// Payloads pass through untouched
    None,
    /// zlib stream
    Zlib(Box<Decompress>),
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decompressor::None => f.write_str("Decompressor::None"),
            Decompressor::Zlib(_) => f.write_str("Decompressor::Zlib"),
        }
    }
}

impl Decompressor {
    /// Starts a new zlib stream.
    pub fn zlib() -> Self {
        Decompressor::Zlib(Box::new(Decompress::new(true)))
    }

    /// True if payloads are decompressed.
    pub fn is_active(&self) -> bool {
        matches!(self, Decompressor::Zlib(_))
    }

    /// Decompresses one payload.
    pub fn decompress(&mut self, data: &[u8]) -> KeygateResult<Vec<u8>> {
        let stream = match self {
            Decompressor::None => return Ok(data.to_vec()),
            Decompressor::Zlib(stream) => stream,
        };

        let start = stream.total_in();
        let mut out = Vec::with_capacity(data.len() * 4 + 64);
        loop {
            let consumed = (stream.total_in() - start) as usize;
            let status = stream
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(decompress_error)?;

            let consumed = (stream.total_in() - start) as usize;
            if status == Status::StreamEnd
                || (consumed == data.len() && out.len() < out.capacity())
            {
                return Ok(out);
            }
            if out.len() >= MAX_INFLATED_SIZE {
                return Err(decompress_error("payload too large"));
            }
            out.reserve(out.capacity().max(64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(
            CompressionAlgorithm::from_name("zlib@openssh.com"),
            Some(CompressionAlgorithm::ZlibOpenssh)
        );
        assert!(CompressionAlgorithm::from_name("zlib@openssh.com")
            .unwrap()
            .is_delayed());
        assert!(!CompressionAlgorithm::Zlib.is_delayed());
        assert_eq!(CompressionAlgorithm::from_name("lz4"), None);
    }

    #[test]
    fn test_stream_spans_packets() {
        let mut compressor = Compressor::zlib();
        let mut decompressor = Decompressor::zlib();

        let messages: Vec<Vec<u8>> = vec![
            b"SSH_MSG_USERAUTH_REQUEST".to_vec(),
            vec![b'x'; 5000],
            b"SSH_MSG_USERAUTH_REQUEST".to_vec(),
        ];
        let mut sizes = Vec::new();
        for message in &messages {
            let wire = compressor.compress(message).unwrap();
            sizes.push(wire.len());
            assert_eq!(&decompressor.decompress(&wire).unwrap(), message);
        }
        assert!(sizes[1] < 5000);
        // Repeated content compresses better once the stream has seen it.
        assert!(sizes[2] < sizes[0]);
    }

    #[test]
    fn test_none_passes_through() {
        let mut compressor = Compressor::None;
        assert!(!compressor.is_active());
        assert_eq!(compressor.compress(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_garbage_rejected() {
        let mut decompressor = Decompressor::zlib();
        assert!(decompressor.decompress(&[0xff; 16]).is_err());
    }
}
