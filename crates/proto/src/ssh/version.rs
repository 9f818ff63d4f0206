//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection by sending an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string; the client
//! skips them (up to a bounded number of lines).
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::version::Version;
//!
//! let version = Version::new("Keygate_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Keygate_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_9.6 Debian").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_9.6");
//! assert_eq!(parsed.comments(), Some("Debian"));
//! ```

use keygate_platform::{KeygateError, KeygateResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum identification line length, including CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines accepted before the banner.
pub const MAX_PREAMBLE_LINES: usize = 32;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an SSH-2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Default identification for this crate.
    pub fn default_keygate() -> Self {
        Self::new(&format!("Keygate_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without CR LF).
    pub fn parse(line: &str) -> KeygateResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(KeygateError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(KeygateError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            KeygateError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;

        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            KeygateError::Protocol(format!("Invalid version string format: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(KeygateError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        if software_version.is_empty() {
            return Err(KeygateError::Protocol(
                "Version string has empty software version".to_string(),
            ));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version ("2.0" or "1.99").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the identification line terminated with CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Sends our identification and reads the peer's.
///
/// Returns the peer's identification line exactly as received (without CR LF),
/// since the exchange hash covers the raw string.
pub async fn exchange<S>(stream: &mut S, ours: &Version) -> KeygateResult<(Version, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_wire_format()).await?;
    stream.flush().await?;

    for _ in 0..=MAX_PREAMBLE_LINES {
        let line = read_line(stream).await?;
        if line.starts_with("SSH-") {
            let version = Version::parse(&line)?;
            debug!("Peer version: {}", line);
            return Ok((version, line));
        }
        trace!("Skipping pre-banner line: {:?}", line);
    }

    Err(KeygateError::Protocol(
        "Peer did not send an SSH identification string".to_string(),
    ))
}

async fn read_line<S>(stream: &mut S) -> KeygateResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        buffer.push(byte[0]);
        if buffer.len() > MAX_VERSION_LENGTH {
            return Err(KeygateError::Protocol("Version string too long".to_string()));
        }
    }

    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }

    String::from_utf8(buffer)
        .map_err(|_| KeygateError::Protocol("Version string is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let v = Version::new("Keygate_0.1.0", Some("test build"));
        assert_eq!(v.to_string(), "SSH-2.0-Keygate_0.1.0 test build");
        assert_eq!(v.to_wire_format(), b"SSH-2.0-Keygate_0.1.0 test build\r\n");
    }

    #[test]
    fn test_parse_valid() {
        let v = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
        assert_eq!(v.proto_version(), "2.0");
        assert_eq!(v.software(), "OpenSSH_8.9");
        assert_eq!(v.comments(), None);

        let v = Version::parse("SSH-1.99-Legacy_1.0").unwrap();
        assert_eq!(v.proto_version(), "1.99");
    }

    #[test]
    fn test_parse_rejects() {
        assert!(Version::parse("SSH-1.5-Old").is_err());
        assert!(Version::parse("HTTP/1.1 200 OK").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
        assert!(Version::parse("SSH-2.0-a\0b").is_err());
        let long = format!("SSH-2.0-{}", "x".repeat(300));
        assert!(Version::parse(&long).is_err());
    }

    #[tokio::test]
    async fn test_exchange_skips_preamble() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            server
                .write_all(b"Welcome to the test host\r\nSSH-2.0-TestServer_1.0\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let ours = Version::new("Keygate_test", None);
        let (peer, raw) = exchange(&mut client, &ours).await.unwrap();
        assert_eq!(peer.software(), "TestServer_1.0");
        assert_eq!(raw, "SSH-2.0-TestServer_1.0");

        let received = server_task.await.unwrap();
        assert_eq!(received, "SSH-2.0-Keygate_test\r\n");
    }
}
