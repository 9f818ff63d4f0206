//! SSH protocol message types (RFC 4253, RFC 4252).
//!
//! This module defines the message numbers used while a connection is being
//! established and authenticated, the disconnect reason codes, and the small
//! transport-generic messages (disconnect, ignore, debug, unimplemented,
//! service request/accept).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service request
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-82): Global requests
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use keygate_platform::KeygateResult;

/// SSH message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init (both use same message number).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use same message number).
    KexdhReply = 31,

    // User authentication (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Method-specific reply: PK_OK, PASSWD_CHANGEREQ or INFO_REQUEST,
    /// depending on the method in flight.
    UserauthPkOk = 60,
    /// Keyboard-interactive INFO_RESPONSE.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-82)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use keygate_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// Host not allowed to connect.
    HostNotAllowedToConnect = 1,
    /// Protocol error.
    ProtocolError = 2,
    /// Key exchange failed (includes "no matching algorithm").
    KeyExchangeFailed = 3,
    /// Reserved.
    Reserved = 4,
    /// MAC error.
    MacError = 5,
    /// Compression error.
    CompressionError = 6,
    /// Service not available.
    ServiceNotAvailable = 7,
    /// Protocol version not supported.
    ProtocolVersionNotSupported = 8,
    /// Host key not verifiable.
    HostKeyNotVerifiable = 9,
    /// Connection lost.
    ConnectionLost = 10,
    /// Disconnected by application.
    ByApplication = 11,
    /// Too many connections.
    TooManyConnections = 12,
    /// Authentication cancelled by user.
    AuthCancelledByUser = 13,
    /// No more authentication methods available.
    NoMoreAuthMethodsAvailable = 14,
    /// Illegal user name.
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Returns the numeric reason code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Maps a numeric code back to a reason.
    pub fn from_code(code: u32) -> Option<Self> {
        use DisconnectReason::*;
        const ALL: [DisconnectReason; 15] = [
            HostNotAllowedToConnect,
            ProtocolError,
            KeyExchangeFailed,
            Reserved,
            MacError,
            CompressionError,
            ServiceNotAvailable,
            ProtocolVersionNotSupported,
            HostKeyNotVerifiable,
            ConnectionLost,
            ByApplication,
            TooManyConnections,
            AuthCancelledByUser,
            NoMoreAuthMethodsAvailable,
            IllegalUserName,
        ];
        ALL.into_iter().find(|r| r.code() == code)
    }
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code.
    pub code: u32,
    /// Description.
    pub description: String,
    /// Language tag.
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect message with an empty language tag.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            code: reason.code(),
            description: description.into(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.code);
        buf.put_str(&self.description);
        buf.put_str(&self.language);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::Disconnect as u8, "SSH_MSG_DISCONNECT")?;
        let code = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_string()?).into_owned();
        // Some peers omit the language tag.
        let language = if r.is_empty() {
            String::new()
        } else {
            r.read_utf8()?
        };
        Ok(Self {
            code,
            description,
            language,
        })
    }
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer should display the message.
    pub always_display: bool,
    /// Message text.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl DebugMessage {
    /// Creates a debug message that is not forced to display.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            always_display: false,
            message: message.into(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Debug as u8);
        buf.put_bool(self.always_display);
        buf.put_str(&self.message);
        buf.put_str(&self.language);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::Debug as u8, "SSH_MSG_DEBUG")?;
        Ok(Self {
            always_display: r.read_bool()?,
            message: String::from_utf8_lossy(r.read_string()?).into_owned(),
            language: r.read_utf8()?,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED (RFC 4253 Section 11.4).
pub fn unimplemented(sequence_number: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(MessageType::Unimplemented as u8);
    buf.put_u32(sequence_number);
    buf.to_vec()
}

/// SSH_MSG_SERVICE_REQUEST / SSH_MSG_SERVICE_ACCEPT (RFC 4253 Section 10).
pub fn service_message(kind: MessageType, service: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(kind as u8);
    buf.put_str(service);
    buf.to_vec()
}

/// Parses a service request or accept and returns the service name.
pub fn parse_service_message(kind: MessageType, data: &[u8]) -> KeygateResult<String> {
    let mut r = WireReader::new(data);
    r.expect_message(kind as u8, kind.name())?;
    r.read_utf8()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(61), Some(MessageType::UserauthInfoResponse));
        assert_eq!(MessageType::from_u8(94), None);
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_disconnect_codes() {
        assert_eq!(DisconnectReason::KeyExchangeFailed.code(), 3);
        assert_eq!(DisconnectReason::HostKeyNotVerifiable.code(), 9);
        assert_eq!(DisconnectReason::NoMoreAuthMethodsAvailable.code(), 14);
    }

    #[test]
    fn test_disconnect_message() {
        let msg = Disconnect::new(DisconnectReason::ByApplication, "bye");
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        let parsed = Disconnect::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.code, 11);
        assert_eq!(parsed.description, "bye");
    }

    #[test]
    fn test_disconnect_without_language() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u32(2);
        buf.put_str("oops");
        let parsed = Disconnect::from_bytes(&buf).unwrap();
        assert_eq!(parsed.code, 2);
        assert!(parsed.language.is_empty());
    }

    #[test]
    fn test_debug_message() {
        let bytes = DebugMessage::new("debug").to_bytes();
        let parsed = DebugMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.message, "debug");
        assert!(!parsed.always_display);
    }

    #[test]
    fn test_service_message() {
        let bytes = service_message(MessageType::ServiceRequest, "ssh-userauth");
        assert_eq!(
            parse_service_message(MessageType::ServiceRequest, &bytes).unwrap(),
            "ssh-userauth"
        );
        assert!(parse_service_message(MessageType::ServiceAccept, &bytes).is_err());
    }

    #[test]
    fn test_unimplemented() {
        assert_eq!(unimplemented(7), vec![3, 0, 0, 0, 7]);
    }
}
