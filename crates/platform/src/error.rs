//! Error types for Keygate
//!
//! The variants map onto the four failure classes a caller has to tell apart:
//!
//! - [`KeygateError::Config`]: invalid settings, detected before any network step
//! - [`KeygateError::Io`]: socket-level failures (connect, timeouts, resets) and
//!   unreadable key material on disk
//! - [`KeygateError::Disconnect`]: the peer's (or our own) protocol-level "no",
//!   carrying the SSH disconnect reason code
//! - [`KeygateError::Callback`]: an error raised by caller code, passed through untouched

use std::error::Error as StdError;

/// Boxed error produced by caller-supplied callbacks.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Unified error type for all Keygate operations
#[derive(Debug, thiserror::Error)]
pub enum KeygateError {
    /// I/O error (network class)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cryptographic failure (bad signature, MAC mismatch, key setup)
    #[error("Security error: {0}")]
    Security(String),

    /// Connection terminated with an SSH disconnect reason
    #[error("Disconnected (code {code}): {reason}")]
    Disconnect {
        /// SSH_DISCONNECT_* reason code (RFC 4253 Section 11.1)
        code: u32,
        /// Human-readable description
        reason: String,
    },

    /// Error raised inside a caller-supplied callback
    #[error(transparent)]
    Callback(BoxError),

    /// Connection was closed before the operation completed
    #[error("Connection closed")]
    Closed,
}

impl KeygateError {
    /// Wraps an error raised by caller code.
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        KeygateError::Callback(err.into())
    }

    /// Returns true for configuration errors.
    pub fn is_config(&self) -> bool {
        matches!(self, KeygateError::Config(_))
    }

    /// Returns true for network-class (I/O) errors.
    pub fn is_network(&self) -> bool {
        matches!(self, KeygateError::Io(_))
    }

    /// Returns the disconnect reason code, if this is a protocol disconnect.
    pub fn disconnect_code(&self) -> Option<u32> {
        match self {
            KeygateError::Disconnect { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns a reference to the callback error if it is of type `E`.
    pub fn downcast_callback_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            KeygateError::Callback(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result type for Keygate operations
pub type KeygateResult<T> = Result<T, KeygateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct HookFailed;

    impl std::fmt::Display for HookFailed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "hook failed")
        }
    }

    impl StdError for HookFailed {}

    #[test]
    fn test_error_display() {
        let err = KeygateError::Config("Invalid configuration".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid configuration");

        let err = KeygateError::Disconnect {
            code: 14,
            reason: "No more authentication methods available".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Disconnected (code 14): No more authentication methods available"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KeygateError = io_err.into();
        assert!(err.is_network());
        assert!(!err.is_config());
    }

    #[test]
    fn test_callback_passthrough() {
        let err = KeygateError::callback(HookFailed);
        assert_eq!(err.to_string(), "hook failed");
        assert!(err.downcast_callback_ref::<HookFailed>().is_some());
        assert!(err.downcast_callback_ref::<std::io::Error>().is_none());
    }

    #[test]
    fn test_disconnect_code() {
        let err = KeygateError::Disconnect {
            code: 9,
            reason: "Host key verification failed".to_string(),
        };
        assert_eq!(err.disconnect_code(), Some(9));
        assert_eq!(KeygateError::Closed.disconnect_code(), None);
    }
}
