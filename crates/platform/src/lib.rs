//! # Keygate Platform
//!
//! Shared types for the Keygate SSH connection layer.
//!
//! This crate provides the unified error taxonomy (`KeygateError`, `KeygateResult`)
//! used by every stage of connection establishment: configuration validation,
//! socket I/O, protocol negotiation and caller-supplied callbacks.
//!
//! # Examples
//!
//! ```
//! use keygate_platform::{KeygateError, KeygateResult};
//!
//! fn pick_cipher(list: &[&str]) -> KeygateResult<String> {
//!     list.first()
//!         .map(|name| name.to_string())
//!         .ok_or_else(|| KeygateError::Config("empty encryption algorithm list".to_string()))
//! }
//!
//! # fn main() -> KeygateResult<()> {
//! assert_eq!(pick_cipher(&["aes128-gcm@openssh.com"])?, "aes128-gcm@openssh.com");
//! assert!(pick_cipher(&[]).unwrap_err().is_config());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{BoxError, KeygateError, KeygateResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
