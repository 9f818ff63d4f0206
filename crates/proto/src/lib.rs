//! SSH connection establishment for the Keygate client.
//!
//! This crate opens SSH connections: it negotiates algorithms, verifies the
//! server host key against known-hosts data and authenticates the user with
//! keys, certificates, an SSH agent, passwords or keyboard-interactive prompts.
//! The result is a live [`ssh::Connection`] handle.
//!
//! # Features
//!
//! - `ssh` (default) - SSH client and in-process test server
//!
//! # Security
//!
//! - Cryptography comes from vetted libraries (`ring`, `ed25519-dalek`)
//! - Authentication secrets are compared in constant time
//! - Key material is zeroized on drop with `zeroize`

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
