//! SSH Host Key Algorithms
//!
//! Host keys authenticate the server during key exchange (RFC 4253 Section 8):
//! the server signs the exchange hash H and the client verifies that signature
//! against the key it received in the KEX reply.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA signature using Ed25519
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::hostkey::{verify_exchange_signature, Ed25519HostKey, HostKey};
//!
//! let hostkey = Ed25519HostKey::generate();
//! let blob = hostkey.public_key_blob();
//! let signature = hostkey.sign(b"exchange hash");
//!
//! verify_exchange_signature(&blob, b"exchange hash", &signature).unwrap();
//! ```

use crate::ssh::message::DisconnectReason;
use crate::ssh::privatekey::{PrivateKey, PublicKey, SSH_ED25519};
use keygate_platform::{KeygateError, KeygateResult};
use std::path::Path;

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 - EdDSA signature using Ed25519
    SshEd25519,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => SSH_ED25519,
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            SSH_ED25519 => Some(HostKeyAlgorithm::SshEd25519),
            _ => None,
        }
    }
}

/// Trait for host key operations
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format (K_S)
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign data and return the signature in SSH wire format
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    key: PrivateKey,
}

impl Ed25519HostKey {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> Self {
        Self {
            key: PrivateKey::generate("host key"),
        }
    }

    /// Wraps an existing private key.
    pub fn from_private_key(key: PrivateKey) -> Self {
        Self { key }
    }

    /// Loads an OpenSSH private key file.
    pub fn load<P: AsRef<Path>>(path: P) -> KeygateResult<Self> {
        Ok(Self::from_private_key(PrivateKey::from_file(path)?))
    }

    /// Returns the public half.
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        self.key.public_key().to_blob()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.key.sign_blob(data)
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &SSH_ED25519)
            .field("fingerprint", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Verifies the server's signature over the exchange hash.
///
/// Returns the parsed host key on success. Any failure is reported as a
/// key-exchange [`KeygateError::Disconnect`].
pub fn verify_exchange_signature(
    host_key_blob: &[u8],
    exchange_hash: &[u8],
    signature: &[u8],
) -> KeygateResult<PublicKey> {
    let kex_failed = |reason: String| KeygateError::Disconnect {
        code: DisconnectReason::KeyExchangeFailed.code(),
        reason,
    };

    let key = PublicKey::from_blob(host_key_blob)
        .map_err(|e| kex_failed(format!("Invalid host key: {}", e)))?;
    key.verify(exchange_hash, signature)
        .map_err(|e| kex_failed(format!("Host key signature invalid: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_name() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(
            HostKeyAlgorithm::from_name("ssh-ed25519"),
            Some(HostKeyAlgorithm::SshEd25519)
        );
        assert_eq!(HostKeyAlgorithm::from_name("ssh-rsa"), None);
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let hostkey = Ed25519HostKey::generate();
        let signature = hostkey.sign(b"test data to sign");

        let key = verify_exchange_signature(
            &hostkey.public_key_blob(),
            b"test data to sign",
            &signature,
        )
        .unwrap();
        assert_eq!(key, hostkey.public_key());
    }

    #[test]
    fn test_wrong_signature_is_kex_failure() {
        let hostkey = Ed25519HostKey::generate();
        let other = Ed25519HostKey::generate();
        let signature = other.sign(b"hash");

        let err = verify_exchange_signature(&hostkey.public_key_blob(), b"hash", &signature)
            .unwrap_err();
        assert_eq!(err.disconnect_code(), Some(3));

        let err = verify_exchange_signature(b"garbage", b"hash", &signature).unwrap_err();
        assert_eq!(err.disconnect_code(), Some(3));
    }

    #[test]
    fn test_ed25519_debug() {
        let debug = format!("{:?}", Ed25519HostKey::generate());
        assert!(debug.contains("ssh-ed25519"));
        assert!(debug.contains("SHA256:"));
    }
}
