//! SSH key exchange messages and algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm negotiation across all categories
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server also lists)
//! 3. Key exchange (DH or ECDH, see [`kex_dh`](super::kex_dh))
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to encrypted communication
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::algorithms::AlgorithmPreferences;
//! use keygate_proto::ssh::kex::{negotiate, KexInit};
//!
//! let client = KexInit::from_preferences(&AlgorithmPreferences::all());
//! let server = KexInit::from_preferences(&AlgorithmPreferences::all());
//!
//! let negotiated = negotiate(&client, &server, false).unwrap();
//! assert_eq!(negotiated.kex, "curve25519-sha256");
//! ```

use crate::ssh::algorithms::{AlgorithmPreferences, Category, COMPRESSION_NONE};
use crate::ssh::message::{DisconnectReason, MessageType};
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};
use rand::RngCore;

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_algorithms_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_algorithms_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_algorithms_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_algorithms_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_algorithms_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_algorithms_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT advertising the given preferences in both directions.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_algorithms_client_to_server: prefs.encryption.clone(),
            encryption_algorithms_server_to_client: prefs.encryption.clone(),
            mac_algorithms_client_to_server: prefs.mac.clone(),
            mac_algorithms_server_to_client: prefs.mac.clone(),
            compression_algorithms_client_to_server: prefs.compression.clone(),
            compression_algorithms_server_to_client: prefs.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message to bytes (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_algorithms_client_to_server);
        buf.put_name_list(&self.encryption_algorithms_server_to_client);
        buf.put_name_list(&self.mac_algorithms_client_to_server);
        buf.put_name_list(&self.mac_algorithms_server_to_client);
        buf.put_name_list(&self.compression_algorithms_client_to_server);
        buf.put_name_list(&self.compression_algorithms_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);

        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeygateError::Protocol`] if the message type is wrong or the
    /// message is truncated.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(data);
        r.expect_message(MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_algorithms_client_to_server = r.read_name_list()?;
        let encryption_algorithms_server_to_client = r.read_name_list()?;
        let mac_algorithms_client_to_server = r.read_name_list()?;
        let mac_algorithms_server_to_client = r.read_name_list()?;
        let compression_algorithms_client_to_server = r.read_name_list()?;
        let compression_algorithms_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// ```text
/// byte    SSH_MSG_NEWKEYS (21)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the NEWKEYS message to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS message from bytes.
    pub fn from_bytes(data: &[u8]) -> KeygateResult<Self> {
        match data {
            [21] => Ok(Self),
            [] => Err(KeygateError::Protocol("NEWKEYS message is empty".to_string())),
            _ => Err(KeygateError::Protocol(format!(
                "Invalid NEWKEYS message: expected [21], got type {} ({} bytes)",
                data[0],
                data.len()
            ))),
        }
    }
}

/// Algorithms agreed for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange algorithm.
    pub kex: String,
    /// Host key algorithm.
    pub host_key: String,
    /// Cipher client to server.
    pub encryption_client_to_server: String,
    /// Cipher server to client.
    pub encryption_server_to_client: String,
    /// MAC client to server.
    pub mac_client_to_server: String,
    /// MAC server to client.
    pub mac_server_to_client: String,
    /// Compression client to server.
    pub compression_client_to_server: String,
    /// Compression server to client.
    pub compression_server_to_client: String,
}

/// Negotiates algorithms between client and server.
///
/// Uses the first algorithm in the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns a [`KeygateError::Disconnect`] with reason
/// [`DisconnectReason::KeyExchangeFailed`] if no common algorithm exists.
///
/// # Example
///
/// ```rust
/// use keygate_proto::ssh::algorithms::Category;
/// use keygate_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-cbc".to_string(), "aes128-cbc".to_string()];
/// let server = vec!["aes128-cbc".to_string(), "aes256-cbc".to_string()];
///
/// let result = negotiate_algorithm(Category::Encryption, &client, &server).unwrap();
/// assert_eq!(result, "aes256-cbc");
/// ```
pub fn negotiate_algorithm(
    category: Category,
    client_list: &[String],
    server_list: &[String],
) -> KeygateResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| KeygateError::Disconnect {
            code: DisconnectReason::KeyExchangeFailed.code(),
            reason: format!("No matching {} algorithm found", category),
        })
}

fn negotiate_host_key(client_list: &[String], server_list: &[String]) -> KeygateResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| KeygateError::Disconnect {
            code: DisconnectReason::KeyExchangeFailed.code(),
            reason: "No matching host key algorithm found".to_string(),
        })
}

/// Negotiates every category from the two KEXINIT messages.
///
/// With `compression_disabled`, compression resolves to "none" without
/// consulting the lists.
pub fn negotiate(
    client: &KexInit,
    server: &KexInit,
    compression_disabled: bool,
) -> KeygateResult<NegotiatedAlgorithms> {
    let compression = |client_list: &[String], server_list: &[String]| {
        if compression_disabled {
            Ok(COMPRESSION_NONE.to_string())
        } else {
            negotiate_algorithm(Category::Compression, client_list, server_list)
        }
    };

    Ok(NegotiatedAlgorithms {
        kex: negotiate_algorithm(Category::Kex, &client.kex_algorithms, &server.kex_algorithms)?,
        host_key: negotiate_host_key(
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?,
        encryption_client_to_server: negotiate_algorithm(
            Category::Encryption,
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?,
        encryption_server_to_client: negotiate_algorithm(
            Category::Encryption,
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
        )?,
        mac_client_to_server: negotiate_algorithm(
            Category::Mac,
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
        )?,
        mac_server_to_client: negotiate_algorithm(
            Category::Mac,
            &client.mac_algorithms_server_to_client,
            &server.mac_algorithms_server_to_client,
        )?,
        compression_client_to_server: compression(
            &client.compression_algorithms_client_to_server,
            &server.compression_algorithms_client_to_server,
        )?,
        compression_server_to_client: compression(
            &client.compression_algorithms_server_to_client,
            &server.compression_algorithms_server_to_client,
        )?,
    })
}
