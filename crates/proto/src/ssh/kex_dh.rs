//! Diffie-Hellman key exchange (RFC 4253, RFC 8268, RFC 8731).
//!
//! This module implements:
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - diffie-hellman-group14-sha256 (RFC 8268)
//! - diffie-hellman-group14-sha1 (RFC 4253)
//! - Exchange hash computation and session key derivation
//!
//! # Security
//!
//! - DH Group14: 2048-bit MODP group, peer values range-checked
//! - Curve25519: constant-time operations via `ring`
//! - DH private exponents are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::kex_dh::{KexMethod, KeyExchange};
//!
//! let method = KexMethod::from_name("curve25519-sha256").unwrap();
//! let client = KeyExchange::start(method).unwrap();
//! let server = KeyExchange::start(method).unwrap();
//!
//! let client_public = client.public_value();
//! let server_public = server.public_value();
//!
//! let k1 = client.finish(&server_public).unwrap();
//! let k2 = server.finish(&client_public).unwrap();
//! assert_eq!(k1, k2);
//! ```

use crate::ssh::wire::WireWrite;
use bytes::BytesMut;
use keygate_platform::{KeygateError, KeygateResult};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Diffie-Hellman Group 14 parameters (RFC 3526).
///
/// This is a 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("group14 prime is valid hex"),
        )
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Hash function used for the exchange hash and key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexHash {
    /// SHA-256
    Sha256,
    /// SHA-1 (diffie-hellman-group14-sha1 only)
    Sha1,
}

impl KexHash {
    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            KexHash::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            KexHash::Sha1 => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

/// Group of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexGroup {
    /// X25519 ECDH
    Curve25519,
    /// 2048-bit MODP
    DhGroup14,
}

/// A negotiated key exchange method: group plus hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KexMethod {
    /// Group used for the agreement
    pub group: KexGroup,
    /// Hash used for H and key derivation
    pub hash: KexHash,
}

impl KexMethod {
    /// Looks up a method by its SSH name.
    pub fn from_name(name: &str) -> KeygateResult<Self> {
        let (group, hash) = match name {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                (KexGroup::Curve25519, KexHash::Sha256)
            }
            "diffie-hellman-group14-sha256" => (KexGroup::DhGroup14, KexHash::Sha256),
            "diffie-hellman-group14-sha1" => (KexGroup::DhGroup14, KexHash::Sha1),
            other => {
                return Err(KeygateError::Protocol(format!(
                    "Unsupported key exchange algorithm: {}",
                    other
                )))
            }
        };
        Ok(Self { group, hash })
    }

    /// Writes an ephemeral public value in this method's wire encoding.
    ///
    /// ECDH values are strings (RFC 5656), DH values are mpints.
    pub fn put_public(&self, buf: &mut BytesMut, value: &[u8]) {
        match self.group {
            KexGroup::Curve25519 => buf.put_string(value),
            KexGroup::DhGroup14 => buf.put_mpint(value),
        }
    }
}

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    /// Private key (x)
    private_key: Vec<u8>,
    /// Public key (g^x mod p)
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a new DH Group 14 key pair.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};
        use rand::thread_rng;

        let mut rng = thread_rng();

        // 1 < x < p-1
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);

        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret given the peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`KeygateError::Protocol`] if the peer value is outside `(1, p-1)`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> KeygateResult<Vec<u8>> {
        use num_bigint::BigUint;

        let y_peer = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;

        if y_peer <= BigUint::from(1u32) || y_peer >= p_minus_one {
            return Err(KeygateError::Protocol(
                "Invalid peer public key: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);

        Ok(k.to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a new Curve25519 key pair.
    pub fn new() -> KeygateResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| KeygateError::Security("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            KeygateError::Security("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret given the peer's public key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> KeygateResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(KeygateError::Protocol(format!(
                "Invalid Curve25519 public key length: {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| KeygateError::Security("Curve25519 key agreement failed".to_string()))
    }
}

/// Ephemeral state of one side of a key exchange.
pub enum KeyExchange {
    /// X25519 state
    Curve25519(Curve25519Exchange),
    /// MODP group 14 state
    DhGroup14(DhGroup14Exchange),
}

impl KeyExchange {
    /// Generates a fresh key pair for `method`.
    pub fn start(method: KexMethod) -> KeygateResult<Self> {
        match method.group {
            KexGroup::Curve25519 => Ok(KeyExchange::Curve25519(Curve25519Exchange::new()?)),
            KexGroup::DhGroup14 => Ok(KeyExchange::DhGroup14(DhGroup14Exchange::new())),
        }
    }

    /// Returns our public value (Q or e/f) as raw bytes.
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            KeyExchange::Curve25519(x) => x.public_key().to_vec(),
            KeyExchange::DhGroup14(x) => x.public_key().to_vec(),
        }
    }

    /// Completes the agreement and returns the shared secret K.
    pub fn finish(self, peer_public: &[u8]) -> KeygateResult<Vec<u8>> {
        match self {
            KeyExchange::Curve25519(x) => x.compute_shared_secret(peer_public),
            KeyExchange::DhGroup14(x) => x.compute_shared_secret(peer_public),
        }
    }
}

/// Inputs of the exchange hash H (RFC 4253 Section 8, RFC 5656 Section 4).
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// V_C, without CR LF
    pub client_version: &'a str,
    /// V_S, without CR LF
    pub server_version: &'a str,
    /// I_C, the client's KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S, the server host key blob
    pub host_key: &'a [u8],
    /// Client ephemeral public value
    pub client_public: &'a [u8],
    /// Server ephemeral public value
    pub server_public: &'a [u8],
    /// Shared secret K
    pub shared_secret: &'a [u8],
}

impl ExchangeHashInput<'_> {
    /// Computes H for `method`.
    pub fn compute(&self, method: KexMethod) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_str(self.client_version);
        buf.put_str(self.server_version);
        buf.put_string(self.client_kexinit);
        buf.put_string(self.server_kexinit);
        buf.put_string(self.host_key);
        method.put_public(&mut buf, self.client_public);
        method.put_public(&mut buf, self.server_public);
        buf.put_mpint(self.shared_secret);
        method.hash.digest(&[&buf])
    }
}

/// Derives one session key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// key = K1 || K2 || K3 ...
/// ```
///
/// `letter` is 'A' through 'F': IVs, encryption keys, then integrity keys,
/// client to server first.
///
/// # Example
///
/// ```rust
/// use keygate_proto::ssh::kex_dh::{derive_key, KexHash};
///
/// let key = derive_key(KexHash::Sha256, &[0x42; 32], &[1; 32], &[2; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = BytesMut::new();
    k_mpint.put_mpint(shared_secret);

    let mut key = hash.digest(&[&k_mpint, exchange_hash, &[letter], session_id]);
    while key.len() < key_length {
        let block = hash.digest(&[&k_mpint, exchange_hash, &key]);
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(client_secret, server_secret);
        assert!(!client_secret.is_empty());
    }

    #[test]
    fn test_dh_group14_invalid_peer_key() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange.compute_shared_secret(&[]).is_err());

        let p_minus_one = (dh_group14::P.clone() - 1u32).to_bytes_be();
        assert!(exchange.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_rejects_wrong_length() {
        let exchange = Curve25519Exchange::new().unwrap();
        assert!(exchange.compute_shared_secret(&[7u8; 31]).is_err());
    }

    #[test]
    fn test_method_lookup() {
        let m = KexMethod::from_name("curve25519-sha256@libssh.org").unwrap();
        assert_eq!(m.group, KexGroup::Curve25519);
        let m = KexMethod::from_name("diffie-hellman-group14-sha1").unwrap();
        assert_eq!(m.hash, KexHash::Sha1);
        assert!(KexMethod::from_name("diffie-hellman-group1-sha1").is_err());
    }

    #[test]
    fn test_key_exchange_every_method() {
        for name in crate::ssh::algorithms::KEX_ALGORITHMS {
            let method = KexMethod::from_name(name).unwrap();
            let a = KeyExchange::start(method).unwrap();
            let b = KeyExchange::start(method).unwrap();
            let (pa, pb) = (a.public_value(), b.public_value());
            assert_eq!(a.finish(&pb).unwrap(), b.finish(&pa).unwrap(), "{}", name);
        }
    }

    #[test]
    fn test_exchange_hash_length_follows_hash() {
        let input = ExchangeHashInput {
            client_version: "SSH-2.0-a",
            server_version: "SSH-2.0-b",
            client_kexinit: &[20],
            server_kexinit: &[20],
            host_key: &[1, 2, 3],
            client_public: &[4; 32],
            server_public: &[5; 32],
            shared_secret: &[6; 32],
        };
        let sha256 = KexMethod::from_name("curve25519-sha256").unwrap();
        let sha1 = KexMethod::from_name("diffie-hellman-group14-sha1").unwrap();
        assert_eq!(input.compute(sha256).len(), 32);
        assert_eq!(input.compute(sha1).len(), 20);
    }

    #[test]
    fn test_derive_key_distinct_letters() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 32];
        let sid = vec![0x02; 32];

        let key_a = derive_key(KexHash::Sha256, &k, &h, &sid, b'A', 32);
        let key_c = derive_key(KexHash::Sha256, &k, &h, &sid, b'C', 32);
        assert_ne!(key_a, key_c);
    }

    #[test]
    fn test_derive_key_extension() {
        let k = vec![0x42; 32];
        let h = vec![0x01; 20];
        let sid = vec![0x02; 20];

        let short = derive_key(KexHash::Sha1, &k, &h, &sid, b'C', 20);
        let long = derive_key(KexHash::Sha1, &k, &h, &sid, b'C', 64);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..20], &short[..]);

        let mut k_mpint = BytesMut::new();
        k_mpint.put_mpint(&k);
        let k2 = KexHash::Sha1.digest(&[&k_mpint, &h, &short]);
        assert_eq!(&long[20..40], &k2[..]);
        let k3 = KexHash::Sha1.digest(&[&k_mpint, &h, &long[..40]]);
        assert_eq!(&long[40..60], &k3[..]);
    }
}
