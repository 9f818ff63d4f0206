//! SSH packet protection.
//!
//! This module implements the encryption and MAC algorithms of the transport:
//! - chacha20-poly1305@openssh.com (AEAD, encrypted length)
//! - aes128-gcm@openssh.com, aes256-gcm@openssh.com (AEAD, length as AAD, RFC 5647)
//! - aes128-cbc, aes256-cbc (with a separate encrypt-and-MAC HMAC)
//! - hmac-sha2-256, hmac-sha2-512, hmac-sha1
//!
//! A [`Sealer`] protects outgoing packets and an [`Opener`] checks incoming
//! ones. Both start out as `None` and are replaced after NEWKEYS.
//!
//! # Security
//!
//! - **AEAD ciphers** - nonces derive from the packet sequence number (ChaCha)
//!   or an invocation counter (GCM), never reused within a key
//! - **MAC comparison** - constant time via `subtle`
//! - **Key material** - zeroized on drop

use crate::ssh::kex_dh::{derive_key, KexHash};
use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use keygate_platform::{KeygateError, KeygateResult};
use ring::aead::chacha20_poly1305_openssh as chacha;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM,
};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an AEAD authentication tag.
const TAG_LEN: usize = 16;

/// Nonce sequence for AES-GCM (RFC 5647 Section 7.1).
///
/// The 12-byte IV is a 4-byte fixed field followed by a 64-bit invocation
/// counter that increments after every packet.
pub struct GcmNonce {
    fixed: [u8; 4],
    invocation: u64,
}

impl GcmNonce {
    fn new(iv: &[u8]) -> Self {
        let mut fixed = [0u8; 4];
        fixed.copy_from_slice(&iv[..4]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&iv[4..12]);
        Self {
            fixed,
            invocation: u64::from_be_bytes(counter),
        }
    }
}

impl NonceSequence for GcmNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&self.fixed);
        nonce_bytes[4..].copy_from_slice(&self.invocation.to_be_bytes());
        self.invocation = self.invocation.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher (OpenSSH variant)
    ChaCha20Poly1305,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-CBC block cipher (requires separate MAC)
    Aes256Cbc,
    /// AES-128-CBC block cipher (requires separate MAC)
    Aes128Cbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => chacha::KEY_LEN,
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Cbc => 32,
            CipherAlgorithm::Aes128Cbc => 16,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes128Gcm => 12,
            CipherAlgorithm::Aes256Cbc | CipherAlgorithm::Aes128Cbc => 16,
        }
    }

    /// Returns the cipher block size used for padding.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns true if this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            _ => None,
        }
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
    /// HMAC-SHA1
    HmacSha1,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
            MacAlgorithm::HmacSha1 => 20,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            _ => None,
        }
    }
}

/// MAC key for computing message authentication codes.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KeygateResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(KeygateError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `HMAC(key, sequence || packet)` (RFC 4253 Section 6.4).
    pub fn compute(&self, sequence: u32, packet_data: &[u8]) -> KeygateResult<Vec<u8>> {
        fn run<M: Mac + hmac::digest::KeyInit>(
            key: &[u8],
            sequence: u32,
            data: &[u8],
        ) -> KeygateResult<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|_| KeygateError::Security("Invalid HMAC key length".to_string()))?;
            mac.update(&sequence.to_be_bytes());
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        match self.algorithm {
            MacAlgorithm::HmacSha256 => run::<Hmac<Sha256>>(&self.key, sequence, packet_data),
            MacAlgorithm::HmacSha512 => run::<Hmac<Sha512>>(&self.key, sequence, packet_data),
            MacAlgorithm::HmacSha1 => run::<Hmac<Sha1>>(&self.key, sequence, packet_data),
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(
        &self,
        sequence: u32,
        packet_data: &[u8],
        received_mac: &[u8],
    ) -> KeygateResult<()> {
        let computed_mac = self.compute(sequence, packet_data)?;

        if computed_mac.len() != received_mac.len() {
            return Err(KeygateError::Security("MAC length mismatch".to_string()));
        }

        if computed_mac.ct_eq(received_mac).into() {
            Ok(())
        } else {
            Err(KeygateError::Security("MAC verification failed".to_string()))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Direction of a set of session keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server (letters A, C, E)
    ClientToServer,
    /// Server to client (letters B, D, F)
    ServerToClient,
}

/// Keys for one direction, derived after key exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DirectionKeys {
    /// Initial IV
    pub iv: Vec<u8>,
    /// Encryption key
    pub encryption: Vec<u8>,
    /// Integrity key
    pub integrity: Vec<u8>,
}

impl DirectionKeys {
    /// Derives the keys of one direction (RFC 4253 Section 7.2).
    pub fn derive(
        hash: KexHash,
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        direction: Direction,
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
    ) -> Self {
        let [iv, enc, int] = match direction {
            Direction::ClientToServer => [b'A', b'C', b'E'],
            Direction::ServerToClient => [b'B', b'D', b'F'],
        };
        let derive = |letter, len| {
            derive_key(hash, shared_secret, exchange_hash, session_id, letter, len)
        };

        Self {
            iv: derive(iv, cipher.iv_size()),
            encryption: derive(enc, cipher.key_size()),
            integrity: mac.map(|m| derive(int, m.key_size())).unwrap_or_default(),
        }
    }
}

/// AES-CBC encryption state, chained across packets.
pub enum CbcEncryptor {
    #[doc(hidden)]
    Aes128(cbc::Encryptor<Aes128>),
    #[doc(hidden)]
    Aes256(cbc::Encryptor<Aes256>),
}

impl CbcEncryptor {
    fn new(cipher: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeygateResult<Self> {
        let invalid = |_| KeygateError::Security("Invalid AES-CBC key or IV length".to_string());
        match cipher {
            CipherAlgorithm::Aes128Cbc => Ok(CbcEncryptor::Aes128(
                cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?,
            )),
            _ => Ok(CbcEncryptor::Aes256(
                cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?,
            )),
        }
    }

    fn encrypt(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(16) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                CbcEncryptor::Aes128(e) => e.encrypt_block_mut(block),
                CbcEncryptor::Aes256(e) => e.encrypt_block_mut(block),
            }
        }
    }
}

/// AES-CBC decryption state, chained across packets.
pub enum CbcDecryptor {
    #[doc(hidden)]
    Aes128(cbc::Decryptor<Aes128>),
    #[doc(hidden)]
    Aes256(cbc::Decryptor<Aes256>),
}

impl CbcDecryptor {
    fn new(cipher: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeygateResult<Self> {
        let invalid = |_| KeygateError::Security("Invalid AES-CBC key or IV length".to_string());
        match cipher {
            CipherAlgorithm::Aes128Cbc => Ok(CbcDecryptor::Aes128(
                cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?,
            )),
            _ => Ok(CbcDecryptor::Aes256(
                cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?,
            )),
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(16) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                CbcDecryptor::Aes128(d) => d.decrypt_block_mut(block),
                CbcDecryptor::Aes256(d) => d.decrypt_block_mut(block),
            }
        }
    }
}

fn chacha_key(material: &[u8]) -> KeygateResult<[u8; chacha::KEY_LEN]> {
    material.try_into().map_err(|_| {
        KeygateError::Security(format!(
            "Insufficient key material: expected {}, got {}",
            chacha::KEY_LEN,
            material.len()
        ))
    })
}

fn gcm_key(cipher: CipherAlgorithm, material: &[u8]) -> KeygateResult<UnboundKey> {
    let algorithm = match cipher {
        CipherAlgorithm::Aes128Gcm => &AES_128_GCM,
        _ => &AES_256_GCM,
    };
    UnboundKey::new(algorithm, material)
        .map_err(|_| KeygateError::Security(format!("Failed to create {} key", cipher.name())))
}

fn check_lengths(
    cipher: CipherAlgorithm,
    mac: Option<MacAlgorithm>,
    keys: &DirectionKeys,
) -> KeygateResult<()> {
    if keys.encryption.len() != cipher.key_size() || keys.iv.len() != cipher.iv_size() {
        return Err(KeygateError::Security(format!(
            "Invalid key material for {}",
            cipher.name()
        )));
    }
    if !cipher.is_aead() && mac.is_none() {
        return Err(KeygateError::Security(format!(
            "{} requires a MAC algorithm",
            cipher.name()
        )));
    }
    Ok(())
}

/// Protection applied to outgoing packets.
pub enum Sealer {
    /// No protection (before the first NEWKEYS)
    None,
    /// chacha20-poly1305@openssh.com
    ChaCha(chacha::SealingKey),
    /// AES-GCM
    Gcm(SealingKey<GcmNonce>),
    /// AES-CBC with HMAC
    Cbc(CbcEncryptor, MacKey),
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Sealer::None => "none",
            Sealer::ChaCha(_) => "chacha20-poly1305",
            Sealer::Gcm(_) => "aes-gcm",
            Sealer::Cbc(_, _) => "aes-cbc",
        };
        f.debug_tuple("Sealer").field(&kind).finish()
    }
}

impl Sealer {
    /// Builds a sealer from negotiated algorithms and derived keys.
    ///
    /// The MAC is ignored for AEAD ciphers.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        keys: &DirectionKeys,
    ) -> KeygateResult<Self> {
        check_lengths(cipher, mac, keys)?;
        match (cipher, mac) {
            (CipherAlgorithm::ChaCha20Poly1305, _) => Ok(Sealer::ChaCha(chacha::SealingKey::new(
                &chacha_key(&keys.encryption)?,
            ))),
            (CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm, _) => Ok(Sealer::Gcm(
                SealingKey::new(gcm_key(cipher, &keys.encryption)?, GcmNonce::new(&keys.iv)),
            )),
            (_, Some(mac)) => Ok(Sealer::Cbc(
                CbcEncryptor::new(cipher, &keys.encryption, &keys.iv)?,
                MacKey::new(mac, &keys.integrity)?,
            )),
            (_, None) => Err(KeygateError::Security("Missing MAC algorithm".to_string())),
        }
    }

    /// Padding alignment for outgoing packets.
    pub fn block_size(&self) -> usize {
        match self {
            Sealer::None | Sealer::ChaCha(_) => 8,
            Sealer::Gcm(_) | Sealer::Cbc(_, _) => 16,
        }
    }

    /// True if the length field is excluded from padding alignment.
    pub fn excludes_length(&self) -> bool {
        matches!(self, Sealer::ChaCha(_) | Sealer::Gcm(_))
    }

    /// Encrypts `packet` (length field included) in place and appends the
    /// tag or MAC.
    pub fn seal(&mut self, sequence: u32, packet: &mut Vec<u8>) -> KeygateResult<()> {
        match self {
            Sealer::None => Ok(()),
            Sealer::ChaCha(key) => {
                let mut tag = [0u8; TAG_LEN];
                key.seal_in_place(sequence, packet, &mut tag);
                packet.extend_from_slice(&tag);
                Ok(())
            }
            Sealer::Gcm(key) => {
                let mut length = [0u8; 4];
                length.copy_from_slice(&packet[..4]);
                let tag = key
                    .seal_in_place_separate_tag(Aad::from(length), &mut packet[4..])
                    .map_err(|_| KeygateError::Security("Encryption failed".to_string()))?;
                packet.extend_from_slice(tag.as_ref());
                Ok(())
            }
            Sealer::Cbc(encryptor, mac) => {
                let tag = mac.compute(sequence, packet)?;
                encryptor.encrypt(packet);
                packet.extend_from_slice(&tag);
                Ok(())
            }
        }
    }
}

/// Verification and decryption of incoming packets.
pub enum Opener {
    /// No protection (before the first NEWKEYS)
    None,
    /// chacha20-poly1305@openssh.com
    ChaCha(chacha::OpeningKey),
    /// AES-GCM
    Gcm(OpeningKey<GcmNonce>),
    /// AES-CBC with HMAC
    Cbc(CbcDecryptor, MacKey),
}

impl std::fmt::Debug for Opener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Opener::None => "none",
            Opener::ChaCha(_) => "chacha20-poly1305",
            Opener::Gcm(_) => "aes-gcm",
            Opener::Cbc(_, _) => "aes-cbc",
        };
        f.debug_tuple("Opener").field(&kind).finish()
    }
}

impl Opener {
    /// Builds an opener from negotiated algorithms and derived keys.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        keys: &DirectionKeys,
    ) -> KeygateResult<Self> {
        check_lengths(cipher, mac, keys)?;
        match (cipher, mac) {
            (CipherAlgorithm::ChaCha20Poly1305, _) => Ok(Opener::ChaCha(chacha::OpeningKey::new(
                &chacha_key(&keys.encryption)?,
            ))),
            (CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm, _) => Ok(Opener::Gcm(
                OpeningKey::new(gcm_key(cipher, &keys.encryption)?, GcmNonce::new(&keys.iv)),
            )),
            (_, Some(mac)) => Ok(Opener::Cbc(
                CbcDecryptor::new(cipher, &keys.encryption, &keys.iv)?,
                MacKey::new(mac, &keys.integrity)?,
            )),
            (_, None) => Err(KeygateError::Security("Missing MAC algorithm".to_string())),
        }
    }

    /// Number of bytes to read before the packet length is known.
    pub fn first_block_len(&self) -> usize {
        match self {
            Opener::Cbc(_, _) => 16,
            _ => 4,
        }
    }

    /// Padding alignment expected on incoming packets.
    pub fn block_size(&self) -> usize {
        match self {
            Opener::None | Opener::ChaCha(_) => 8,
            Opener::Gcm(_) | Opener::Cbc(_, _) => 16,
        }
    }

    /// True if the length field is excluded from padding alignment.
    pub fn excludes_length(&self) -> bool {
        matches!(self, Opener::ChaCha(_) | Opener::Gcm(_))
    }

    /// Bytes following the packet: AEAD tag or MAC.
    pub fn trailer_len(&self) -> usize {
        match self {
            Opener::None => 0,
            Opener::ChaCha(_) | Opener::Gcm(_) => TAG_LEN,
            Opener::Cbc(_, mac) => mac.algorithm().mac_size(),
        }
    }

    /// Recovers the packet length from the first block.
    ///
    /// For CBC the block is decrypted in place; other ciphers leave it
    /// untouched.
    pub fn decrypt_length(&mut self, sequence: u32, first_block: &mut [u8]) -> u32 {
        let mut raw = [0u8; 4];
        match self {
            Opener::None | Opener::Gcm(_) => raw.copy_from_slice(&first_block[..4]),
            Opener::ChaCha(key) => {
                raw.copy_from_slice(&first_block[..4]);
                raw = key.decrypt_packet_length(sequence, raw);
            }
            Opener::Cbc(decryptor, _) => {
                decryptor.decrypt(&mut first_block[..16]);
                raw.copy_from_slice(&first_block[..4]);
            }
        }
        u32::from_be_bytes(raw)
    }

    /// Authenticates and decrypts a full packet.
    ///
    /// `packet` holds the first block as left by [`Opener::decrypt_length`]
    /// followed by the rest of the packet. Returns everything after the
    /// length field: padding length, payload and padding.
    pub fn open(
        &mut self,
        sequence: u32,
        packet: &mut [u8],
        trailer: &[u8],
    ) -> KeygateResult<Vec<u8>> {
        match self {
            Opener::None => Ok(packet[4..].to_vec()),
            Opener::ChaCha(key) => {
                let tag: &[u8; TAG_LEN] = trailer
                    .try_into()
                    .map_err(|_| KeygateError::Security("Invalid tag length".to_string()))?;
                let plaintext = key
                    .open_in_place(sequence, packet, tag)
                    .map_err(|_| KeygateError::Security("MAC verification failed".to_string()))?;
                Ok(plaintext.to_vec())
            }
            Opener::Gcm(key) => {
                let mut length = [0u8; 4];
                length.copy_from_slice(&packet[..4]);
                let mut in_out = Vec::with_capacity(packet.len() - 4 + trailer.len());
                in_out.extend_from_slice(&packet[4..]);
                in_out.extend_from_slice(trailer);
                let plaintext = key
                    .open_in_place(Aad::from(length), &mut in_out)
                    .map_err(|_| KeygateError::Security("MAC verification failed".to_string()))?;
                Ok(plaintext.to_vec())
            }
            Opener::Cbc(decryptor, mac) => {
                decryptor.decrypt(&mut packet[16..]);
                mac.verify(sequence, packet, trailer)?;
                Ok(packet[4..].to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::{ENCRYPTION_ALGORITHMS, MAC_ALGORITHMS};

    fn keys_for(cipher: CipherAlgorithm, mac: Option<MacAlgorithm>) -> DirectionKeys {
        DirectionKeys::derive(
            KexHash::Sha256,
            &[0x42; 32],
            &[0x01; 32],
            &[0x02; 32],
            Direction::ClientToServer,
            cipher,
            mac,
        )
    }

    /// Builds `len || pad_len || payload || padding` aligned for `block`.
    fn plain_packet(payload: &[u8], block: usize, excludes_length: bool) -> Vec<u8> {
        let base = if excludes_length { 1 } else { 5 } + payload.len();
        let mut pad = block - base % block;
        if pad < 4 {
            pad += block;
        }
        let packet_len = (1 + payload.len() + pad) as u32;
        let mut out = packet_len.to_be_bytes().to_vec();
        out.push(pad as u8);
        out.extend_from_slice(payload);
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    fn transfer(
        sealer: &mut Sealer,
        opener: &mut Opener,
        seq: u32,
        payload: &[u8],
    ) -> KeygateResult<Vec<u8>> {
        let mut wire = plain_packet(payload, sealer.block_size(), sealer.excludes_length());
        sealer.seal(seq, &mut wire)?;

        let first = opener.first_block_len();
        let length = opener.decrypt_length(seq, &mut wire[..first]) as usize;
        let (packet, trailer) = wire.split_at_mut(4 + length);
        let body = opener.open(seq, packet, trailer)?;
        let pad = body[0] as usize;
        Ok(body[1..body.len() - pad].to_vec())
    }

    #[test]
    fn test_cipher_algorithm_properties() {
        let chacha = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chacha.key_size(), 64);
        assert_eq!(chacha.iv_size(), 0);
        assert_eq!(chacha.block_size(), 8);
        assert!(chacha.is_aead());

        let aes128_cbc = CipherAlgorithm::Aes128Cbc;
        assert_eq!(aes128_cbc.key_size(), 16);
        assert_eq!(aes128_cbc.iv_size(), 16);
        assert!(!aes128_cbc.is_aead());
    }

    #[test]
    fn test_every_registered_name_maps() {
        for name in ENCRYPTION_ALGORITHMS {
            assert_eq!(CipherAlgorithm::from_name(name).unwrap().name(), *name);
        }
        for name in MAC_ALGORITHMS {
            assert_eq!(MacAlgorithm::from_name(name).unwrap().name(), *name);
        }
        assert!(CipherAlgorithm::from_name("aes128-ctr").is_none());
        assert!(MacAlgorithm::from_name("hmac-md5").is_none());
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let mac_key = MacKey::new(MacAlgorithm::HmacSha1, &[7u8; 20]).unwrap();
        let mac = mac_key.compute(3, b"Hello, SSH!").unwrap();
        assert_eq!(mac.len(), 20);

        assert!(mac_key.verify(3, b"Hello, SSH!", &mac).is_ok());
        assert!(mac_key.verify(4, b"Hello, SSH!", &mac).is_err());
        assert!(mac_key.verify(3, b"Hello, SSH!", &[0u8; 20]).is_err());
    }

    #[test]
    fn test_mac_insufficient_key() {
        assert!(MacKey::new(MacAlgorithm::HmacSha512, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_every_cipher_protects_packets() {
        let mac = Some(MacAlgorithm::HmacSha256);
        for name in ENCRYPTION_ALGORITHMS {
            let cipher = CipherAlgorithm::from_name(name).unwrap();
            let keys = keys_for(cipher, mac);
            let mut sealer = Sealer::new(cipher, mac, &keys).unwrap();
            let mut opener = Opener::new(cipher, mac, &keys).unwrap();

            for seq in 0..3u32 {
                let payload = format!("packet {} over {}", seq, name);
                let got = transfer(&mut sealer, &mut opener, seq, payload.as_bytes()).unwrap();
                assert_eq!(got, payload.as_bytes(), "{}", name);
            }
        }
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let mac = Some(MacAlgorithm::HmacSha1);
        for name in ["chacha20-poly1305@openssh.com", "aes128-gcm@openssh.com", "aes128-cbc"] {
            let cipher = CipherAlgorithm::from_name(name).unwrap();
            let keys = keys_for(cipher, mac);
            let mut sealer = Sealer::new(cipher, mac, &keys).unwrap();
            let mut opener = Opener::new(cipher, mac, &keys).unwrap();

            let mut wire = plain_packet(b"payload", sealer.block_size(), sealer.excludes_length());
            sealer.seal(0, &mut wire).unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 0x01;

            let first = opener.first_block_len();
            let length = opener.decrypt_length(0, &mut wire[..first]) as usize;
            let (packet, trailer) = wire.split_at_mut(4 + length);
            assert!(
                matches!(opener.open(0, packet, trailer), Err(KeygateError::Security(_))),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_cbc_requires_mac() {
        let keys = keys_for(CipherAlgorithm::Aes256Cbc, None);
        assert!(Sealer::new(CipherAlgorithm::Aes256Cbc, None, &keys).is_err());
    }

    #[test]
    fn test_gcm_nonce_increments() {
        let mut nonce = GcmNonce::new(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0xff]);
        let first = nonce.advance().unwrap();
        let second = nonce.advance().unwrap();
        assert_eq!(first.as_ref()[11], 0xff);
        assert_eq!(&second.as_ref()[8..], &[0, 0, 1, 0]);
    }
}
