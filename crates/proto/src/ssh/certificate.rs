//! OpenSSH user certificates (`ssh-ed25519-cert-v01@openssh.com`).
//!
//! A certificate binds a public key to a key id, a set of principals and a
//! validity window, signed by a certificate authority (CA) key. Clients
//! present it in place of the plain key during publickey authentication;
//! servers trust it when the CA key is trusted.
//!
//! # Wire format
//!
//! ```text
//! string    "ssh-ed25519-cert-v01@openssh.com"
//! string    nonce
//! string    pk
//! uint64    serial
//! uint32    type (1 = user, 2 = host)
//! string    key id
//! string    valid principals
//! uint64    valid after
//! uint64    valid before
//! string    critical options
//! string    extensions
//! string    reserved
//! string    signature key
//! string    signature
//! ```
//!
//! The CA signature covers every field before it.

use crate::ssh::privatekey::{PrivateKey, PublicKey};
use crate::ssh::wire::{WireReader, WireWrite};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};
use rand::RngCore;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Certificate algorithm name for Ed25519 keys.
pub const CERT_ED25519: &str = "ssh-ed25519-cert-v01@openssh.com";

/// Certificate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertType {
    /// User certificate
    User,
    /// Host certificate
    Host,
}

impl CertType {
    fn code(self) -> u32 {
        match self {
            CertType::User => 1,
            CertType::Host => 2,
        }
    }

    fn from_code(code: u32) -> KeygateResult<Self> {
        match code {
            1 => Ok(CertType::User),
            2 => Ok(CertType::Host),
            other => Err(KeygateError::Protocol(format!(
                "Unknown certificate type {}",
                other
            ))),
        }
    }
}

/// A parsed OpenSSH certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    nonce: Vec<u8>,
    key: PublicKey,
    serial: u64,
    cert_type: CertType,
    key_id: String,
    principals: Vec<String>,
    valid_after: u64,
    valid_before: u64,
    critical_options: Vec<(String, Vec<u8>)>,
    extensions: Vec<(String, Vec<u8>)>,
    signature_key: PublicKey,
    signature: Vec<u8>,
    blob: Vec<u8>,
    signed_len: usize,
}

fn read_options(data: &[u8]) -> KeygateResult<Vec<(String, Vec<u8>)>> {
    let mut r = WireReader::new(data);
    let mut out = Vec::new();
    while !r.is_empty() {
        let name = r.read_utf8()?;
        let value = r.read_string()?.to_vec();
        out.push((name, value));
    }
    Ok(out)
}

fn write_options(options: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for (name, value) in options {
        buf.put_str(name);
        buf.put_string(value);
    }
    buf.to_vec()
}

impl Certificate {
    /// Parses a certificate wire blob.
    pub fn from_blob(blob: &[u8]) -> KeygateResult<Self> {
        let mut r = WireReader::new(blob);
        let algorithm = r.read_utf8()?;
        if algorithm != CERT_ED25519 {
            return Err(KeygateError::Protocol(format!(
                "Unsupported certificate type: {}",
                algorithm
            )));
        }

        let nonce = r.read_string()?.to_vec();
        let key = PublicKey::read_ed25519_body(&mut r)?;
        let serial = r.read_u64()?;
        let cert_type = CertType::from_code(r.read_u32()?)?;
        let key_id = r.read_utf8()?;

        let mut principals = Vec::new();
        let mut pr = WireReader::new(r.read_string()?);
        while !pr.is_empty() {
            principals.push(pr.read_utf8()?);
        }

        let valid_after = r.read_u64()?;
        let valid_before = r.read_u64()?;
        let critical_options = read_options(r.read_string()?)?;
        let extensions = read_options(r.read_string()?)?;
        let _reserved = r.read_string()?;
        let signature_key = PublicKey::from_blob(r.read_string()?)?;
        let signed_len = blob.len() - r.remaining();
        let signature = r.read_string()?.to_vec();

        if !r.is_empty() {
            return Err(KeygateError::Protocol(
                "Trailing data after certificate".to_string(),
            ));
        }

        Ok(Self {
            nonce,
            key,
            serial,
            cert_type,
            key_id,
            principals,
            valid_after,
            valid_before,
            critical_options,
            extensions,
            signature_key,
            signature,
            blob: blob.to_vec(),
            signed_len,
        })
    }

    /// Parses `ssh-ed25519-cert-v01@openssh.com AAAA... [comment]`.
    pub fn parse_openssh(text: &str) -> KeygateResult<Self> {
        let mut fields = text.split_whitespace();
        let (algorithm, data) = match (fields.next(), fields.next()) {
            (Some(a), Some(d)) => (a, d),
            _ => return Err(KeygateError::Config("Invalid certificate line".to_string())),
        };
        if algorithm != CERT_ED25519 {
            return Err(KeygateError::Config(format!(
                "Unsupported certificate type: {}",
                algorithm
            )));
        }
        let blob = STANDARD
            .decode(data)
            .map_err(|e| KeygateError::Config(format!("Invalid certificate encoding: {}", e)))?;
        Self::from_blob(&blob)
            .map_err(|e| KeygateError::Config(format!("Invalid certificate: {}", e)))
    }

    /// Loads a certificate file (`id_ed25519-cert.pub`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> KeygateResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse_openssh(&text)
    }

    /// Formats the certificate as a single OpenSSH line.
    pub fn to_openssh(&self) -> String {
        format!("{} {}", CERT_ED25519, STANDARD.encode(&self.blob))
    }

    /// Returns the wire blob.
    pub fn to_blob(&self) -> &[u8] {
        &self.blob
    }

    /// Returns the certified key.
    pub fn key(&self) -> PublicKey {
        self.key
    }

    /// Returns the CA key that signed this certificate.
    pub fn signature_key(&self) -> PublicKey {
        self.signature_key
    }

    /// Returns the serial number.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns the certificate type.
    pub fn cert_type(&self) -> CertType {
        self.cert_type
    }

    /// Returns the key id.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Returns the allowed principals. Empty means any principal.
    pub fn principals(&self) -> &[String] {
        &self.principals
    }

    /// Returns the critical options.
    pub fn critical_options(&self) -> &[(String, Vec<u8>)] {
        &self.critical_options
    }

    /// Returns the extensions.
    pub fn extensions(&self) -> &[(String, Vec<u8>)] {
        &self.extensions
    }

    /// Returns the nonce.
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Checks the CA signature.
    pub fn verify_signature(&self) -> KeygateResult<()> {
        self.signature_key
            .verify(&self.blob[..self.signed_len], &self.signature)
    }

    /// Checks that this certificate lets `principal` log in at `now`
    /// (seconds since the Unix epoch).
    pub fn validate_user(&self, principal: &str, now: u64) -> KeygateResult<()> {
        if self.cert_type != CertType::User {
            return Err(KeygateError::Security(
                "Certificate is not a user certificate".to_string(),
            ));
        }
        if !self.principals.is_empty() && !self.principals.iter().any(|p| p == principal) {
            return Err(KeygateError::Security(format!(
                "Principal {} not listed in certificate",
                principal
            )));
        }
        if now < self.valid_after || now >= self.valid_before {
            return Err(KeygateError::Security(
                "Certificate is not valid at this time".to_string(),
            ));
        }
        if let Some((name, _)) = self.critical_options.first() {
            return Err(KeygateError::Security(format!(
                "Unsupported critical option: {}",
                name
            )));
        }
        self.verify_signature()
    }
}

/// Current time in seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds and signs certificates.
///
/// # Example
///
/// ```rust
/// use keygate_proto::ssh::certificate::CertificateBuilder;
/// use keygate_proto::ssh::privatekey::PrivateKey;
///
/// let ca = PrivateKey::generate("ca");
/// let user = PrivateKey::generate("user");
///
/// let cert = CertificateBuilder::new(user.public_key())
///     .key_id("user-cert")
///     .principal("alice")
///     .sign(&ca);
///
/// assert!(cert.validate_user("alice", 1_700_000_000).is_ok());
/// assert!(cert.validate_user("mallory", 1_700_000_000).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct CertificateBuilder {
    key: PublicKey,
    serial: u64,
    cert_type: CertType,
    key_id: String,
    principals: Vec<String>,
    valid_after: u64,
    valid_before: u64,
    critical_options: Vec<(String, Vec<u8>)>,
    extensions: Vec<(String, Vec<u8>)>,
}

impl CertificateBuilder {
    /// Starts a user certificate for `key`, valid forever, with the
    /// `permit-pty` extension.
    pub fn new(key: PublicKey) -> Self {
        Self {
            key,
            serial: 0,
            cert_type: CertType::User,
            key_id: String::new(),
            principals: Vec::new(),
            valid_after: 0,
            valid_before: u64::MAX,
            critical_options: Vec::new(),
            extensions: vec![("permit-pty".to_string(), Vec::new())],
        }
    }

    /// Sets the serial number.
    pub fn serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    /// Sets the certificate type.
    pub fn cert_type(mut self, cert_type: CertType) -> Self {
        self.cert_type = cert_type;
        self
    }

    /// Sets the key id.
    pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    /// Adds an allowed principal.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principals.push(principal.into());
        self
    }

    /// Sets the validity window.
    pub fn valid(mut self, after: u64, before: u64) -> Self {
        self.valid_after = after;
        self.valid_before = before;
        self
    }

    /// Adds a critical option.
    pub fn critical_option(mut self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.critical_options.push((name.into(), value));
        self
    }

    /// Signs the certificate with `ca`.
    pub fn sign(self, ca: &PrivateKey) -> Certificate {
        let mut nonce = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut principals = BytesMut::new();
        for p in &self.principals {
            principals.put_str(p);
        }

        let mut buf = BytesMut::new();
        buf.put_str(CERT_ED25519);
        buf.put_string(&nonce);
        match &self.key {
            PublicKey::Ed25519(k) => buf.put_string(k),
        }
        buf.put_u64(self.serial);
        buf.put_u32(self.cert_type.code());
        buf.put_str(&self.key_id);
        buf.put_string(&principals);
        buf.put_u64(self.valid_after);
        buf.put_u64(self.valid_before);
        buf.put_string(&write_options(&self.critical_options));
        buf.put_string(&write_options(&self.extensions));
        buf.put_string(&[]);
        buf.put_string(&ca.public_key().to_blob());

        let signed_len = buf.len();
        let signature = ca.sign_blob(&buf);
        buf.put_string(&signature);

        Certificate {
            nonce,
            key: self.key,
            serial: self.serial,
            cert_type: self.cert_type,
            key_id: self.key_id,
            principals: self.principals,
            valid_after: self.valid_after,
            valid_before: self.valid_before,
            critical_options: self.critical_options,
            extensions: self.extensions,
            signature_key: ca.public_key(),
            signature,
            blob: buf.to_vec(),
            signed_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_cert(ca: &PrivateKey) -> (PrivateKey, Certificate) {
        let user = PrivateKey::generate("user");
        let cert = CertificateBuilder::new(user.public_key())
            .serial(7)
            .key_id("test cert")
            .principal("ckey")
            .valid(100, 200)
            .sign(ca);
        (user, cert)
    }

    #[test]
    fn test_parse_signed_certificate() {
        let ca = PrivateKey::generate("ca");
        let (user, cert) = user_cert(&ca);

        let parsed = Certificate::parse_openssh(&format!("{} comment", cert.to_openssh())).unwrap();
        assert_eq!(parsed, cert);
        assert_eq!(parsed.key(), user.public_key());
        assert_eq!(parsed.signature_key(), ca.public_key());
        assert_eq!(parsed.serial(), 7);
        assert_eq!(parsed.key_id(), "test cert");
        assert_eq!(parsed.principals(), &["ckey".to_string()]);
        assert_eq!(parsed.extensions()[0].0, "permit-pty");
        assert!(parsed.verify_signature().is_ok());
    }

    #[test]
    fn test_validate_user() {
        let ca = PrivateKey::generate("ca");
        let (_, cert) = user_cert(&ca);

        assert!(cert.validate_user("ckey", 150).is_ok());
        assert!(cert.validate_user("other", 150).is_err());
        assert!(cert.validate_user("ckey", 99).is_err());
        assert!(cert.validate_user("ckey", 200).is_err());
    }

    #[test]
    fn test_host_certificate_rejected_for_user_auth() {
        let ca = PrivateKey::generate("ca");
        let cert = CertificateBuilder::new(PrivateKey::generate("").public_key())
            .cert_type(CertType::Host)
            .sign(&ca);
        assert!(cert.validate_user("anyone", 1).is_err());
    }

    #[test]
    fn test_critical_options_rejected() {
        let ca = PrivateKey::generate("ca");
        let cert = CertificateBuilder::new(PrivateKey::generate("").public_key())
            .critical_option("force-command", b"\x00\x00\x00\x04true".to_vec())
            .sign(&ca);
        let parsed = Certificate::from_blob(cert.to_blob()).unwrap();
        assert_eq!(parsed.critical_options()[0].0, "force-command");
        assert!(parsed.validate_user("anyone", 1).is_err());
    }

    #[test]
    fn test_tampered_certificate() {
        let ca = PrivateKey::generate("ca");
        let (_, cert) = user_cert(&ca);
        let mut blob = cert.to_blob().to_vec();
        // Flip a byte inside the nonce.
        blob[40] ^= 0xff;
        let parsed = Certificate::from_blob(&blob).unwrap();
        assert!(parsed.verify_signature().is_err());
    }

    #[test]
    fn test_parse_rejects_plain_key() {
        let key = PrivateKey::generate("").public_key();
        assert!(Certificate::parse_openssh(&key.to_openssh()).unwrap_err().is_config());
    }
}
