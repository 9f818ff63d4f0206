//! Client authentication material.
//!
//! A [`ClientKeySpec`] names where a key (and optionally its certificate)
//! comes from; [`ClientKeySpec::load`] turns it into a [`ClientKey`] that can
//! sign. Loading happens before any network I/O so that bad key material is
//! reported as a configuration error (or an I/O error for unreadable paths).
//!
//! Keys are offered through a [`KeyCursor`]: each key is handed out once and
//! never put back.

use crate::ssh::agent::{self, AgentIdentity};
use crate::ssh::certificate::{Certificate, CERT_ED25519};
use crate::ssh::privatekey::{PrivateKey, PublicKey};
use keygate_platform::{KeygateError, KeygateResult};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of a private key.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    /// `openssh-key-v1` file on disk
    Path(PathBuf),
    /// `openssh-key-v1` document in memory
    Bytes(Vec<u8>),
    /// Already parsed key
    Key(PrivateKey),
    /// Key held by an ssh-agent
    Agent(AgentIdentity),
}

/// Source of an OpenSSH certificate.
#[derive(Debug, Clone)]
pub enum CertMaterial {
    /// `-cert.pub` file on disk
    Path(PathBuf),
    /// Certificate line in memory
    Bytes(Vec<u8>),
    /// Already parsed certificate
    Cert(Certificate),
}

/// A key to offer during publickey authentication.
#[derive(Debug, Clone)]
pub struct ClientKeySpec {
    key: KeyMaterial,
    certificate: Option<CertMaterial>,
}

impl ClientKeySpec {
    /// Key read from `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(KeyMaterial::Path(path.into()))
    }

    /// Key parsed from an in-memory private key document.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::new(KeyMaterial::Bytes(data.into()))
    }

    /// A parsed key.
    pub fn from_key(key: PrivateKey) -> Self {
        Self::new(KeyMaterial::Key(key))
    }

    /// An agent identity, as returned by [`agent::connect_agent`].
    pub fn from_agent(identity: AgentIdentity) -> Self {
        Self::new(KeyMaterial::Agent(identity))
    }

    fn new(key: KeyMaterial) -> Self {
        Self {
            key,
            certificate: None,
        }
    }

    /// Attaches a certificate for the key.
    pub fn with_certificate(mut self, certificate: CertMaterial) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Key source.
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// Certificate source, if any.
    pub fn certificate(&self) -> Option<&CertMaterial> {
        self.certificate.as_ref()
    }

    /// Loads the key and certificate and checks that they belong together.
    pub fn load(&self) -> KeygateResult<ClientKey> {
        let signer = match &self.key {
            KeyMaterial::Path(path) => Signer::Local(PrivateKey::from_file(path)?),
            KeyMaterial::Bytes(data) => Signer::Local(PrivateKey::from_openssh(data)?),
            KeyMaterial::Key(key) => Signer::Local(key.clone()),
            KeyMaterial::Agent(identity) => {
                let path = identity.agent_path().ok_or_else(|| {
                    KeygateError::Config(format!(
                        "Agent identity {} has no agent socket",
                        identity.public_key().fingerprint()
                    ))
                })?;
                Signer::Agent {
                    identity: identity.clone(),
                    path: path.to_path_buf(),
                }
            }
        };

        let certificate = match &self.certificate {
            Some(material) => Some(load_certificate(material)?),
            None => match &signer {
                Signer::Agent { identity, .. } => identity.certificate().cloned(),
                Signer::Local(_) => None,
            },
        };

        ClientKey::new(signer, certificate)
    }
}

impl From<PrivateKey> for ClientKeySpec {
    fn from(key: PrivateKey) -> Self {
        Self::from_key(key)
    }
}

impl From<AgentIdentity> for ClientKeySpec {
    fn from(identity: AgentIdentity) -> Self {
        Self::from_agent(identity)
    }
}

impl From<PathBuf> for ClientKeySpec {
    fn from(path: PathBuf) -> Self {
        Self::from_path(path)
    }
}

fn load_certificate(material: &CertMaterial) -> KeygateResult<Certificate> {
    match material {
        CertMaterial::Path(path) => Certificate::from_file(path),
        CertMaterial::Bytes(data) => {
            let text = std::str::from_utf8(data)
                .map_err(|_| KeygateError::Config("Certificate is not valid text".to_string()))?;
            Certificate::parse_openssh(text)
        }
        CertMaterial::Cert(cert) => Ok(cert.clone()),
    }
}

/// Produces signatures for a client key.
#[derive(Debug, Clone)]
pub enum Signer {
    /// Private key held in memory
    Local(PrivateKey),
    /// Key held by the agent listening at `path`
    Agent {
        /// Identity as listed by the agent
        identity: AgentIdentity,
        /// Agent socket
        path: PathBuf,
    },
}

impl Signer {
    fn public_key(&self) -> PublicKey {
        match self {
            Signer::Local(key) => key.public_key(),
            Signer::Agent { identity, .. } => identity.public_key(),
        }
    }
}

/// A loaded key, ready to sign.
#[derive(Debug, Clone)]
pub struct ClientKey {
    signer: Signer,
    certificate: Option<Certificate>,
}

impl ClientKey {
    fn new(signer: Signer, certificate: Option<Certificate>) -> KeygateResult<Self> {
        if let Some(cert) = &certificate {
            if cert.key() != signer.public_key() {
                return Err(KeygateError::Config(
                    "Certificate does not match private key".to_string(),
                ));
            }
        }
        Ok(Self {
            signer,
            certificate,
        })
    }

    /// Algorithm name sent in the publickey request.
    pub fn algorithm(&self) -> &'static str {
        match self.certificate {
            Some(_) => CERT_ED25519,
            None => self.signer.public_key().algorithm(),
        }
    }

    /// Blob sent in the publickey request: the certificate when present.
    pub fn public_blob(&self) -> Vec<u8> {
        match &self.certificate {
            Some(cert) => cert.to_blob().to_vec(),
            None => self.signer.public_key().to_blob(),
        }
    }

    /// The underlying public key.
    pub fn public_key(&self) -> PublicKey {
        self.signer.public_key()
    }

    /// The attached certificate.
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// True if signing goes through an ssh-agent.
    pub fn is_agent(&self) -> bool {
        matches!(self.signer, Signer::Agent { .. })
    }

    /// Signs `data`, returning an SSH signature blob.
    pub async fn sign(&self, data: &[u8]) -> KeygateResult<Vec<u8>> {
        match &self.signer {
            Signer::Local(key) => Ok(key.sign_blob(data)),
            Signer::Agent { identity, path } => {
                agent::sign_with_agent(path, identity, data).await
            }
        }
    }
}

fn cert_path_for(key_path: &Path) -> PathBuf {
    let mut name = OsString::from(key_path.as_os_str());
    name.push("-cert.pub");
    PathBuf::from(name)
}

/// Loads the keys used when none are configured explicitly.
///
/// The agent at `agent_path` comes first, then the private keys found at
/// `search_paths` (with `<path>-cert.pub` attached when it exists). Anything
/// that fails to load is logged and skipped.
pub async fn default_client_keys(
    agent_path: Option<&Path>,
    search_paths: &[PathBuf],
) -> Vec<ClientKey> {
    let mut keys = Vec::new();

    if let Some(path) = agent_path {
        match agent::connect_agent(path).await {
            Ok(identities) => {
                for identity in identities {
                    match ClientKeySpec::from_agent(identity).load() {
                        Ok(key) => keys.push(key),
                        Err(e) => warn!("Skipping agent identity: {}", e),
                    }
                }
            }
            Err(e) => warn!("ssh-agent at {} unavailable: {}", path.display(), e),
        }
    }

    for path in search_paths {
        if !path.exists() {
            continue;
        }
        let key = match PrivateKey::from_file(path) {
            Ok(key) => key,
            Err(e) => {
                warn!("Skipping identity {}: {}", path.display(), e);
                continue;
            }
        };

        let cert_path = cert_path_for(path);
        let certificate = if cert_path.exists() {
            match Certificate::from_file(&cert_path) {
                Ok(cert) if cert.key() == key.public_key() => Some(cert),
                Ok(_) => {
                    warn!(
                        "Ignoring {}: certificate does not match key",
                        cert_path.display()
                    );
                    None
                }
                Err(e) => {
                    warn!("Ignoring {}: {}", cert_path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        debug!("Loaded identity {}", path.display());
        keys.push(ClientKey {
            signer: Signer::Local(key),
            certificate,
        });
    }

    keys
}

/// Loads explicitly configured keys, or discovers defaults when `specs` is `None`.
pub async fn resolve_client_keys(
    specs: Option<&[ClientKeySpec]>,
    agent_path: Option<&Path>,
    search_paths: &[PathBuf],
) -> KeygateResult<Vec<ClientKey>> {
    match specs {
        Some(specs) => specs.iter().map(ClientKeySpec::load).collect(),
        None => Ok(default_client_keys(agent_path, search_paths).await),
    }
}

/// Hands out keys in order, each at most once.
#[derive(Debug, Default)]
pub struct KeyCursor {
    keys: VecDeque<ClientKey>,
}

impl KeyCursor {
    /// Creates a cursor over `keys`.
    pub fn new(keys: Vec<ClientKey>) -> Self {
        Self { keys: keys.into() }
    }

    /// Takes the next key.
    pub fn next_key(&mut self) -> Option<ClientKey> {
        self.keys.pop_front()
    }

    /// Number of keys not yet offered.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    /// True once every key has been offered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
