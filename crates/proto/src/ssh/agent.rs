//! ssh-agent client.
//!
//! Talks the agent protocol over the agent's Unix socket. Each message is
//! framed as `uint32 length || byte type || body`. Only the two requests a
//! client needs for authentication are implemented:
//!
//! - `SSH_AGENTC_REQUEST_IDENTITIES` (11) → `SSH_AGENT_IDENTITIES_ANSWER` (12)
//! - `SSH_AGENTC_SIGN_REQUEST` (13) → `SSH_AGENT_SIGN_RESPONSE` (14)
//!
//! Identities the client cannot use (non-Ed25519 keys and certificates) are
//! skipped.

use crate::ssh::certificate::{Certificate, CERT_ED25519};
use crate::ssh::privatekey::PublicKey;
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Agent responded with a generic failure.
pub const SSH_AGENT_FAILURE: u8 = 5;
/// Lists the agent's keys.
pub const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
/// Reply to [`SSH_AGENTC_REQUEST_IDENTITIES`].
pub const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
/// Asks the agent to sign data.
pub const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
/// Reply to [`SSH_AGENTC_SIGN_REQUEST`].
pub const SSH_AGENT_SIGN_RESPONSE: u8 = 14;

const MAX_AGENT_MESSAGE: usize = 256 * 1024;

/// A key held by an ssh-agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    blob: Vec<u8>,
    comment: String,
    key: PublicKey,
    certificate: Option<Certificate>,
    agent_path: Option<PathBuf>,
}

impl AgentIdentity {
    pub(crate) fn from_blob(blob: Vec<u8>, comment: String) -> KeygateResult<Self> {
        let mut r = WireReader::new(&blob);
        let algorithm = r.read_utf8()?;
        let (key, certificate) = if algorithm == CERT_ED25519 {
            let cert = Certificate::from_blob(&blob)?;
            (cert.key(), Some(cert))
        } else {
            (PublicKey::from_blob(&blob)?, None)
        };
        Ok(Self {
            blob,
            comment,
            key,
            certificate,
            agent_path: None,
        })
    }

    /// Public key blob as the agent reported it.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Agent-supplied comment, usually the key's file name.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// The underlying public key.
    pub fn public_key(&self) -> PublicKey {
        self.key
    }

    /// The certificate, if the agent holds one for this key.
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// Socket of the agent this identity came from, when known.
    pub fn agent_path(&self) -> Option<&Path> {
        self.agent_path.as_deref()
    }
}

/// Agent protocol client over any byte stream.
#[derive(Debug)]
pub struct AgentClient<S> {
    stream: S,
}

#[cfg(unix)]
impl AgentClient<tokio::net::UnixStream> {
    /// Connects to the agent socket at `path`.
    pub async fn connect<P: AsRef<Path>>(path: P) -> KeygateResult<Self> {
        let path = path.as_ref();
        debug!("Connecting to ssh-agent at {}", path.display());
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AgentClient<S> {
    /// Wraps an already connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    async fn request(&mut self, message: &[u8]) -> KeygateResult<Vec<u8>> {
        self.stream.write_u32(message.len() as u32).await?;
        self.stream.write_all(message).await?;
        self.stream.flush().await?;

        let len = self.stream.read_u32().await? as usize;
        if len == 0 || len > MAX_AGENT_MESSAGE {
            return Err(KeygateError::Protocol(format!(
                "Invalid agent message length: {}",
                len
            )));
        }
        let mut reply = vec![0u8; len];
        self.stream.read_exact(&mut reply).await?;
        trace!("agent reply type {}", reply[0]);
        Ok(reply)
    }

    /// Lists the identities the agent holds.
    pub async fn request_identities(&mut self) -> KeygateResult<Vec<AgentIdentity>> {
        let reply = self.request(&[SSH_AGENTC_REQUEST_IDENTITIES]).await?;

        let mut r = WireReader::new(&reply);
        r.expect_message(SSH_AGENT_IDENTITIES_ANSWER, "SSH_AGENT_IDENTITIES_ANSWER")?;
        let count = r.read_u32()?;

        let mut identities = Vec::new();
        for _ in 0..count {
            let blob = r.read_string()?.to_vec();
            let comment = r.read_utf8()?;
            match AgentIdentity::from_blob(blob, comment) {
                Ok(identity) => identities.push(identity),
                Err(e) => debug!("Skipping agent identity: {}", e),
            }
        }

        debug!("ssh-agent offered {} usable identities", identities.len());
        Ok(identities)
    }

    /// Asks the agent to sign `data` with `identity`.
    ///
    /// Returns the signature blob (`string algorithm || string signature`).
    pub async fn sign(&mut self, identity: &AgentIdentity, data: &[u8]) -> KeygateResult<Vec<u8>> {
        let mut msg = BytesMut::new();
        msg.put_u8(SSH_AGENTC_SIGN_REQUEST);
        msg.put_string(identity.blob());
        msg.put_string(data);
        msg.put_u32(0);

        let reply = self.request(&msg).await?;
        if reply[0] == SSH_AGENT_FAILURE {
            return Err(KeygateError::Security(
                "ssh-agent refused to sign".to_string(),
            ));
        }

        let mut r = WireReader::new(&reply);
        r.expect_message(SSH_AGENT_SIGN_RESPONSE, "SSH_AGENT_SIGN_RESPONSE")?;
        Ok(r.read_string()?.to_vec())
    }
}

/// Connects to the agent at `path` and returns the identities it holds.
#[cfg(unix)]
pub async fn connect_agent<P: AsRef<Path>>(path: P) -> KeygateResult<Vec<AgentIdentity>> {
    let path = path.as_ref();
    let mut identities = AgentClient::connect(path).await?.request_identities().await?;
    for identity in &mut identities {
        identity.agent_path = Some(path.to_path_buf());
    }
    Ok(identities)
}

/// Connects to the agent at `path` and returns the identities it holds.
#[cfg(not(unix))]
pub async fn connect_agent<P: AsRef<Path>>(path: P) -> KeygateResult<Vec<AgentIdentity>> {
    Err(KeygateError::Config(format!(
        "ssh-agent at {} is not supported on this platform",
        path.as_ref().display()
    )))
}

/// Signs `data` through a fresh agent connection.
#[cfg(unix)]
pub(crate) async fn sign_with_agent(
    path: &Path,
    identity: &AgentIdentity,
    data: &[u8],
) -> KeygateResult<Vec<u8>> {
    AgentClient::connect(path).await?.sign(identity, data).await
}

#[cfg(not(unix))]
pub(crate) async fn sign_with_agent(
    path: &Path,
    _identity: &AgentIdentity,
    _data: &[u8],
) -> KeygateResult<Vec<u8>> {
    Err(KeygateError::Config(format!(
        "ssh-agent at {} is not supported on this platform",
        path.display()
    )))
}
