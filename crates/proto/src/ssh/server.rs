//! SSH server (peer side of connection establishment).
//!
//! Accepts connections, runs key exchange with an Ed25519 host key and
//! authenticates users through a [`ServerHandler`]. After authentication the
//! session answers transport-level traffic and hands SSH_MSG_DEBUG messages
//! to the handler until the client disconnects.
//!
//! # Example
//!
//! ```rust,no_run
//! use keygate_proto::ssh::handler::CallbackResult;
//! use keygate_proto::ssh::server::{PasswordCheck, ServerHandler, SshServer};
//!
//! struct Passwords;
//!
//! #[async_trait::async_trait]
//! impl ServerHandler for Passwords {
//!     async fn validate_password(
//!         &mut self,
//!         username: &str,
//!         password: &str,
//!     ) -> CallbackResult<PasswordCheck> {
//!         Ok(if username == "admin" && password == "secret" {
//!             PasswordCheck::Accept
//!         } else {
//!             PasswordCheck::Reject
//!         })
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = SshServer::bind("127.0.0.1:2222").await?;
//! server.serve(|| Passwords).await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::algorithms::AlgorithmPreferences;
use crate::ssh::auth::{
    auth_success, construct_signature_data, AuthBanner, AuthFailure, AuthMethod, AuthPkOk,
    AuthRequest, InfoRequest, InfoResponse, PasswordChangeRequest, METHOD_KEYBOARD_INTERACTIVE,
    METHOD_PASSWORD, METHOD_PUBLICKEY, SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use crate::ssh::authorized_keys::is_supported_user_key_algorithm;
use crate::ssh::certificate::{unix_now, Certificate, CERT_ED25519};
use crate::ssh::handler::CallbackResult;
use crate::ssh::handshake::{server_key_exchange, Identification};
use crate::ssh::hostkey::{Ed25519HostKey, HostKey};
use crate::ssh::message::{
    parse_service_message, service_message, unimplemented, DebugMessage, Disconnect,
    DisconnectReason, MessageType,
};
use crate::ssh::privatekey::PublicKey;
use crate::ssh::transport::Transport;
use crate::ssh::version::{self, Version};
use crate::ssh::wire::WireReader;
use keygate_platform::{KeygateError, KeygateResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// SSH server configuration.
///
/// The host key is passed separately to [`SshServer::bind_with_config`].
#[derive(Debug, Clone)]
pub struct SshServerConfig {
    /// Software version in our identification string.
    pub server_version: String,
    /// Algorithms offered to clients.
    pub algorithms: AlgorithmPreferences,
    /// Banner sent before authentication.
    pub banner: Option<String>,
    /// Failed authentication requests tolerated per connection.
    pub max_auth_attempts: u32,
    /// Bound on version exchange, key exchange and authentication.
    pub login_timeout: Duration,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            server_version: concat!("Keygate_", env!("CARGO_PKG_VERSION")).to_string(),
            algorithms: AlgorithmPreferences::all(),
            banner: None,
            max_auth_attempts: 6,
            login_timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome of a password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordCheck {
    /// Password is correct
    Accept,
    /// Password is wrong
    Reject,
    /// Password is correct but expired; the prompt is sent to the client
    ChangeRequired(String),
}

/// Server-side authentication policy.
///
/// An error from any hook ends the connection with DISCONNECT(11).
#[async_trait::async_trait]
pub trait ServerHandler: Send {
    /// Called once per user name. Returning `false` lets the user in without
    /// authentication.
    async fn begin_auth(&mut self, username: &str) -> CallbackResult<bool> {
        let _ = username;
        Ok(true)
    }

    /// Methods advertised to `username`.
    fn auth_methods(&self, username: &str) -> Vec<String> {
        let _ = username;
        vec![
            METHOD_PUBLICKEY.to_string(),
            METHOD_PASSWORD.to_string(),
            METHOD_KEYBOARD_INTERACTIVE.to_string(),
        ]
    }

    /// Whether `key` may log in as `username`.
    async fn validate_public_key(&mut self, username: &str, key: &PublicKey) -> CallbackResult<bool> {
        let _ = (username, key);
        Ok(false)
    }

    /// Whether certificates signed by `ca` are trusted for `username`.
    async fn validate_ca_key(&mut self, username: &str, ca: &PublicKey) -> CallbackResult<bool> {
        let _ = (username, ca);
        Ok(false)
    }

    /// Checks a password.
    async fn validate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> CallbackResult<PasswordCheck> {
        let _ = (username, password);
        Ok(PasswordCheck::Reject)
    }

    /// Applies a password change. `true` authenticates the user.
    async fn change_password(
        &mut self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> CallbackResult<bool> {
        let _ = (username, old_password, new_password);
        Ok(false)
    }

    /// Challenge for keyboard-interactive auth; `None` rejects the method.
    async fn kbdint_challenge(&mut self, username: &str) -> CallbackResult<Option<InfoRequest>> {
        let _ = username;
        Ok(None)
    }

    /// Checks keyboard-interactive responses.
    async fn kbdint_response(&mut self, username: &str, responses: &[String]) -> CallbackResult<bool> {
        let _ = (username, responses);
        Ok(false)
    }

    /// Called for every SSH_MSG_DEBUG after authentication.
    async fn debug_received(&mut self, message: &str) {
        debug!("Client debug message: {}", message);
    }
}

/// SSH Server.
pub struct SshServer {
    listener: TcpListener,
    config: Arc<SshServerConfig>,
    host_key: Arc<dyn HostKey>,
}

impl SshServer {
    /// Binds with a freshly generated Ed25519 host key.
    pub async fn bind(addr: &str) -> KeygateResult<Self> {
        let host_key = Arc::new(Ed25519HostKey::generate()) as Arc<dyn HostKey>;
        Self::bind_with_config(addr, SshServerConfig::default(), host_key).await
    }

    /// Binds with custom configuration and host key.
    pub async fn bind_with_config(
        addr: &str,
        config: SshServerConfig,
        host_key: Arc<dyn HostKey>,
    ) -> KeygateResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("SSH server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config: Arc::new(config),
            host_key,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The host key's public half.
    pub fn host_public_key(&self) -> KeygateResult<PublicKey> {
        PublicKey::from_blob(&self.host_key.public_key_blob())
    }

    /// Accepts one TCP connection. The handshake runs in [`SshSession::run`].
    pub async fn accept(&self) -> KeygateResult<SshSession> {
        let (stream, peer_addr) = self.listener.accept().await?;
        debug!("Accepted connection from {}", peer_addr);
        Ok(SshSession {
            stream,
            peer_addr,
            config: Arc::clone(&self.config),
            host_key: Arc::clone(&self.host_key),
        })
    }

    /// Accepts connections forever, running each on its own task with a
    /// handler from `make_handler`.
    pub async fn serve<F, H>(&self, mut make_handler: F) -> KeygateResult<()>
    where
        F: FnMut() -> H,
        H: ServerHandler + 'static,
    {
        loop {
            let session = self.accept().await?;
            let mut handler = make_handler();
            tokio::spawn(async move {
                let peer = session.peer_addr();
                if let Err(e) = session.run(&mut handler).await {
                    debug!("Session with {} ended: {}", peer, e);
                }
            });
        }
    }
}

impl std::fmt::Debug for SshServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServer")
            .field("listener", &self.listener)
            .field("config", &self.config)
            .field("host_key", &self.host_key.algorithm_name())
            .finish()
    }
}

/// A client connection accepted by [`SshServer`].
pub struct SshSession {
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<SshServerConfig>,
    host_key: Arc<dyn HostKey>,
}

impl SshSession {
    /// Address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Runs the connection to completion.
    ///
    /// Returns once the client disconnects or the connection fails.
    pub async fn run<H>(self, handler: &mut H) -> KeygateResult<()>
    where
        H: ServerHandler + ?Sized,
    {
        let SshSession {
            mut stream,
            peer_addr,
            config,
            host_key,
        } = self;

        let ours = Version::new(&config.server_version, None);
        let (_, client_line) =
            tokio::time::timeout(config.login_timeout, version::exchange(&mut stream, &ours))
                .await
                .map_err(|_| login_timed_out())??;
        let server_line = ours.to_string();

        let mut transport = Transport::from_tcp(stream);
        let ids = Identification {
            client: &client_line,
            server: &server_line,
        };
        let pending = login(&mut transport, &config, host_key.as_ref(), ids, handler);
        let username = match tokio::time::timeout(config.login_timeout, pending).await {
            Ok(Ok(username)) => username,
            Ok(Err(e)) => return Err(transport.fail(e).await),
            Err(_) => return Err(login_timed_out()),
        };
        info!(user = %username, "Client {} authenticated", peer_addr);

        match serve_authenticated(&mut transport, handler).await {
            Ok(()) => Ok(()),
            Err(e) => Err(transport.fail(e).await),
        }
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

fn login_timed_out() -> KeygateError {
    KeygateError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "Login timed out",
    ))
}

async fn login<R, W, H>(
    transport: &mut Transport<R, W>,
    config: &SshServerConfig,
    host_key: &dyn HostKey,
    ids: Identification<'_>,
    handler: &mut H,
) -> KeygateResult<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: ServerHandler + ?Sized,
{
    let outcome = server_key_exchange(transport, &config.algorithms, host_key, ids).await?;
    let mut auth = ServerAuth {
        transport,
        handler,
        config,
        session_id: &outcome.session_id,
    };
    auth.run().await
}

enum Verdict {
    Success,
    Failure,
    /// A reply other than success or failure was sent; no failure is counted.
    Pending,
}

struct ServerAuth<'a, R, W, H: ?Sized> {
    transport: &'a mut Transport<R, W>,
    handler: &'a mut H,
    config: &'a SshServerConfig,
    session_id: &'a [u8],
}

impl<R, W, H> ServerAuth<'_, R, W, H>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: ServerHandler + ?Sized,
{
    async fn run(&mut self) -> KeygateResult<String> {
        let request = self.transport.recv().await?;
        let service = parse_service_message(MessageType::ServiceRequest, &request)?;
        if service != SERVICE_USERAUTH {
            return Err(KeygateError::Disconnect {
                code: DisconnectReason::ServiceNotAvailable.code(),
                reason: format!("Service not available: {}", service),
            });
        }
        self.transport
            .send(&service_message(MessageType::ServiceAccept, SERVICE_USERAUTH))
            .await?;
        if let Some(banner) = &self.config.banner {
            self.transport.send(&AuthBanner::new(banner.as_str()).to_bytes()).await?;
        }

        let mut current: Option<(String, bool)> = None;
        let mut failures = 0;
        let mut pending: Option<Vec<u8>> = None;

        loop {
            let payload = match pending.take() {
                Some(payload) => payload,
                None => self.transport.recv().await?,
            };
            let request = AuthRequest::from_bytes(&payload)?;
            if request.service_name() != SERVICE_CONNECTION {
                return Err(KeygateError::Disconnect {
                    code: DisconnectReason::ServiceNotAvailable.code(),
                    reason: format!("Service not available: {}", request.service_name()),
                });
            }

            let username = request.user_name().to_string();
            let required = match &current {
                Some((user, required)) if *user == username => *required,
                _ => {
                    let required = self
                        .handler
                        .begin_auth(&username)
                        .await
                        .map_err(KeygateError::Callback)?;
                    current = Some((username.clone(), required));
                    required
                }
            };

            let method = request.method().name();
            debug!(user = %username, method, "Authentication request");
            let verdict = if !required {
                Verdict::Success
            } else {
                match request.method() {
                    AuthMethod::None => Verdict::Failure,
                    AuthMethod::PublicKey {
                        algorithm,
                        public_key,
                        signature,
                    } => {
                        self.publickey(&username, algorithm, public_key, signature.as_deref())
                            .await?
                    }
                    AuthMethod::Password {
                        password,
                        new_password,
                    } => {
                        self.password(&username, password, new_password.as_deref())
                            .await?
                    }
                    AuthMethod::KeyboardInteractive { .. } => {
                        self.keyboard_interactive(&username, &mut pending).await?
                    }
                }
            };

            match verdict {
                Verdict::Success => {
                    self.transport.send(&auth_success()).await?;
                    self.transport.enable_delayed_compression();
                    return Ok(username);
                }
                Verdict::Pending => {}
                Verdict::Failure => {
                    if !matches!(request.method(), AuthMethod::None) {
                        failures += 1;
                    }
                    if failures > self.config.max_auth_attempts {
                        return Err(KeygateError::Disconnect {
                            code: DisconnectReason::NoMoreAuthMethodsAvailable.code(),
                            reason: "Too many authentication failures".to_string(),
                        });
                    }
                    let methods = self.handler.auth_methods(&username);
                    self.transport
                        .send(&AuthFailure::new(methods, false).to_bytes())
                        .await?;
                }
            }
        }
    }

    async fn publickey(
        &mut self,
        username: &str,
        algorithm: &str,
        blob: &[u8],
        signature: Option<&[u8]>,
    ) -> KeygateResult<Verdict> {
        if !is_supported_user_key_algorithm(algorithm) {
            debug!(algorithm, "Unsupported public key algorithm");
            return Ok(Verdict::Failure);
        }

        let key = if algorithm == CERT_ED25519 {
            let cert = match Certificate::from_blob(blob) {
                Ok(cert) => cert,
                Err(e) => {
                    debug!("Unparseable certificate: {}", e);
                    return Ok(Verdict::Failure);
                }
            };
            let trusted = self
                .handler
                .validate_ca_key(username, &cert.signature_key())
                .await
                .map_err(KeygateError::Callback)?;
            if !trusted {
                return Ok(Verdict::Failure);
            }
            if let Err(e) = cert.validate_user(username, unix_now()) {
                debug!("Certificate rejected: {}", e);
                return Ok(Verdict::Failure);
            }
            cert.key()
        } else {
            let key = match PublicKey::from_blob(blob) {
                Ok(key) if key.algorithm() == algorithm => key,
                _ => return Ok(Verdict::Failure),
            };
            let allowed = self
                .handler
                .validate_public_key(username, &key)
                .await
                .map_err(KeygateError::Callback)?;
            if !allowed {
                return Ok(Verdict::Failure);
            }
            key
        };

        let Some(signature) = signature else {
            self.transport
                .send(&AuthPkOk::new(algorithm, blob.to_vec()).to_bytes())
                .await?;
            return Ok(Verdict::Pending);
        };

        let data = construct_signature_data(
            self.session_id,
            username,
            SERVICE_CONNECTION,
            algorithm,
            blob,
        );
        match key.verify(&data, signature) {
            Ok(()) => Ok(Verdict::Success),
            Err(e) => {
                warn!(user = username, "Public key signature rejected: {}", e);
                Ok(Verdict::Failure)
            }
        }
    }

    async fn password(
        &mut self,
        username: &str,
        password: &str,
        new_password: Option<&str>,
    ) -> KeygateResult<Verdict> {
        if let Some(new_password) = new_password {
            let changed = self
                .handler
                .change_password(username, password, new_password)
                .await
                .map_err(KeygateError::Callback)?;
            return Ok(if changed {
                Verdict::Success
            } else {
                Verdict::Failure
            });
        }

        let check = self
            .handler
            .validate_password(username, password)
            .await
            .map_err(KeygateError::Callback)?;
        match check {
            PasswordCheck::Accept => Ok(Verdict::Success),
            PasswordCheck::Reject => Ok(Verdict::Failure),
            PasswordCheck::ChangeRequired(prompt) => {
                self.transport
                    .send(&PasswordChangeRequest::new(prompt).to_bytes())
                    .await?;
                Ok(Verdict::Pending)
            }
        }
    }

    async fn keyboard_interactive(
        &mut self,
        username: &str,
        pending: &mut Option<Vec<u8>>,
    ) -> KeygateResult<Verdict> {
        let challenge = self
            .handler
            .kbdint_challenge(username)
            .await
            .map_err(KeygateError::Callback)?;
        let Some(challenge) = challenge else {
            return Ok(Verdict::Failure);
        };
        self.transport.send(&challenge.to_bytes()).await?;

        let payload = self.transport.recv().await?;
        if payload[0] != MessageType::UserauthInfoResponse as u8 {
            // A new request abandons the challenge.
            *pending = Some(payload);
            return Ok(Verdict::Pending);
        }

        let response = InfoResponse::from_bytes(&payload)?;
        let accepted = self
            .handler
            .kbdint_response(username, response.responses())
            .await
            .map_err(KeygateError::Callback)?;
        Ok(if accepted {
            Verdict::Success
        } else {
            Verdict::Failure
        })
    }
}

async fn serve_authenticated<R, W, H>(
    transport: &mut Transport<R, W>,
    handler: &mut H,
) -> KeygateResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: ServerHandler + ?Sized,
{
    loop {
        let (sequence, payload) = match transport.reader.read_packet().await {
            Ok(packet) => packet,
            Err(KeygateError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Client closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(&kind) = payload.first() else {
            return Err(KeygateError::Protocol("Empty packet payload".to_string()));
        };

        match MessageType::from_u8(kind) {
            Some(MessageType::Disconnect) => {
                let message = Disconnect::from_bytes(&payload)?;
                info!(code = message.code, "Client disconnected: {}", message.description);
                return Ok(());
            }
            Some(MessageType::Debug) => {
                let message = DebugMessage::from_bytes(&payload)?;
                handler.debug_received(&message.message).await;
            }
            Some(MessageType::Ignore) | Some(MessageType::Unimplemented) => {}
            Some(MessageType::GlobalRequest) => {
                let mut r = WireReader::new(&payload);
                r.read_u8()?;
                let _name = r.read_utf8()?;
                if r.read_bool()? {
                    transport.send(&[MessageType::RequestFailure as u8]).await?;
                }
            }
            _ => transport.send(&unimplemented(sequence)).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SshServerConfig::default();
        assert_eq!(config.max_auth_attempts, 6);
        assert!(config.banner.is_none());
        assert!(config.server_version.starts_with("Keygate_"));
        assert!(!config.algorithms.compression_disabled);
    }

    struct Nobody;

    #[async_trait::async_trait]
    impl ServerHandler for Nobody {}

    #[tokio::test]
    async fn test_default_handler_rejects_everything() {
        let mut handler = Nobody;
        let key = crate::ssh::privatekey::PrivateKey::generate("").public_key();
        assert!(handler.begin_auth("u").await.unwrap());
        assert_eq!(handler.auth_methods("u").len(), 3);
        assert!(!handler.validate_public_key("u", &key).await.unwrap());
        assert!(!handler.validate_ca_key("u", &key).await.unwrap());
        assert_eq!(
            handler.validate_password("u", "p").await.unwrap(),
            PasswordCheck::Reject
        );
        assert!(!handler.change_password("u", "a", "b").await.unwrap());
        assert!(handler.kbdint_challenge("u").await.unwrap().is_none());
        assert!(!handler.kbdint_response("u", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_bind_reports_host_key() {
        let host_key = Ed25519HostKey::generate();
        let expected = host_key.public_key();
        let server = SshServer::bind_with_config(
            "127.0.0.1:0",
            SshServerConfig::default(),
            Arc::new(host_key),
        )
        .await
        .unwrap();
        assert_eq!(server.host_public_key().unwrap(), expected);
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
