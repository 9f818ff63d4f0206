//! SSH client: configuration and connection establishment.
//!
//! [`connect`] (or [`Connector::connect`]) runs the whole sequence:
//!
//! 1. Validate the configuration and load key material, with no network I/O
//! 2. Open TCP within `connect_timeout` and call
//!    [`ClientHandler::connection_established`]
//! 3. Exchange versions, negotiate algorithms and run key exchange
//! 4. Check the host key against the known-hosts store
//! 5. Authenticate
//!
//! Steps 3 to 5 are bounded by `login_timeout`. The result is an
//! authenticated [`Connection`].
//!
//! # Example
//!
//! ```rust,no_run
//! use keygate_proto::ssh::client::{connect, SshClientConfig};
//! use keygate_proto::ssh::handler::DefaultClientHandler;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshClientConfig {
//!     username: "deploy".to_string(),
//!     password: Some("secret".to_string()),
//!     ..Default::default()
//! };
//! let conn = connect("server.example", 22, &config, &mut DefaultClientHandler).await?;
//! conn.send_debug("hello")?;
//! conn.close();
//! conn.wait_closed().await;
//! # Ok(())
//! # }
//! ```

use crate::ssh::algorithms::{AlgorithmChoice, AlgorithmPreferences};
use crate::ssh::connection::{transition, Connection, ConnectionInfo, ConnectionState};
use crate::ssh::credentials::{resolve_client_keys, ClientKey, ClientKeySpec, KeyCursor};
use crate::ssh::handler::ClientHandler;
use crate::ssh::handshake::{client_key_exchange, Identification};
use crate::ssh::known_hosts::{HostKeyStatus, KnownHosts, KnownHostsSource};
use crate::ssh::message::DisconnectReason;
use crate::ssh::privatekey::PublicKey;
use crate::ssh::transport::Transport;
use crate::ssh::userauth::{AuthContext, UserAuth};
use crate::ssh::version::{self, Version};
use keygate_platform::{KeygateError, KeygateResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Software version announced by default.
pub const DEFAULT_CLIENT_VERSION: &str = concat!("Keygate_", env!("CARGO_PKG_VERSION"));

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// User to authenticate as.
    pub username: String,
    /// Password for password and single-prompt keyboard-interactive auth.
    pub password: Option<String>,
    /// Keys for publickey auth.
    ///
    /// - `None`: ask the agent at `agent_path`, then try `identity_search_paths`
    /// - `Some(vec![])`: publickey auth disabled
    pub client_keys: Option<Vec<ClientKeySpec>>,
    /// Host key verification source.
    pub known_hosts: KnownHostsSource,
    /// Key exchange algorithms.
    pub kex_algs: AlgorithmChoice,
    /// Ciphers.
    pub encryption_algs: AlgorithmChoice,
    /// MACs.
    pub mac_algs: AlgorithmChoice,
    /// Compression algorithms.
    pub compression_algs: AlgorithmChoice,
    /// ssh-agent socket. `None` disables the agent.
    pub agent_path: Option<PathBuf>,
    /// Private keys tried when `client_keys` is `None`.
    pub identity_search_paths: Vec<PathBuf>,
    /// Bound on opening the TCP connection.
    pub connect_timeout: Duration,
    /// Bound on version exchange, key exchange and authentication.
    pub login_timeout: Duration,
    /// Plain password rejections tolerated before moving on.
    pub password_attempts: u32,
    /// Try the "none" method before anything else.
    pub allow_none_auth: bool,
    /// Software version in our identification string.
    pub client_version: String,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let identity_search_paths = dirs::home_dir()
            .map(|home| vec![home.join(".ssh").join("id_ed25519")])
            .unwrap_or_default();

        Self {
            username,
            password: None,
            client_keys: None,
            known_hosts: KnownHostsSource::default(),
            kex_algs: AlgorithmChoice::Default,
            encryption_algs: AlgorithmChoice::Default,
            mac_algs: AlgorithmChoice::Default,
            compression_algs: AlgorithmChoice::Default,
            agent_path: None,
            identity_search_paths,
            connect_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(120),
            password_attempts: 1,
            allow_none_auth: true,
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
        }
    }
}

// Manual Debug so the password never reaches logs
impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_keys", &self.client_keys.as_ref().map(Vec::len))
            .field("known_hosts", &self.known_hosts)
            .field("kex_algs", &self.kex_algs)
            .field("encryption_algs", &self.encryption_algs)
            .field("mac_algs", &self.mac_algs)
            .field("compression_algs", &self.compression_algs)
            .field("agent_path", &self.agent_path)
            .field("identity_search_paths", &self.identity_search_paths)
            .field("connect_timeout", &self.connect_timeout)
            .field("login_timeout", &self.login_timeout)
            .field("password_attempts", &self.password_attempts)
            .field("allow_none_auth", &self.allow_none_auth)
            .field("client_version", &self.client_version)
            .finish()
    }
}

impl SshClientConfig {
    /// Checks the settings that need no I/O and resolves algorithm preferences.
    pub fn validate(&self) -> KeygateResult<AlgorithmPreferences> {
        if self.username.is_empty() {
            return Err(KeygateError::Config("Username must not be empty".to_string()));
        }
        if self.password_attempts == 0 {
            return Err(KeygateError::Config(
                "password_attempts must be at least 1".to_string(),
            ));
        }
        if self.client_version.is_empty() || self.client_version.contains(char::is_whitespace) {
            return Err(KeygateError::Config(format!(
                "Invalid client version: {:?}",
                self.client_version
            )));
        }
        AlgorithmPreferences::resolve(
            &self.kex_algs,
            &self.encryption_algs,
            &self.mac_algs,
            &self.compression_algs,
        )
    }

    async fn prepare(&self) -> KeygateResult<Prepared> {
        let prefs = self.validate()?;
        let known_hosts = self.known_hosts.load()?;
        let keys = resolve_client_keys(
            self.client_keys.as_deref(),
            self.agent_path.as_deref(),
            &self.identity_search_paths,
        )
        .await?;
        debug!("Prepared {} client keys", keys.len());
        Ok(Prepared {
            prefs,
            known_hosts,
            keys,
        })
    }
}

struct Prepared {
    prefs: AlgorithmPreferences,
    known_hosts: Option<Arc<KnownHosts>>,
    keys: Vec<ClientKey>,
}

/// Cancels pending connection attempts of a [`Connector`].
#[derive(Debug, Clone)]
pub struct AbortHandle {
    aborted: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Aborts every attempt in flight and every later one.
    pub fn abort(&self) {
        self.aborted.send_replace(true);
    }

    /// True once [`AbortHandle::abort`] has been called.
    pub fn is_aborted(&self) -> bool {
        *self.aborted.borrow()
    }
}

/// Connects with a fixed configuration; attempts can be aborted.
#[derive(Debug)]
pub struct Connector {
    config: SshClientConfig,
    aborted: Arc<watch::Sender<bool>>,
}

impl Connector {
    /// Creates a connector.
    pub fn new(config: SshClientConfig) -> Self {
        let (aborted, _) = watch::channel(false);
        Self {
            config,
            aborted: Arc::new(aborted),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SshClientConfig {
        &self.config
    }

    /// Handle that aborts attempts made through this connector.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            aborted: Arc::clone(&self.aborted),
        }
    }

    /// Connects and authenticates.
    ///
    /// An abort unwinds the attempt and fails with [`KeygateError::Closed`].
    pub async fn connect<H>(&self, host: &str, port: u16, handler: &mut H) -> KeygateResult<Connection>
    where
        H: ClientHandler + ?Sized,
    {
        let mut aborted = self.aborted.subscribe();
        let attempt = async {
            // Key loading may block on an agent, so it is abortable too.
            let prepared = self.config.prepare().await?;
            let (state, _) = watch::channel(ConnectionState::Connecting);
            establish(host, port, &self.config, prepared, handler, state).await
        };

        tokio::select! {
            biased;
            _ = aborted.wait_for(|a| *a) => {
                info!(host, port, "Connection attempt aborted");
                Err(KeygateError::Closed)
            }
            result = attempt => result,
        }
    }
}

/// Connects to `host:port` and authenticates.
pub async fn connect<H>(
    host: &str,
    port: u16,
    config: &SshClientConfig,
    handler: &mut H,
) -> KeygateResult<Connection>
where
    H: ClientHandler + ?Sized,
{
    let prepared = config.prepare().await?;
    let (state, _) = watch::channel(ConnectionState::Connecting);
    establish(host, port, config, prepared, handler, state).await
}

fn timed_out(what: &str) -> KeygateError {
    KeygateError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} timed out", what),
    ))
}

async fn establish<H>(
    host: &str,
    port: u16,
    config: &SshClientConfig,
    prepared: Prepared,
    handler: &mut H,
    state: watch::Sender<ConnectionState>,
) -> KeygateResult<Connection>
where
    H: ClientHandler + ?Sized,
{
    info!(host, port, "Connecting");
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| timed_out("Connect"))??;
    stream.set_nodelay(true)?;

    handler
        .connection_established()
        .await
        .map_err(KeygateError::Callback)?;

    let login = handshake(host, port, config, prepared, handler, stream, &state);
    let (transport, info) = match tokio::time::timeout(config.login_timeout, login).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            transition(&state, ConnectionState::Closed);
            return Err(e);
        }
        Err(_) => {
            transition(&state, ConnectionState::Closed);
            return Err(timed_out("Login"));
        }
    };

    transition(&state, ConnectionState::Authenticated);
    Ok(Connection::spawn(transport, state, info))
}

type Established = (
    Transport<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>,
    ConnectionInfo,
);

async fn handshake<H>(
    host: &str,
    port: u16,
    config: &SshClientConfig,
    prepared: Prepared,
    handler: &mut H,
    mut stream: TcpStream,
    state: &watch::Sender<ConnectionState>,
) -> KeygateResult<Established>
where
    H: ClientHandler + ?Sized,
{
    transition(state, ConnectionState::Negotiating);
    let ours = Version::new(&config.client_version, None);
    let exchanged = version::exchange(&mut stream, &ours).await;
    let mut transport = Transport::from_tcp(stream);
    let (peer_version, server_line) = match exchanged {
        Ok(exchanged) => exchanged,
        Err(e) => return Err(transport.fail(e).await),
    };
    let client_line = ours.to_string();

    let ids = Identification {
        client: &client_line,
        server: &server_line,
    };
    let outcome = match client_key_exchange(&mut transport, &prepared.prefs, ids).await {
        Ok(outcome) => outcome,
        Err(e) => return Err(transport.fail(e).await),
    };

    if let Err(e) = check_host_key(prepared.known_hosts.as_deref(), host, port, &outcome.host_key) {
        return Err(transport.fail(e).await);
    }

    transition(state, ConnectionState::Authenticating);
    let ctx = AuthContext {
        username: &config.username,
        session_id: &outcome.session_id,
        password: config.password.as_deref(),
        password_attempts: config.password_attempts,
        allow_none_auth: config.allow_none_auth,
        keys: KeyCursor::new(prepared.keys),
        publickey_enabled: !matches!(config.client_keys.as_deref(), Some([])),
    };
    let auth_method = match UserAuth::new(&mut transport, handler, ctx).run().await {
        Ok(method) => method,
        Err(e) => return Err(transport.fail(e).await),
    };
    transport.enable_delayed_compression();

    let info = ConnectionInfo {
        negotiated: outcome.negotiated,
        session_id: outcome.session_id,
        peer_version,
        host_key: outcome.host_key,
        username: config.username.clone(),
        auth_method,
    };
    Ok((transport, info))
}

fn check_host_key(
    known_hosts: Option<&KnownHosts>,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> KeygateResult<()> {
    let Some(known_hosts) = known_hosts else {
        warn!(host, "Host key verification disabled");
        return Ok(());
    };

    let fingerprint = key.fingerprint();
    match known_hosts.classify(host, port, key) {
        HostKeyStatus::Trusted => {
            debug!(host, "Host key {} trusted", fingerprint);
            Ok(())
        }
        HostKeyStatus::AcceptOnce => {
            info!(host, "Host key {} accepted for this connection", fingerprint);
            Ok(())
        }
        HostKeyStatus::Revoked => {
            warn!(host, "Host key {} is revoked", fingerprint);
            Err(KeygateError::Disconnect {
                code: DisconnectReason::HostKeyNotVerifiable.code(),
                reason: format!("Host key {} is revoked", fingerprint),
            })
        }
        HostKeyStatus::Unknown => {
            warn!(host, "Host key {} is not trusted", fingerprint);
            Err(KeygateError::Disconnect {
                code: DisconnectReason::HostKeyNotVerifiable.code(),
                reason: "Host key verification failed".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::handler::DefaultClientHandler;
    use crate::ssh::privatekey::PrivateKey;

    fn config() -> SshClientConfig {
        SshClientConfig {
            username: "alice".to_string(),
            known_hosts: KnownHostsSource::Disabled,
            identity_search_paths: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = SshClientConfig::default();
        assert_eq!(config.password_attempts, 1);
        assert!(config.allow_none_auth);
        assert!(config.agent_path.is_none());
        assert!(config.client_keys.is_none());
        assert_eq!(config.kex_algs, AlgorithmChoice::Default);
        assert!(config.client_version.starts_with("Keygate_"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SshClientConfig {
            password: Some("hunter2".to_string()),
            ..config()
        };
        let text = format!("{:?}", config);
        assert!(!text.contains("hunter2"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let empty_user = SshClientConfig {
            username: String::new(),
            ..config()
        };
        assert!(empty_user.validate().unwrap_err().is_config());

        let no_attempts = SshClientConfig {
            password_attempts: 0,
            ..config()
        };
        assert!(no_attempts.validate().unwrap_err().is_config());

        let empty_list = SshClientConfig {
            encryption_algs: AlgorithmChoice::Only(Vec::new()),
            ..config()
        };
        assert!(empty_list.validate().unwrap_err().is_config());

        let disabled_mac = SshClientConfig {
            mac_algs: AlgorithmChoice::Disabled,
            ..config()
        };
        assert!(disabled_mac.validate().unwrap_err().is_config());

        let prefs = SshClientConfig {
            compression_algs: AlgorithmChoice::Disabled,
            ..config()
        }
        .validate()
        .unwrap();
        assert!(prefs.compression_disabled);
    }

    #[test]
    fn test_check_host_key() {
        let trusted = PrivateKey::generate("").public_key();
        let revoked = PrivateKey::generate("").public_key();
        let store = KnownHosts::from_triple(vec![trusted, revoked], vec![revoked], vec![]);

        assert!(check_host_key(Some(&store), "h", 22, &trusted).is_ok());
        let err = check_host_key(Some(&store), "h", 22, &revoked).unwrap_err();
        assert_eq!(err.disconnect_code(), Some(9));

        let empty = KnownHosts::from_triple(vec![], vec![], vec![]);
        let err = check_host_key(Some(&empty), "h", 22, &trusted).unwrap_err();
        assert_eq!(err.disconnect_code(), Some(9));

        assert!(check_host_key(None, "h", 22, &trusted).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_algorithm_fails_before_network() {
        let config = SshClientConfig {
            kex_algs: AlgorithmChoice::only(["xxx"]),
            ..config()
        };
        // Port 9 on the discard address; never contacted.
        let err = connect("192.0.2.1", 9, &config, &mut DefaultClientHandler)
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, &config(), &mut DefaultClientHandler)
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_abort_before_connect() {
        let connector = Connector::new(config());
        let handle = connector.abort_handle();
        handle.abort();
        assert!(handle.is_aborted());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = connector
            .connect("127.0.0.1", port, &mut DefaultClientHandler)
            .await
            .unwrap_err();
        assert!(matches!(err, KeygateError::Closed));
    }
}
