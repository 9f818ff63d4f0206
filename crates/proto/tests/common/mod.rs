//! Shared fixtures for the end-to-end tests: an in-process SSH server with a
//! fixed set of test principals and a minimal ssh-agent.

#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use keygate_proto::ssh::auth::{InfoRequest, Prompt};
use keygate_proto::ssh::authorized_keys::{AuthorizedKey, AuthorizedKeys};
use keygate_proto::ssh::handler::CallbackResult;
use keygate_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
use keygate_proto::ssh::privatekey::{PrivateKey, PublicKey};
use keygate_proto::ssh::server::{PasswordCheck, ServerHandler, SshServer, SshServerConfig};
use keygate_proto::ssh::wire::{WireReader, WireWrite};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Upper bound for any single test step.
pub const STEP: Duration = Duration::from_secs(10);

/// What the server saw, for assertions.
#[derive(Debug, Default)]
pub struct Observed {
    /// Fingerprints of keys offered for publickey auth, in arrival order
    pub offered_keys: Vec<String>,
    /// SSH_MSG_DEBUG texts received after authentication
    pub debug_messages: Vec<String>,
}

/// Principals:
///
/// - `guest`: no authentication required
/// - `pkey`: publickey with the authorized user key
/// - `ckey`: publickey with a certificate from the trusted CA
/// - `pw`: password `pw`; the old password `oldpw` is expired and may be
///   changed to `pw`
/// - `nopwchange`: password `oldpw` is expired and changes are refused
/// - `kbdint`: one keyboard-interactive prompt, answer `kbdpw`
/// - `multi`: two keyboard-interactive prompts, answers `a` and `b`
/// - `error`: the server's auth hook fails
pub struct TestAuth {
    authorized: Arc<AuthorizedKeys>,
    observed: Arc<Mutex<Observed>>,
}

#[derive(Debug)]
struct HookFailed;

impl std::fmt::Display for HookFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "auth backend unavailable")
    }
}

impl std::error::Error for HookFailed {}

#[async_trait::async_trait]
impl ServerHandler for TestAuth {
    async fn begin_auth(&mut self, username: &str) -> CallbackResult<bool> {
        match username {
            "guest" => Ok(false),
            "error" => Err(Box::new(HookFailed)),
            _ => Ok(true),
        }
    }

    fn auth_methods(&self, username: &str) -> Vec<String> {
        match username {
            "kbdint" | "multi" => vec!["keyboard-interactive".to_string()],
            _ => vec![
                "publickey".to_string(),
                "password".to_string(),
                "keyboard-interactive".to_string(),
            ],
        }
    }

    async fn validate_public_key(&mut self, username: &str, key: &PublicKey) -> CallbackResult<bool> {
        self.observed
            .lock()
            .unwrap()
            .offered_keys
            .push(key.fingerprint());
        Ok(username == "pkey" && self.authorized.is_authorized(key))
    }

    async fn validate_ca_key(&mut self, username: &str, ca: &PublicKey) -> CallbackResult<bool> {
        Ok(username == "ckey" && self.authorized.is_trusted_ca(ca))
    }

    async fn validate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> CallbackResult<PasswordCheck> {
        Ok(match (username, password) {
            ("pw", "pw") => PasswordCheck::Accept,
            ("pw", "oldpw") | ("nopwchange", "oldpw") => {
                PasswordCheck::ChangeRequired("Password expired".to_string())
            }
            _ => PasswordCheck::Reject,
        })
    }

    async fn change_password(
        &mut self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> CallbackResult<bool> {
        Ok(username == "pw" && old_password == "oldpw" && new_password == "pw")
    }

    async fn kbdint_challenge(&mut self, username: &str) -> CallbackResult<Option<InfoRequest>> {
        Ok(match username {
            "kbdint" => Some(InfoRequest::new(
                "",
                "",
                vec![Prompt::new("Password: ", false)],
            )),
            "multi" => Some(InfoRequest::new(
                "Two questions",
                "Answer both",
                vec![Prompt::new("First: ", true), Prompt::new("Second: ", false)],
            )),
            _ => None,
        })
    }

    async fn kbdint_response(&mut self, username: &str, responses: &[String]) -> CallbackResult<bool> {
        Ok(match username {
            "kbdint" => responses == ["kbdpw"],
            "multi" => responses == ["a", "b"],
            _ => false,
        })
    }

    async fn debug_received(&mut self, message: &str) {
        self.observed
            .lock()
            .unwrap()
            .debug_messages
            .push(message.to_string());
    }
}

/// A running test server. The accept loop stops when this is dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub host_key: PublicKey,
    pub user_key: PrivateKey,
    pub ca: PrivateKey,
    pub observed: Arc<Mutex<Observed>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_config(SshServerConfig::default()).await
    }

    pub async fn start_with_config(config: SshServerConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let host_key = Ed25519HostKey::generate();
        let host_public = PublicKey::from_blob(&host_key.public_key_blob()).unwrap();
        let user_key = PrivateKey::generate("user@test");
        let ca = PrivateKey::generate("ca@test");

        let mut authorized = AuthorizedKeys::new();
        authorized.add_key(AuthorizedKey::new(user_key.public_key()));
        authorized.add_key(AuthorizedKey::cert_authority(ca.public_key()));
        let authorized = Arc::new(authorized);
        let observed = Arc::new(Mutex::new(Observed::default()));

        let server = SshServer::bind_with_config("127.0.0.1:0", config, Arc::new(host_key))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let handler_keys = Arc::clone(&authorized);
        let handler_observed = Arc::clone(&observed);
        let task = tokio::spawn(async move {
            let _ = server
                .serve(move || TestAuth {
                    authorized: Arc::clone(&handler_keys),
                    observed: Arc::clone(&handler_observed),
                })
                .await;
        });

        Self {
            addr,
            host_key: host_public,
            user_key,
            ca,
            observed,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A TCP listener that accepts connections and never speaks SSH.
pub async fn silent_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (addr, task)
}

/// Writes `key` in OpenSSH format under `dir` and returns the path.
pub fn write_key(dir: &Path, name: &str, key: &PrivateKey) -> PathBuf {
    let path = dir.join(name);
    key.write_file(&path).unwrap();
    path
}

/// A socket under `dir` that accepts agent connections and never replies.
#[cfg(unix)]
pub fn hung_agent(dir: &Path) -> (PathBuf, JoinHandle<()>) {
    let path = dir.join("hung-agent.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    (path, task)
}

/// Serves the ssh-agent protocol for `keys` on a socket under `dir`.
#[cfg(unix)]
pub fn spawn_agent(dir: &Path, keys: Vec<PrivateKey>) -> (PathBuf, JoinHandle<()>) {
    let path = dir.join("agent.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let keys = Arc::new(keys);
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let keys = Arc::clone(&keys);
            tokio::spawn(serve_agent(stream, keys));
        }
    });
    (path, task)
}

#[cfg(unix)]
async fn serve_agent(mut stream: tokio::net::UnixStream, keys: Arc<Vec<PrivateKey>>) {
    loop {
        let Ok(len) = stream.read_u32().await else {
            return;
        };
        let mut request = vec![0u8; len as usize];
        if stream.read_exact(&mut request).await.is_err() {
            return;
        }

        let mut reply = BytesMut::new();
        match request.first() {
            Some(11) => {
                reply.put_u8(12);
                reply.put_u32(keys.len() as u32);
                for key in keys.iter() {
                    reply.put_string(&key.public_key().to_blob());
                    reply.put_str(key.comment());
                }
            }
            Some(13) => {
                let mut r = WireReader::new(&request[1..]);
                let blob = r.read_string().unwrap().to_vec();
                let data = r.read_string().unwrap().to_vec();
                match keys.iter().find(|k| k.public_key().to_blob() == blob) {
                    Some(key) => {
                        reply.put_u8(14);
                        reply.put_string(&key.sign_blob(&data));
                    }
                    None => reply.put_u8(5),
                }
            }
            _ => reply.put_u8(5),
        }

        if stream.write_u32(reply.len() as u32).await.is_err()
            || stream.write_all(&reply).await.is_err()
        {
            return;
        }
    }
}
