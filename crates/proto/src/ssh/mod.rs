//! SSH connection establishment and user authentication (RFC 4251-4253).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire and packet layer** ([`wire`], [`packet`], [`message`]) - encodings
//!    and the binary packet protocol (RFC 4253 Section 6)
//! 2. **Transport layer** ([`transport`], [`kex`], [`kex_dh`], [`crypto`],
//!    [`compression`], [`handshake`]) - key exchange, ciphers, MACs (RFC 4253)
//! 3. **Host verification** ([`known_hosts`], [`hostkey`], [`certificate`])
//! 4. **Authentication** ([`auth`], [`userauth`], [`credentials`], [`agent`]) -
//!    RFC 4252 and RFC 4256
//! 5. **Connection API** ([`client`], [`connection`], [`handler`], [`server`])
//!
//! # Example
//!
//! ```rust,no_run
//! use keygate_proto::ssh::{connect, DefaultClientHandler, KnownHostsSource, SshClientConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SshClientConfig {
//!     username: "deploy".to_string(),
//!     known_hosts: KnownHostsSource::Disabled,
//!     ..Default::default()
//! };
//! let conn = connect("example.com", 22, &config, &mut DefaultClientHandler).await?;
//! conn.send_debug("hello")?;
//! conn.close();
//! conn.wait_closed().await;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication

pub mod agent;
pub mod algorithms;
pub mod auth;
pub mod authorized_keys;
pub mod certificate;
pub mod client;
pub mod compression;
pub mod connection;
pub mod credentials;
pub mod crypto;
pub mod handler;
pub mod handshake;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod privatekey;
pub mod server;
pub mod transport;
pub mod userauth;
pub mod version;
pub mod wire;

// Re-export main types
pub use agent::AgentIdentity;
pub use algorithms::{AlgorithmChoice, AlgorithmPreferences, Category};
pub use auth::{InfoRequest, Prompt};
pub use authorized_keys::{AuthorizedKey, AuthorizedKeys};
pub use certificate::{CertType, Certificate, CertificateBuilder};
pub use client::{connect, AbortHandle, Connector, SshClientConfig};
pub use connection::{Connection, ConnectionInfo, ConnectionState};
pub use credentials::{CertMaterial, ClientKey, ClientKeySpec, KeyMaterial};
pub use handler::{CallbackResult, ClientHandler, DefaultClientHandler};
pub use hostkey::{Ed25519HostKey, HostKey};
pub use known_hosts::{HostKeySpec, HostKeyStatus, KnownHosts, KnownHostsSource};
pub use message::{DisconnectReason, MessageType};
pub use privatekey::{PrivateKey, PublicKey};
pub use server::{PasswordCheck, ServerHandler, SshServer, SshServerConfig, SshSession};
pub use version::Version;
