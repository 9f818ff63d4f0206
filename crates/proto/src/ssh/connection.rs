//! Authenticated connection handle and its background driver.
//!
//! Once authentication succeeds the transport is handed to a driver task:
//! a reader task forwards incoming packets over a channel, and the driver
//! answers them and writes caller commands in order. The [`Connection`]
//! handle only observes the [`ConnectionState`] published by the driver.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting -> Negotiating -> Authenticating -> Authenticated -> Closing -> Closed
//! ```
//!
//! `Closing` and `Closed` can be entered from any earlier state. Dropping the
//! handle requests a close.

use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::message::{unimplemented, DebugMessage, Disconnect, DisconnectReason, MessageType};
use crate::ssh::packet::MAX_PAYLOAD_SIZE;
use crate::ssh::privatekey::PublicKey;
use crate::ssh::transport::{PacketReader, PacketWriter, Transport};
use crate::ssh::version::Version;
use crate::ssh::wire::WireReader;
use keygate_platform::{KeygateError, KeygateResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Longest SSH_MSG_DEBUG text sent, in bytes. Leaves room for the message
/// header within [`MAX_PAYLOAD_SIZE`].
pub const MAX_DEBUG_MESSAGE: usize = MAX_PAYLOAD_SIZE - 64;

fn truncate_debug(message: &str) -> &str {
    if message.len() <= MAX_DEBUG_MESSAGE {
        return message;
    }
    let mut end = MAX_DEBUG_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    debug!(len = message.len(), "Truncating debug message to {} bytes", end);
    &message[..end]
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Opening the TCP connection
    Connecting,
    /// Exchanging versions and keys
    Negotiating,
    /// Running user authentication
    Authenticating,
    /// Ready for use
    Authenticated,
    /// Shutting down
    Closing,
    /// Transport torn down
    Closed,
}

impl ConnectionState {
    /// True for `Closing` and `Closed`.
    pub fn is_closing(self) -> bool {
        self >= ConnectionState::Closing
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Publishes a state change.
pub(crate) fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let previous = state.send_replace(next);
    if previous != next {
        debug!("Connection state {} -> {}", previous, next);
    }
}

/// What the handshake established.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Negotiated algorithms
    pub negotiated: NegotiatedAlgorithms,
    /// Session identifier
    pub session_id: Vec<u8>,
    /// Server identification
    pub peer_version: Version,
    /// Server host key
    pub host_key: PublicKey,
    /// Authenticated user
    pub username: String,
    /// Method that succeeded
    pub auth_method: &'static str,
}

#[derive(Debug)]
enum Command {
    Debug(DebugMessage),
    Close,
}

/// Handle to an authenticated SSH connection.
#[derive(Debug)]
pub struct Connection {
    info: ConnectionInfo,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Hands the transport to a background driver and returns the handle.
    pub(crate) fn spawn<R, W>(
        transport: Transport<R, W>,
        state: watch::Sender<ConnectionState>,
        info: ConnectionInfo,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let observer = state.subscribe();
        let (reader, writer) = transport.into_parts();
        tokio::spawn(drive(reader, writer, command_rx, state));

        Self {
            info,
            state: observer,
            commands,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Everything negotiated during the handshake.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Negotiated algorithms.
    pub fn negotiated(&self) -> &NegotiatedAlgorithms {
        &self.info.negotiated
    }

    /// Session identifier.
    pub fn session_id(&self) -> &[u8] {
        &self.info.session_id
    }

    /// Server identification.
    pub fn peer_version(&self) -> &Version {
        &self.info.peer_version
    }

    /// Server host key.
    pub fn host_key(&self) -> &PublicKey {
        &self.info.host_key
    }

    /// Queues an SSH_MSG_DEBUG for the server.
    ///
    /// Messages longer than [`MAX_DEBUG_MESSAGE`] bytes are truncated at a
    /// character boundary. Fails with [`KeygateError::Closed`] unless the
    /// connection is authenticated.
    pub fn send_debug(&self, message: &str) -> KeygateResult<()> {
        if self.state() != ConnectionState::Authenticated {
            return Err(KeygateError::Closed);
        }
        let message = truncate_debug(message);
        self.commands
            .send(Command::Debug(DebugMessage::new(message)))
            .map_err(|_| KeygateError::Closed)
    }

    /// Requests a close. Calling it more than once has no further effect.
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_ok() {
            trace!("Close requested");
        }
    }

    /// Waits until the transport has been torn down.
    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        // A dropped sender means the driver is gone.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
    }
}

type Incoming = KeygateResult<(u32, Vec<u8>)>;

async fn read_loop<R>(mut reader: PacketReader<R>, tx: mpsc::UnboundedSender<Incoming>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let packet = reader.read_packet().await;
        let failed = packet.is_err();
        if tx.send(packet).is_err() || failed {
            break;
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn drive<R, W>(
    reader: PacketReader<R>,
    mut writer: PacketWriter<W>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut incoming) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(read_loop(reader, tx));
    debug!("Connection driver started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Debug(message)) => {
                    match writer.write_packet(&message.to_bytes()).await {
                        Ok(()) => {}
                        Err(e) if e.is_network() => {
                            warn!("Failed to send debug message: {}", e);
                            transition(&state, ConnectionState::Closing);
                            break;
                        }
                        // Rejected before it reached the wire.
                        Err(e) => warn!("Dropping debug message: {}", e),
                    }
                }
                Some(Command::Close) | None => {
                    transition(&state, ConnectionState::Closing);
                    writer
                        .send_disconnect(DisconnectReason::ByApplication, "Disconnected by application")
                        .await;
                    break;
                }
            },
            packet = incoming.recv() => {
                let flow = match packet {
                    Some(Ok((sequence, payload))) => handle_packet(&mut writer, sequence, &payload).await,
                    Some(Err(e)) => {
                        debug!("Transport closed: {}", e);
                        Ok(Flow::Stop)
                    }
                    None => Ok(Flow::Stop),
                };
                match flow {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => {
                        transition(&state, ConnectionState::Closing);
                        break;
                    }
                    Err(e) => {
                        warn!("Closing connection: {}", e);
                        transition(&state, ConnectionState::Closing);
                        writer
                            .send_disconnect(DisconnectReason::ProtocolError, &e.to_string())
                            .await;
                        break;
                    }
                }
            }
        }
    }

    reader_task.abort();
    drop(writer);
    transition(&state, ConnectionState::Closed);
    info!("Connection closed");
}

async fn handle_packet<W>(
    writer: &mut PacketWriter<W>,
    sequence: u32,
    payload: &[u8],
) -> KeygateResult<Flow>
where
    W: AsyncWrite + Unpin,
{
    let Some(&kind) = payload.first() else {
        return Err(KeygateError::Protocol("Empty packet payload".to_string()));
    };

    match MessageType::from_u8(kind) {
        Some(MessageType::Disconnect) => {
            let message = Disconnect::from_bytes(payload)?;
            info!(code = message.code, "Server disconnected: {}", message.description);
            return Ok(Flow::Stop);
        }
        Some(MessageType::Ignore) => trace!("Ignoring SSH_MSG_IGNORE"),
        Some(MessageType::Debug) => {
            let message = DebugMessage::from_bytes(payload)?;
            debug!("Server debug message: {}", message.message);
        }
        Some(MessageType::Unimplemented) => {
            let mut r = WireReader::new(payload);
            r.read_u8()?;
            debug!("Server did not implement packet {}", r.read_u32()?);
        }
        Some(MessageType::GlobalRequest) => {
            let mut r = WireReader::new(payload);
            r.read_u8()?;
            let name = r.read_utf8()?;
            let want_reply = r.read_bool()?;
            debug!("Rejecting global request {}", name);
            if want_reply {
                writer.write_packet(&[MessageType::RequestFailure as u8]).await?;
            }
        }
        _ => {
            debug!("Unhandled message {} (seq {})", kind, sequence);
            writer.write_packet(&unimplemented(sequence)).await?;
        }
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::privatekey::PrivateKey;
    use bytes::{BufMut, BytesMut};
    use crate::ssh::wire::WireWrite;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    type Half = Transport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Half, Half) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Transport::new(ar, aw), Transport::new(br, bw))
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            negotiated: NegotiatedAlgorithms {
                kex: "curve25519-sha256".to_string(),
                host_key: "ssh-ed25519".to_string(),
                encryption_client_to_server: "aes128-cbc".to_string(),
                encryption_server_to_client: "aes128-cbc".to_string(),
                mac_client_to_server: "hmac-sha1".to_string(),
                mac_server_to_client: "hmac-sha1".to_string(),
                compression_client_to_server: "none".to_string(),
                compression_server_to_client: "none".to_string(),
            },
            session_id: vec![7; 32],
            peer_version: Version::new("test", None),
            host_key: PrivateKey::generate("").public_key(),
            username: "alice".to_string(),
            auth_method: "none",
        }
    }

    fn connect() -> (Connection, Half) {
        let (client, server) = pair();
        let (state, _) = watch::channel(ConnectionState::Authenticated);
        (Connection::spawn(client, state, info()), server)
    }

    async fn recv_raw(server: &mut Half) -> Vec<u8> {
        server.reader.read_packet().await.unwrap().1
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_waiters() {
        let (conn, mut server) = connect();
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        conn.close();
        conn.close();
        tokio::time::timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.state().is_closing());

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.disconnect_code(), Some(11));
        assert!(matches!(conn.send_debug("late"), Err(KeygateError::Closed)));
    }

    #[tokio::test]
    async fn test_debug_messages_are_ordered() {
        let (conn, mut server) = connect();
        conn.send_debug("first").unwrap();
        conn.send_debug("second").unwrap();

        for expected in ["first", "second"] {
            let payload = recv_raw(&mut server).await;
            assert_eq!(DebugMessage::from_bytes(&payload).unwrap().message, expected);
        }
        conn.close();
        conn.wait_closed().await;
    }

    #[test]
    fn test_truncate_debug_keeps_char_boundary() {
        assert_eq!(truncate_debug("short"), "short");
        let long = format!("{}\u{e9}", "x".repeat(MAX_DEBUG_MESSAGE - 1));
        let cut = truncate_debug(&long);
        assert_eq!(cut.len(), MAX_DEBUG_MESSAGE - 1);
        assert!(cut.chars().all(|c| c == 'x'));
    }

    #[tokio::test]
    async fn test_oversized_debug_message_keeps_connection() {
        let (conn, mut server) = connect();
        conn.send_debug(&"x".repeat(40_000)).unwrap();
        conn.send_debug("after").unwrap();

        let payload = recv_raw(&mut server).await;
        let first = DebugMessage::from_bytes(&payload).unwrap();
        assert_eq!(first.message.len(), MAX_DEBUG_MESSAGE);
        let payload = recv_raw(&mut server).await;
        assert_eq!(DebugMessage::from_bytes(&payload).unwrap().message, "after");
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        conn.close();
        conn.wait_closed().await;
    }

    #[tokio::test]
    async fn test_driver_answers_unknown_and_global_requests() {
        let (conn, mut server) = connect();

        server.send(&[MessageType::ServiceAccept as u8, 0, 0, 0, 0]).await.unwrap();
        let reply = recv_raw(&mut server).await;
        assert_eq!(reply, unimplemented(0));

        let mut request = BytesMut::new();
        request.put_u8(MessageType::GlobalRequest as u8);
        request.put_str("keepalive@openssh.com");
        request.put_bool(true);
        server.send(&request).await.unwrap();
        assert_eq!(recv_raw(&mut server).await, vec![MessageType::RequestFailure as u8]);

        server
            .writer
            .send_disconnect(DisconnectReason::ByApplication, "bye")
            .await;
        tokio::time::timeout(Duration::from_secs(5), conn.wait_closed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_drop_closes() {
        let (conn, mut server) = connect();
        drop(conn);
        let err = server.recv().await.unwrap_err();
        assert_eq!(err.disconnect_code(), Some(11));
    }
}
