//! SSH transport layer packet I/O (RFC 4253).
//!
//! The transport is split into a [`PacketReader`] and a [`PacketWriter`] so the
//! connection driver can keep a dedicated reader task while commands write
//! packets from elsewhere. Each half owns its own cipher, compression stream
//! and sequence number.
//!
//! # Lifecycle
//!
//! 1. Packets flow in the clear until NEWKEYS
//! 2. [`PacketWriter::install`] / [`PacketReader::install`] activate the
//!    negotiated cipher, MAC and compression
//! 3. `zlib@openssh.com` stays pending until
//!    [`Transport::enable_delayed_compression`] is called after
//!    USERAUTH_SUCCESS
//!
//! Sequence numbers start at zero, count every packet and wrap at 2^32.

use crate::ssh::compression::{CompressionAlgorithm, Compressor, Decompressor};
use crate::ssh::crypto::{Opener, Sealer};
use crate::ssh::message::{DebugMessage, Disconnect, DisconnectReason, MessageType};
use crate::ssh::packet::{check_length, frame, unframe, MAX_PAYLOAD_SIZE};
use keygate_platform::{KeygateError, KeygateResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Incoming half of the transport.
#[derive(Debug)]
pub struct PacketReader<R> {
    stream: R,
    opener: Opener,
    decompressor: Decompressor,
    delayed: Option<Decompressor>,
    sequence: u32,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Creates a reader with no protection installed.
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            opener: Opener::None,
            decompressor: Decompressor::None,
            delayed: None,
            sequence: 0,
        }
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Activates new keys and compression for incoming packets.
    pub fn install(&mut self, opener: Opener, compression: CompressionAlgorithm) {
        self.opener = opener;
        match compression {
            CompressionAlgorithm::None => {}
            CompressionAlgorithm::Zlib => self.decompressor = Decompressor::zlib(),
            CompressionAlgorithm::ZlibOpenssh => self.delayed = Some(Decompressor::zlib()),
        }
    }

    /// Starts a pending `zlib@openssh.com` stream, if any.
    pub fn enable_delayed_compression(&mut self) {
        if let Some(decompressor) = self.delayed.take() {
            debug!("Enabling delayed decompression");
            self.decompressor = decompressor;
        }
    }

    /// Reads one packet and returns its sequence number and payload.
    pub async fn read_packet(&mut self) -> KeygateResult<(u32, Vec<u8>)> {
        let first_len = self.opener.first_block_len();
        let mut buf = vec![0u8; first_len];
        self.stream.read_exact(&mut buf).await?;

        let sequence = self.sequence;
        let packet_length = self.opener.decrypt_length(sequence, &mut buf);
        check_length(
            packet_length,
            self.opener.block_size(),
            self.opener.excludes_length(),
            first_len,
        )?;

        let total = 4 + packet_length as usize;
        buf.resize(total + self.opener.trailer_len(), 0);
        self.stream.read_exact(&mut buf[first_len..]).await?;

        let (packet, trailer) = buf.split_at_mut(total);
        let body = self.opener.open(sequence, packet, trailer)?;
        let payload = self.decompressor.decompress(&unframe(&body)?)?;

        self.sequence = self.sequence.wrapping_add(1);
        trace!(sequence, len = payload.len(), "received packet");
        Ok((sequence, payload))
    }
}

/// Outgoing half of the transport.
#[derive(Debug)]
pub struct PacketWriter<W> {
    stream: W,
    sealer: Sealer,
    compressor: Compressor,
    delayed: Option<Compressor>,
    sequence: u32,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Creates a writer with no protection installed.
    pub fn new(stream: W) -> Self {
        Self {
            stream,
            sealer: Sealer::None,
            compressor: Compressor::None,
            delayed: None,
            sequence: 0,
        }
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Activates new keys and compression for outgoing packets.
    pub fn install(&mut self, sealer: Sealer, compression: CompressionAlgorithm) {
        self.sealer = sealer;
        match compression {
            CompressionAlgorithm::None => {}
            CompressionAlgorithm::Zlib => self.compressor = Compressor::zlib(),
            CompressionAlgorithm::ZlibOpenssh => self.delayed = Some(Compressor::zlib()),
        }
    }

    /// Starts a pending `zlib@openssh.com` stream, if any.
    pub fn enable_delayed_compression(&mut self) {
        if let Some(compressor) = self.delayed.take() {
            debug!("Enabling delayed compression");
            self.compressor = compressor;
        }
    }

    /// Frames, protects and sends one payload.
    pub async fn write_packet(&mut self, payload: &[u8]) -> KeygateResult<()> {
        // Checked before the compressor sees the payload so a rejection
        // leaves the zlib stream in step with the peer.
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(KeygateError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let compressed = self.compressor.compress(payload)?;
        let mut packet = frame(
            &compressed,
            self.sealer.block_size(),
            self.sealer.excludes_length(),
        )?;
        self.sealer.seal(self.sequence, &mut packet)?;

        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;

        trace!(sequence = self.sequence, len = payload.len(), "sent packet");
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Sends SSH_MSG_DISCONNECT, ignoring write failures.
    pub async fn send_disconnect(&mut self, reason: DisconnectReason, description: &str) {
        let message = Disconnect::new(reason, description);
        if let Err(e) = self.write_packet(&message.to_bytes()).await {
            debug!("Failed to send disconnect: {}", e);
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Both halves of a transport, used while the handshake runs sequentially.
#[derive(Debug)]
pub struct Transport<R, W> {
    /// Incoming half
    pub reader: PacketReader<R>,
    /// Outgoing half
    pub writer: PacketWriter<W>,
}

impl Transport<OwnedReadHalf, OwnedWriteHalf> {
    /// Splits a connected TCP stream into a transport.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self::new(read, write)
    }
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps a reader and writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: PacketReader::new(reader),
            writer: PacketWriter::new(writer),
        }
    }

    /// Sends one payload.
    pub async fn send(&mut self, payload: &[u8]) -> KeygateResult<()> {
        self.writer.write_packet(payload).await
    }

    /// Receives the next significant payload.
    ///
    /// IGNORE and DEBUG messages are consumed here. A DISCONNECT from the peer
    /// becomes [`KeygateError::Disconnect`] carrying the peer's reason code.
    pub async fn recv(&mut self) -> KeygateResult<Vec<u8>> {
        loop {
            let (_, payload) = self.reader.read_packet().await?;
            match payload.first().copied().and_then(MessageType::from_u8) {
                Some(MessageType::Ignore) => continue,
                Some(MessageType::Debug) => {
                    if let Ok(message) = DebugMessage::from_bytes(&payload) {
                        debug!("Peer debug message: {}", message.message);
                    }
                    continue;
                }
                Some(MessageType::Disconnect) => {
                    let message = Disconnect::from_bytes(&payload)?;
                    debug!(
                        code = message.code,
                        "Peer disconnected: {}", message.description
                    );
                    return Err(KeygateError::Disconnect {
                        code: message.code,
                        reason: message.description,
                    });
                }
                None if payload.is_empty() => {
                    return Err(KeygateError::Protocol("Empty packet payload".to_string()))
                }
                _ => return Ok(payload),
            }
        }
    }

    /// Starts pending delayed compression in both directions.
    pub fn enable_delayed_compression(&mut self) {
        self.reader.enable_delayed_compression();
        self.writer.enable_delayed_compression();
    }

    /// Sends DISCONNECT for a locally detected failure and returns the error
    /// the caller should report.
    ///
    /// Protocol and security failures are reported as [`KeygateError::Disconnect`]
    /// with the code that was sent, and a `Disconnect` keeps its own code.
    /// Callback errors are returned unchanged after a BY_APPLICATION disconnect;
    /// everything else is returned without touching the wire.
    pub async fn fail(&mut self, err: KeygateError) -> KeygateError {
        let (reason, description) = match &err {
            KeygateError::Protocol(msg) => (DisconnectReason::ProtocolError, msg.clone()),
            KeygateError::Security(msg) => (DisconnectReason::MacError, msg.clone()),
            KeygateError::Disconnect { code, reason } => match DisconnectReason::from_code(*code) {
                Some(r) => (r, reason.clone()),
                None => return err,
            },
            KeygateError::Callback(_) => {
                self.writer
                    .send_disconnect(DisconnectReason::ByApplication, "Internal error")
                    .await;
                return err;
            }
            _ => return err,
        };

        warn!(code = reason.code(), "Closing connection: {}", description);
        self.writer.send_disconnect(reason, &description).await;
        KeygateError::Disconnect {
            code: reason.code(),
            reason: description,
        }
    }

    /// Separates the halves.
    pub fn into_parts(self) -> (PacketReader<R>, PacketWriter<W>) {
        (self.reader, self.writer)
    }
}
