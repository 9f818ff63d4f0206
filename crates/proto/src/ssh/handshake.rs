//! Key exchange driver (RFC 4253 Sections 7 and 8).
//!
//! Runs one full exchange over a [`Transport`] on either side:
//!
//! 1. Both sides send KEXINIT and negotiate every algorithm category
//! 2. The client sends its ephemeral public value (KEXDH_INIT / KEX_ECDH_INIT)
//! 3. The server replies with its host key, ephemeral value and a signature
//!    over the exchange hash H
//! 4. Both sides send NEWKEYS and switch to the derived keys
//!
//! Curve25519 and DH group 14 share message numbers 30/31; only the encoding
//! of the public values differs (string vs. mpint).

use crate::ssh::algorithms::AlgorithmPreferences;
use crate::ssh::compression::CompressionAlgorithm;
use crate::ssh::crypto::{CipherAlgorithm, Direction, DirectionKeys, MacAlgorithm, Opener, Sealer};
use crate::ssh::hostkey::{verify_exchange_signature, HostKey};
use crate::ssh::kex::{negotiate, KexInit, NegotiatedAlgorithms, NewKeys};
use crate::ssh::kex_dh::{ExchangeHashInput, KexGroup, KexHash, KexMethod, KeyExchange};
use crate::ssh::message::MessageType;
use crate::ssh::privatekey::PublicKey;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{WireReader, WireWrite};
use bytes::{BufMut, BytesMut};
use keygate_platform::{KeygateError, KeygateResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiating side
    Client,
    /// Accepting side
    Server,
}

impl Role {
    fn outgoing(self) -> Direction {
        match self {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }

    fn incoming(self) -> Direction {
        match self {
            Role::Client => Direction::ServerToClient,
            Role::Server => Direction::ClientToServer,
        }
    }
}

/// Outcome of a completed key exchange.
#[derive(Debug, Clone)]
pub struct KexOutcome {
    /// Algorithms in use
    pub negotiated: NegotiatedAlgorithms,
    /// Session identifier (H of the first exchange)
    pub session_id: Vec<u8>,
    /// Server host key
    pub host_key: PublicKey,
}

/// Identification strings of both sides, as they enter the exchange hash.
#[derive(Debug, Clone, Copy)]
pub struct Identification<'a> {
    /// V_C
    pub client: &'a str,
    /// V_S
    pub server: &'a str,
}

fn algorithms_for(
    negotiated: &NegotiatedAlgorithms,
    direction: Direction,
) -> KeygateResult<(CipherAlgorithm, Option<MacAlgorithm>, CompressionAlgorithm)> {
    let (cipher, mac, compression) = match direction {
        Direction::ClientToServer => (
            &negotiated.encryption_client_to_server,
            &negotiated.mac_client_to_server,
            &negotiated.compression_client_to_server,
        ),
        Direction::ServerToClient => (
            &negotiated.encryption_server_to_client,
            &negotiated.mac_server_to_client,
            &negotiated.compression_server_to_client,
        ),
    };

    let cipher = CipherAlgorithm::from_name(cipher)
        .ok_or_else(|| KeygateError::Protocol(format!("Unsupported cipher: {}", cipher)))?;
    let mac = if cipher.is_aead() {
        None
    } else {
        Some(
            MacAlgorithm::from_name(mac)
                .ok_or_else(|| KeygateError::Protocol(format!("Unsupported MAC: {}", mac)))?,
        )
    };
    let compression = CompressionAlgorithm::from_name(compression).ok_or_else(|| {
        KeygateError::Protocol(format!("Unsupported compression: {}", compression))
    })?;
    Ok((cipher, mac, compression))
}

struct SessionKeys<'a> {
    negotiated: &'a NegotiatedAlgorithms,
    hash: KexHash,
    shared_secret: &'a [u8],
    exchange_hash: &'a [u8],
    session_id: &'a [u8],
}

impl SessionKeys<'_> {
    fn sealer(&self, direction: Direction) -> KeygateResult<(Sealer, CompressionAlgorithm)> {
        let (cipher, mac, compression) = algorithms_for(self.negotiated, direction)?;
        let keys = self.derive(direction, cipher, mac);
        Ok((Sealer::new(cipher, mac, &keys)?, compression))
    }

    fn opener(&self, direction: Direction) -> KeygateResult<(Opener, CompressionAlgorithm)> {
        let (cipher, mac, compression) = algorithms_for(self.negotiated, direction)?;
        let keys = self.derive(direction, cipher, mac);
        Ok((Opener::new(cipher, mac, &keys)?, compression))
    }

    fn derive(
        &self,
        direction: Direction,
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
    ) -> DirectionKeys {
        DirectionKeys::derive(
            self.hash,
            self.shared_secret,
            self.exchange_hash,
            self.session_id,
            direction,
            cipher,
            mac,
        )
    }
}

async fn exchange_kexinit<R, W>(
    transport: &mut Transport<R, W>,
    ours: &KexInit,
) -> KeygateResult<(Vec<u8>, KexInit, Vec<u8>)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let our_payload = ours.to_bytes();
    transport.send(&our_payload).await?;

    let peer_payload = transport.recv().await?;
    if peer_payload[0] != MessageType::KexInit as u8 {
        return Err(KeygateError::Protocol(format!(
            "Expected KEXINIT, got message {}",
            peer_payload[0]
        )));
    }
    let peer = KexInit::from_bytes(&peer_payload)?;
    Ok((our_payload, peer, peer_payload))
}

fn read_public(r: &mut WireReader<'_>, method: KexMethod) -> KeygateResult<Vec<u8>> {
    Ok(match method.group {
        KexGroup::Curve25519 => r.read_string()?.to_vec(),
        KexGroup::DhGroup14 => r.read_mpint()?.to_vec(),
    })
}

async fn finish_newkeys<R, W>(
    transport: &mut Transport<R, W>,
    keys: &SessionKeys<'_>,
    role: Role,
) -> KeygateResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    transport.send(&NewKeys::new().to_bytes()).await?;
    let (sealer, compression) = keys.sealer(role.outgoing())?;
    transport.writer.install(sealer, compression);

    let payload = transport.recv().await?;
    NewKeys::from_bytes(&payload)?;
    let (opener, compression) = keys.opener(role.incoming())?;
    transport.reader.install(opener, compression);
    Ok(())
}

/// Runs the client side of a key exchange.
pub async fn client_key_exchange<R, W>(
    transport: &mut Transport<R, W>,
    prefs: &AlgorithmPreferences,
    ids: Identification<'_>,
) -> KeygateResult<KexOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = KexInit::from_preferences(prefs);
    let (client_kexinit, server, server_kexinit) = exchange_kexinit(transport, &ours).await?;

    let negotiated = negotiate(&ours, &server, prefs.compression_disabled)?;
    info!(
        kex = %negotiated.kex,
        cipher = %negotiated.encryption_client_to_server,
        mac = %negotiated.mac_client_to_server,
        compression = %negotiated.compression_client_to_server,
        "Negotiated algorithms"
    );

    let method = KexMethod::from_name(&negotiated.kex)?;
    let exchange = KeyExchange::start(method)?;
    let client_public = exchange.public_value();

    let mut init = BytesMut::new();
    init.put_u8(MessageType::KexdhInit as u8);
    method.put_public(&mut init, &client_public);
    transport.send(&init).await?;

    let reply = transport.recv().await?;
    let mut r = WireReader::new(&reply);
    r.expect_message(MessageType::KexdhReply as u8, "SSH_MSG_KEXDH_REPLY")?;
    let host_key_blob = r.read_string()?;
    let server_public = read_public(&mut r, method)?;
    let signature = r.read_string()?;

    let shared_secret = exchange.finish(&server_public)?;
    let exchange_hash = ExchangeHashInput {
        client_version: ids.client,
        server_version: ids.server,
        client_kexinit: &client_kexinit,
        server_kexinit: &server_kexinit,
        host_key: host_key_blob,
        client_public: &client_public,
        server_public: &server_public,
        shared_secret: &shared_secret,
    }
    .compute(method);

    let host_key = verify_exchange_signature(host_key_blob, &exchange_hash, signature)?;
    debug!("Server host key {}", host_key.fingerprint());

    let keys = SessionKeys {
        negotiated: &negotiated,
        hash: method.hash,
        shared_secret: &shared_secret,
        exchange_hash: &exchange_hash,
        session_id: &exchange_hash,
    };
    finish_newkeys(transport, &keys, Role::Client).await?;

    Ok(KexOutcome {
        negotiated,
        session_id: exchange_hash.clone(),
        host_key,
    })
}

/// Runs the server side of a key exchange.
pub async fn server_key_exchange<R, W>(
    transport: &mut Transport<R, W>,
    prefs: &AlgorithmPreferences,
    host_key: &dyn HostKey,
    ids: Identification<'_>,
) -> KeygateResult<KexOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = KexInit::from_preferences(prefs);
    let (server_kexinit, client, client_kexinit) = exchange_kexinit(transport, &ours).await?;

    // Client lists drive the choice (RFC 4253 Section 7.1).
    let negotiated = negotiate(&client, &ours, prefs.compression_disabled)?;
    debug!(kex = %negotiated.kex, "Server negotiated algorithms");

    if client.first_kex_packet_follows()
        && client.kex_algorithms().first() != Some(&negotiated.kex)
    {
        debug!("Discarding wrongly guessed key exchange packet");
        transport.recv().await?;
    }

    let method = KexMethod::from_name(&negotiated.kex)?;
    let init = transport.recv().await?;
    let mut r = WireReader::new(&init);
    r.expect_message(MessageType::KexdhInit as u8, "SSH_MSG_KEXDH_INIT")?;
    let client_public = read_public(&mut r, method)?;

    let exchange = KeyExchange::start(method)?;
    let server_public = exchange.public_value();
    let shared_secret = exchange.finish(&client_public)?;
    let host_key_blob = host_key.public_key_blob();

    let exchange_hash = ExchangeHashInput {
        client_version: ids.client,
        server_version: ids.server,
        client_kexinit: &client_kexinit,
        server_kexinit: &server_kexinit,
        host_key: &host_key_blob,
        client_public: &client_public,
        server_public: &server_public,
        shared_secret: &shared_secret,
    }
    .compute(method);

    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::KexdhReply as u8);
    reply.put_string(&host_key_blob);
    method.put_public(&mut reply, &server_public);
    reply.put_string(&host_key.sign(&exchange_hash));
    transport.send(&reply).await?;

    let keys = SessionKeys {
        negotiated: &negotiated,
        hash: method.hash,
        shared_secret: &shared_secret,
        exchange_hash: &exchange_hash,
        session_id: &exchange_hash,
    };
    finish_newkeys(transport, &keys, Role::Server).await?;

    Ok(KexOutcome {
        negotiated,
        session_id: exchange_hash.clone(),
        host_key: PublicKey::from_blob(&host_key_blob)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algorithms::{AlgorithmChoice, ENCRYPTION_ALGORITHMS, KEX_ALGORITHMS};
    use crate::ssh::hostkey::Ed25519HostKey;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    type Half = Transport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Half, Half) {
        let (a, b) = duplex(256 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Transport::new(ar, aw), Transport::new(br, bw))
    }

    const IDS: Identification<'static> = Identification {
        client: "SSH-2.0-Client",
        server: "SSH-2.0-Server",
    };

    async fn run(client_prefs: AlgorithmPreferences) -> (KeygateResult<KexOutcome>, Half, Half) {
        let (mut client, mut server) = pair();
        let host_key = Ed25519HostKey::generate();
        let server_prefs = AlgorithmPreferences::all();

        let server_task = tokio::spawn(async move {
            let result = server_key_exchange(&mut server, &server_prefs, &host_key, IDS).await;
            (result.map(|o| o.session_id), server)
        });
        let result = client_key_exchange(&mut client, &client_prefs, IDS).await;
        let (server_result, server) = server_task.await.unwrap();
        if let Ok(outcome) = &result {
            assert_eq!(&outcome.session_id, server_result.as_ref().unwrap());
        }
        (result, client, server)
    }

    fn only(kex: &str, cipher: &str) -> AlgorithmPreferences {
        AlgorithmPreferences::resolve(
            &AlgorithmChoice::only([kex]),
            &AlgorithmChoice::only([cipher]),
            &AlgorithmChoice::Default,
            &AlgorithmChoice::Default,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_every_kex_method() {
        for kex in KEX_ALGORITHMS {
            let (result, mut client, mut server) = run(only(kex, "aes128-cbc")).await;
            let outcome = result.unwrap();
            assert_eq!(outcome.negotiated.kex, *kex);

            client.send(&[MessageType::Ignore as u8, 0, 0, 0, 0, 99]).await.unwrap();
            client.send(&[200, 1, 2, 3]).await.unwrap();
            assert_eq!(server.recv().await.unwrap(), vec![200, 1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_every_cipher() {
        for cipher in ENCRYPTION_ALGORITHMS {
            let (result, mut client, mut server) = run(only("curve25519-sha256", cipher)).await;
            assert_eq!(result.unwrap().negotiated.encryption_server_to_client, *cipher);

            server.send(b"\xc8server data").await.unwrap();
            assert_eq!(client.recv().await.unwrap(), b"\xc8server data".to_vec());
        }
    }

    #[tokio::test]
    async fn test_no_common_cipher() {
        let (mut client, mut server) = pair();
        let host_key = Ed25519HostKey::generate();
        let mut server_prefs = AlgorithmPreferences::all();
        server_prefs.encryption = vec!["aes128-cbc".to_string()];

        tokio::spawn(async move {
            let _ = server_key_exchange(&mut server, &server_prefs, &host_key, IDS).await;
        });

        let err = client_key_exchange(&mut client, &only("curve25519-sha256", "aes256-cbc"), IDS)
            .await
            .unwrap_err();
        assert_eq!(err.disconnect_code(), Some(3));
    }
}
