//! `PeerSession`: wraps one already-connected bidirectional stream and runs
//! it through handshake, message collection, and (for magnet resolution)
//! the `ut_metadata` fetch flow.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts};

use super::bitfield::{self, MSG_PORT};
use super::codec::{Handshake, HandshakeCodec, MessageCodec, RawMessage};
use super::error::{Error, Result};
use super::extension;
use crate::{Bitfield, PeerId, Sha1Hash};

/// The outcome of one completed handshake + message-collection visit.
///
/// Bitfield reconstruction is deferred to the caller via [`VisitResult::bitfield`]
/// rather than performed here, since for an inbound visit the pieces count
/// isn't known until the torrent table is consulted with `info_hash` —
/// carrying the raw messages forward avoids the session needing that lookup
/// itself.
#[derive(Clone, Debug)]
pub struct VisitResult {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub dht_supported: bool,
    pub extension_supported: bool,
    pub messages: Vec<RawMessage>,
}

impl VisitResult {
    pub fn bitfield(&self, pieces_count: usize) -> Bitfield {
        bitfield::reconstruct(&self.messages, pieces_count)
    }

    pub fn pieces_downloaded(&self, pieces_count: usize) -> usize {
        self.bitfield(pieces_count).count_ones()
    }
}

/// Runs one peer-wire visit: handshake, then collect up to
/// `receive_message_max` messages.
#[derive(Clone)]
pub struct PeerSession {
    local_peer_id: PeerId,
    network_timeout: Duration,
    receive_message_max: usize,
    advertise_dht: bool,
    local_dht_port: u16,
}

impl PeerSession {
    pub fn new(local_peer_id: PeerId, network_timeout: Duration, receive_message_max: usize) -> Self {
        Self {
            local_peer_id,
            network_timeout,
            receive_message_max,
            advertise_dht: false,
            local_dht_port: 0,
        }
    }

    /// Advertises BEP 5 DHT support in the handshake and, if the remote
    /// does too, sends a `port` message carrying `port` after collecting
    /// messages.
    pub fn with_dht_port(mut self, port: u16) -> Self {
        self.advertise_dht = true;
        self.local_dht_port = port;
        self
    }

    /// Initiates a connection: sends the local handshake first, then reads
    /// the remote's. Fails with [`Error::InfoHashMismatch`] if the peer
    /// echoes a different info hash.
    pub async fn run_outbound<S>(&self, stream: S, info_hash: Sha1Hash) -> Result<VisitResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, HandshakeCodec);
        let handshake = Handshake::new(info_hash, self.local_peer_id).with_dht(self.advertise_dht);
        framed.send(handshake).await?;

        let remote = self.read_handshake(&mut framed).await?;
        if remote.info_hash != info_hash {
            return Err(Error::InfoHashMismatch);
        }

        self.collect(framed, remote).await
    }

    /// Accepts a connection: reads the remote's handshake first (its info
    /// hash is unknown until it arrives), then echoes it back. The caller
    /// is responsible for looking up `VisitResult::info_hash` in the
    /// torrent table and discarding on a miss.
    pub async fn run_inbound<S>(&self, stream: S) -> Result<VisitResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, HandshakeCodec);
        let remote = self.read_handshake(&mut framed).await?;

        let handshake =
            Handshake::new(remote.info_hash, self.local_peer_id).with_dht(self.advertise_dht);
        framed.send(handshake).await?;

        self.collect(framed, remote).await
    }

    async fn read_handshake<S>(&self, framed: &mut Framed<S, HandshakeCodec>) -> Result<Handshake>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let next = tokio::time::timeout(self.network_timeout, framed.next())
            .await
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")))?;
        next.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before sending handshake",
            ))
        })?
    }

    /// Switches from the handshake codec to the message codec and collects
    /// messages until the peer closes, a read times out, or
    /// `receive_message_max` is reached. A later timeout is the normal
    /// termination condition, not an error.
    async fn collect<S>(
        &self,
        framed: Framed<S, HandshakeCodec>,
        remote: Handshake,
    ) -> Result<VisitResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = switch_codec(framed, MessageCodec);

        let mut messages = Vec::new();
        while messages.len() < self.receive_message_max {
            match tokio::time::timeout(self.network_timeout, framed.next()).await {
                Ok(Some(msg)) => messages.push(msg?),
                Ok(None) => break,
                Err(_elapsed) => break,
            }
        }

        if self.advertise_dht && remote.supports_dht() {
            let port_msg = RawMessage::new(MSG_PORT, self.local_dht_port.to_be_bytes().to_vec());
            if let Err(e) = framed.send(port_msg).await {
                log::warn!("failed to send DHT port message: {}", e);
            }
        }

        Ok(VisitResult {
            info_hash: remote.info_hash,
            peer_id: remote.peer_id,
            dht_supported: remote.supports_dht(),
            extension_supported: remote.supports_extension_protocol(),
            messages,
        })
    }

    /// Runs the BEP 9 `ut_metadata` fetch used to resolve a magnet link:
    /// handshake with the extension bit set, exchange extended handshakes,
    /// request every metadata block, and verify the assembled result
    /// against `info_hash`.
    pub async fn fetch_metadata<S>(
        &self,
        stream: S,
        info_hash: Sha1Hash,
        local_sub_id: u8,
    ) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, HandshakeCodec);
        let handshake =
            Handshake::new(info_hash, self.local_peer_id).with_extension_protocol(true);
        framed.send(handshake).await?;

        let remote = self.read_handshake(&mut framed).await?;
        if remote.info_hash != info_hash {
            return Err(Error::InfoHashMismatch);
        }
        if !remote.supports_extension_protocol() {
            return Err(Error::UnsupportedExtension);
        }

        let mut framed = switch_codec(framed, MessageCodec);
        framed
            .send(extension::build_extended_handshake(local_sub_id))
            .await?;

        let mut seen = 0usize;
        let remote_ext = loop {
            if seen >= self.receive_message_max {
                return Err(Error::NoExtendedHandshake);
            }
            let msg = self.next_or_timeout(&mut framed).await?;
            seen += 1;
            if let Ok(handshake) = extension::find_extended_handshake(std::slice::from_ref(&msg)) {
                break handshake;
            }
        };

        let total = extension::block_count(remote_ext.metadata_size);
        for i in 0..total {
            let request = extension::build_metadata_request(remote_ext.ut_metadata_id, i);
            framed.send(request).await?;
        }

        let mut blocks = BTreeMap::new();
        while blocks.len() < total {
            if seen >= self.receive_message_max {
                return Err(Error::IncompleteMetadata);
            }
            let msg = self.next_or_timeout(&mut framed).await?;
            seen += 1;
            if let Some((piece, block)) = extension::parse_metadata_piece(&msg, local_sub_id) {
                blocks.insert(piece, block.to_vec());
            }
        }

        extension::assemble_metadata(&blocks, total, &info_hash)
    }

    async fn next_or_timeout<S>(&self, framed: &mut Framed<S, MessageCodec>) -> Result<RawMessage>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let next = tokio::time::timeout(self.network_timeout, framed.next())
            .await
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::TimedOut, "metadata fetch timed out")))?;
        next.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during metadata fetch",
            ))
        })?
    }
}

fn switch_codec<S>(framed: Framed<S, HandshakeCodec>, codec: MessageCodec) -> Framed<S, MessageCodec>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let parts = framed.into_parts();
    let mut new_parts = FramedParts::new(parts.io, codec);
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    Framed::from_parts(new_parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::bitfield::MSG_EXTENDED;
    use crate::peer::extension::METADATA_BLOCK_LEN;
    use sha1::{Digest, Sha1};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn outbound_inbound_handshake_round_trip() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [0xAAu8; 20];
        let server_peer_id = [0x42u8; 20];
        let client_peer_id = [0x43u8; 20];

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let session = PeerSession::new(server_peer_id, Duration::from_millis(200), 128);
            session.run_inbound(socket).await.unwrap()
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let client = PeerSession::new(client_peer_id, Duration::from_millis(200), 128);
        let client_result = client.run_outbound(socket, info_hash).await.unwrap();

        let server_result = server.await.unwrap();
        assert_eq!(client_result.peer_id, server_peer_id);
        assert_eq!(server_result.info_hash, info_hash);
        assert_eq!(server_result.peer_id, client_peer_id);
        assert!(client_result.messages.is_empty());
    }

    #[tokio::test]
    async fn outbound_rejects_mismatched_info_hash() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_peer_id = [0x11u8; 20];

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, HandshakeCodec);
            let _ = framed.next().await.unwrap().unwrap();
            let wrong = Handshake::new([0xFFu8; 20], server_peer_id);
            framed.send(wrong).await.unwrap();
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let client = PeerSession::new([0x22u8; 20], Duration::from_millis(200), 128);
        let result = client.run_outbound(socket, [0xAAu8; 20]).await;
        server.await.unwrap();

        assert!(matches!(result, Err(Error::InfoHashMismatch)));
    }

    #[tokio::test]
    async fn dht_support_is_reported_both_ways() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [0x55u8; 20];

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let session =
                PeerSession::new([0x66u8; 20], Duration::from_millis(200), 128).with_dht_port(17000);
            session.run_inbound(socket).await.unwrap()
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let client =
            PeerSession::new([0x77u8; 20], Duration::from_millis(200), 128).with_dht_port(6881);
        let client_result = client.run_outbound(socket, info_hash).await.unwrap();
        let server_result = server.await.unwrap();

        assert!(client_result.dht_supported);
        assert!(server_result.dht_supported);
    }

    #[tokio::test]
    async fn metadata_fetch_assembles_and_verifies_blocks() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let block0 = vec![0xABu8; METADATA_BLOCK_LEN];
        let block1 = vec![0xCDu8; METADATA_BLOCK_LEN / 2];
        let mut full = block0.clone();
        full.extend_from_slice(&block1);
        let digest = Sha1::digest(&full);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&digest);

        let blocks_for_peer = vec![block0, block1];
        let remote_sub_id = 9u8;
        let local_sub_id = 4u8;

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, HandshakeCodec);
            let their_handshake = framed.next().await.unwrap().unwrap();
            assert!(their_handshake.supports_extension_protocol());
            let handshake =
                Handshake::new(info_hash, [0x99u8; 20]).with_extension_protocol(true);
            framed.send(handshake).await.unwrap();

            let mut framed = switch_codec(framed, MessageCodec);

            // consume the local extended handshake, then advertise our own
            // ut_metadata sub-id and the full metadata size
            let _ = framed.next().await.unwrap().unwrap();
            let body = format!(
                "d1:md11:ut_metadatai{}ee13:metadata_sizei{}ee",
                remote_sub_id,
                blocks_for_peer.iter().map(|b| b.len()).sum::<usize>()
            );
            let mut payload = vec![0u8];
            payload.extend_from_slice(body.as_bytes());
            framed
                .send(RawMessage::new(MSG_EXTENDED, payload))
                .await
                .unwrap();

            // the requester always asks for blocks in ascending order
            for (i, block) in blocks_for_peer.iter().enumerate() {
                let _request = framed.next().await.unwrap().unwrap();
                let reply_body = format!("d8:msg_typei1e5:piecei{}ee", i);
                let mut payload = vec![local_sub_id];
                payload.extend_from_slice(reply_body.as_bytes());
                payload.extend_from_slice(block);
                framed
                    .send(RawMessage::new(MSG_EXTENDED, payload))
                    .await
                    .unwrap();
            }
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let client = PeerSession::new([0x88u8; 20], Duration::from_millis(500), 128);
        let assembled = client
            .fetch_metadata(socket, info_hash, local_sub_id)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(assembled, full);
    }
}
