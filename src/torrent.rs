//! The swarm-crawler's core data model: torrents and the peers discovered
//! for them.
//!
//! A [`Torrent`] is a canonical, immutable-after-import descriptor of one
//! swarm. A [`Peer`] is one evaluation target produced by a discovery
//! source and mutated only by the archiver (see [`crate::coordinator`]).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{PeerId, Sha1Hash, TorrentKey};

/// Canonical descriptor for a swarm. Created at import, never mutated
/// afterwards, destroyed at shutdown.
#[derive(Clone, Debug)]
pub struct Torrent {
    /// Monotonic key assigned when the torrent is persisted.
    pub key: TorrentKey,
    /// Display name.
    pub name: String,
    /// Announce URLs, in priority order. May be empty for DHT-only swarms.
    pub announce_urls: Vec<String>,
    /// 20 byte SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// Number of pieces in the torrent. Always >= 1.
    pub pieces_count: usize,
    /// Size of a single piece, in bytes. Always > 0.
    pub piece_size: u64,
    /// Number of pieces a peer must hold to be considered done:
    /// `ceil(0.98 * pieces_count)`.
    pub complete_threshold: usize,
}

impl Torrent {
    /// Builds a new torrent descriptor, computing `complete_threshold` once
    /// up front so later checks are a cheap comparison. `complete_threshold_fraction`
    /// is the configured `torrent_complete_threshold` (see [`crate::conf::EvaluationConf`]).
    pub fn new(
        key: TorrentKey,
        name: String,
        announce_urls: Vec<String>,
        info_hash: Sha1Hash,
        pieces_count: usize,
        piece_size: u64,
        complete_threshold_fraction: f64,
    ) -> Self {
        debug_assert!(pieces_count >= 1);
        debug_assert!(piece_size > 0);
        let complete_threshold = complete_threshold(pieces_count, complete_threshold_fraction);
        Self {
            key,
            name,
            announce_urls,
            info_hash,
            pieces_count,
            piece_size,
            complete_threshold,
        }
    }

    /// Returns the info hash in its lowercase hex form.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// `ceil(fraction * pieces_count)`, always at least 1.
pub fn complete_threshold(pieces_count: usize, fraction: f64) -> usize {
    let threshold = (pieces_count as f64 * fraction).ceil() as usize;
    threshold.max(1)
}

/// A read-mostly table of all imported torrents, built before workers start.
///
/// Rejects a second torrent with an info hash already present: this mirrors
/// spec's "refuse startup if two imported torrents collide on info hash."
#[derive(Debug, Default)]
pub struct TorrentTable {
    by_key: HashMap<TorrentKey, Torrent>,
    by_info_hash: HashMap<Sha1Hash, TorrentKey>,
    next_key: TorrentKey,
}

/// Error returned when importing a torrent whose info hash is already
/// present in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateInfoHash(pub Sha1Hash);

impl TorrentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new torrent, assigning it the next monotonic key.
    ///
    /// Returns the assigned key, or `Err` if a torrent with the same info
    /// hash is already present.
    pub fn insert(
        &mut self,
        name: String,
        announce_urls: Vec<String>,
        info_hash: Sha1Hash,
        pieces_count: usize,
        piece_size: u64,
        complete_threshold_fraction: f64,
    ) -> Result<TorrentKey, DuplicateInfoHash> {
        if self.by_info_hash.contains_key(&info_hash) {
            return Err(DuplicateInfoHash(info_hash));
        }
        let key = self.next_key;
        self.next_key += 1;
        let torrent = Torrent::new(
            key,
            name,
            announce_urls,
            info_hash,
            pieces_count,
            piece_size,
            complete_threshold_fraction,
        );
        self.by_info_hash.insert(info_hash, key);
        self.by_key.insert(key, torrent);
        Ok(key)
    }

    pub fn get(&self, key: TorrentKey) -> Option<&Torrent> {
        self.by_key.get(&key)
    }

    pub fn get_by_info_hash(&self, info_hash: &Sha1Hash) -> Option<&Torrent> {
        self.by_info_hash
            .get(info_hash)
            .and_then(|key| self.by_key.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Torrent> {
        self.by_key.values()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Where a candidate peer was discovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Incoming,
    Dht,
}

/// The equality key used for deduplication in [`crate::queue::PrioritySetQueue`].
///
/// Tracker and DHT peers are keyed by `(ip, port, torrent)`. Incoming peers
/// use an ephemeral source port, so they are keyed by `(ip, torrent)` only
/// (with port fixed at 0) — used solely to join reconnections to the same
/// database record, never to dedup within the queue (incoming peers never
/// re-enter it).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub ip: IpAddr,
    pub port: u16,
    pub torrent: TorrentKey,
}

impl PeerKey {
    pub fn for_outbound(ip: IpAddr, port: u16, torrent: TorrentKey) -> Self {
        Self { ip, port, torrent }
    }

    /// The identity used to join repeated inbound connections from the same
    /// host to one persisted record. The ephemeral source port is excluded.
    pub fn for_incoming(ip: IpAddr, torrent: TorrentKey) -> Self {
        Self {
            ip,
            port: 0,
            torrent,
        }
    }
}

/// One evaluation target: a peer endpoint to dial (or that dialled us) for
/// a specific torrent.
#[derive(Clone, Debug)]
pub struct Peer {
    pub endpoint: SocketAddr,
    pub source: PeerSource,
    pub torrent: TorrentKey,
    /// Monotonic deadline (seconds since epoch); 0 means ready now.
    pub revisit: u64,
    /// Present iff the peer has been persisted at least once.
    pub database_key: Option<u64>,
    pub last_peer_id: Option<PeerId>,
    pub last_pieces_downloaded: Option<usize>,
}

impl Peer {
    pub fn new(endpoint: SocketAddr, source: PeerSource, torrent: TorrentKey) -> Self {
        Self {
            endpoint,
            source,
            torrent,
            revisit: 0,
            database_key: None,
            last_peer_id: None,
            last_pieces_downloaded: None,
        }
    }

    /// The deduplication key for this peer, per its source.
    pub fn key(&self) -> PeerKey {
        match self.source {
            PeerSource::Incoming => PeerKey::for_incoming(self.endpoint.ip(), self.torrent),
            PeerSource::Tracker | PeerSource::Dht => {
                PeerKey::for_outbound(self.endpoint.ip(), self.endpoint.port(), self.torrent)
            }
        }
    }

    pub fn is_ready(&self, now: u64) -> bool {
        self.revisit <= now
    }
}

/// The current time as seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_threshold_rounds_up() {
        assert_eq!(complete_threshold(100, 0.98), 98);
        assert_eq!(complete_threshold(1, 0.98), 1);
        assert_eq!(complete_threshold(10, 0.98), 10);
        assert_eq!(complete_threshold(51, 0.98), 50);
    }

    #[test]
    fn complete_threshold_honours_a_custom_fraction() {
        assert_eq!(complete_threshold(100, 0.5), 50);
    }

    #[test]
    fn duplicate_info_hash_is_rejected() {
        let mut table = TorrentTable::new();
        let hash = [7u8; 20];
        table
            .insert("a".into(), vec![], hash, 10, 1 << 14, 0.98)
            .unwrap();
        let err = table
            .insert("b".into(), vec![], hash, 20, 1 << 14, 0.98)
            .unwrap_err();
        assert_eq!(err, DuplicateInfoHash(hash));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn incoming_peer_key_ignores_port() {
        let a = PeerKey::for_incoming("1.2.3.4".parse().unwrap(), 1);
        let b = PeerKey {
            ip: "1.2.3.4".parse().unwrap(),
            port: 0,
            torrent: 1,
        };
        assert_eq!(a, b);
    }
}
