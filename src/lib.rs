//! `swarmwatch` is a continuously running BitTorrent swarm crawler.
//!
//! Given a set of torrents it discovers peers from three independent
//! sources — HTTP/UDP trackers, a DHT node reached over a line-oriented
//! control channel, and a passive inbound listener — connects to each peer
//! using the BitTorrent peer-wire protocol, learns what fraction of the
//! torrent the peer already holds, and persists repeated observations so
//! download progress per peer can be reconstructed offline.
//!
//! Six long-lived components cooperate through three in-memory channels:
//!
//! | Component | Responsibility |
//! |-----------|----------------|
//! | [`peer`] session | one connected peer: handshake, framed I/O, extension negotiation, bitfield reconstruction |
//! | [`tracker`] client | HTTP(S) and UDP announce + scrape |
//! | [`dht`] connector | line-oriented client to an external DHT node |
//! | [`queue`] | deduplicating min-heap of scheduled evaluations |
//! | [`pool`] | fixed-size workers that dial peers and run sessions |
//! | [`coordinator`] | owns all torrents, spawns/joins components, archives results |
//!
//! This crate does not download piece data, verify block hashes, seed, or
//! participate as a DHT node: it only observes swarms.

// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
pub mod coordinator;
pub mod dht;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod storage;
pub mod torrent;
pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::{BitVec, Msb0};

/// Each torrent gets a monotonic integer key, assigned on first persistence.
pub type TorrentKey = u64;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long. Used as the info hash, the swarm
/// identifier.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean the peer has pieces 0, 1, and 7).
pub type Bitfield = BitVec<Msb0, u8>;

/// Builds an empty bitfield sized to hold exactly `pieces_count` bits.
pub fn empty_bitfield(pieces_count: usize) -> Bitfield {
    let mut bitfield = BitVec::with_capacity(pieces_count);
    bitfield.resize(pieces_count, false);
    bitfield
}

/// The prefix of the peer id this crawler announces to trackers and peers.
pub const CLIENT_ID_PREFIX: &[u8; 8] = b"-SW0001-";

/// Generates a random 20 byte peer id with [`CLIENT_ID_PREFIX`].
pub fn random_peer_id() -> PeerId {
    use rand::Rng;
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// Sleeps in short increments so a shutdown request is observed well before
/// `duration` elapses, without requiring a notification primitive. Shared by
/// every long-lived poll loop (the tracker/DHT requestors, the stats ticker,
/// and the evaluation pool's empty-queue wait).
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &Arc<AtomicBool>) {
    const POLL: Duration = Duration::from_millis(200);
    let mut remaining = duration;
    while remaining > Duration::from_millis(0) {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let step = remaining.min(POLL);
        tokio::time::delay_for(step).await;
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bitfield_has_exact_len() {
        let bf = empty_bitfield(10);
        assert_eq!(bf.len(), 10);
        assert!(!bf.any());
    }

    #[test]
    fn random_peer_id_has_prefix() {
        let id = random_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
    }
}
