//! Persistence, modeled as an external collaborator the rest of the crawler
//! only ever talks to through the [`Storage`] trait — the same way the
//! engine this crawler is descended from treats its disk-IO actor as a
//! handle rather than an inline call. SQL schema, migrations, and any real
//! backend are out of scope; [`MemoryStorage`] exists so the archiver (and
//! its tests) are fully exercised without one.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::torrent::PeerSource;
use crate::{PeerId, TorrentKey};

#[derive(Debug)]
pub enum Error {
    /// A real backend would report connection/transaction failures here;
    /// [`MemoryStorage`] never returns this.
    Backend(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(s) => write!(f, "storage backend error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One peer-wire visit, ready to be written or merged into its peer's
/// history.
#[derive(Debug, Clone)]
pub struct PeerObservation {
    /// `None` for a peer never persisted before.
    pub database_key: Option<u64>,
    pub torrent: TorrentKey,
    pub ip: IpAddr,
    pub port: u16,
    pub source: PeerSource,
    pub peer_id: PeerId,
    pub pieces_downloaded: usize,
    pub pieces_count: usize,
    pub observed_at: u64,
}

/// The result of persisting one observation.
#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub key: u64,
    /// Pieces gained per second since the previous visit, if this is not
    /// the first visit and time has actually elapsed. The backend keeps the
    /// maximum ever observed for the peer, not just the latest delta.
    pub pieces_per_second: Option<f64>,
}

/// One tracker announce(+scrape), for historical bookkeeping.
#[derive(Debug, Clone)]
pub struct TrackerRequestRecord {
    pub torrent: TorrentKey,
    pub announce_url: String,
    pub received_peers: usize,
    pub duplicate_peers: usize,
    pub request_duration_ms: u64,
    pub scrape_complete: Option<u64>,
    pub scrape_downloaded: Option<u64>,
    pub scrape_incomplete: Option<u64>,
}

/// One DHT `get_peers` round, for historical bookkeeping.
#[derive(Debug, Clone)]
pub struct DhtRequestRecord {
    pub torrent: TorrentKey,
    pub received_peers: usize,
    pub duplicate_peers: usize,
    pub request_duration_ms: u64,
}

/// Everything the archiver and requestors persist. A real implementation
/// would wrap a database connection pool and treat each method as its own
/// transaction, rolling back and letting the caller skip the peer on
/// failure — `MemoryStorage` has no such failure mode.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn record_peer_visit(&self, observation: PeerObservation) -> Result<PeerRecord>;
    async fn record_tracker_request(&self, record: TrackerRequestRecord) -> Result<()>;
    async fn record_dht_request(&self, record: DhtRequestRecord) -> Result<()>;
}

#[derive(Debug, Clone)]
struct PeerHistory {
    key: u64,
    last_pieces_downloaded: usize,
    last_observed_at: u64,
    max_pieces_per_second: f64,
}

/// An in-memory [`Storage`] keyed by `(ip, port, torrent)` for outbound
/// peers and `(ip, torrent)` for incoming ones — matching
/// [`crate::torrent::PeerKey`]'s identity rules.
#[derive(Default)]
pub struct MemoryStorage {
    peers: Mutex<HashMap<(IpAddr, u16, TorrentKey), PeerHistory>>,
    next_key: Mutex<u64>,
    tracker_requests: Mutex<Vec<TrackerRequestRecord>>,
    dht_requests: Mutex<Vec<DhtRequestRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity(observation: &PeerObservation) -> (IpAddr, u16, TorrentKey) {
        let port = match observation.source {
            PeerSource::Incoming => 0,
            PeerSource::Tracker | PeerSource::Dht => observation.port,
        };
        (observation.ip, port, observation.torrent)
    }

    fn allocate_key(&self) -> u64 {
        let mut next = self.next_key.lock().unwrap();
        let key = *next;
        *next += 1;
        key
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn record_peer_visit(&self, observation: PeerObservation) -> Result<PeerRecord> {
        let identity = Self::identity(&observation);
        let mut peers = self.peers.lock().unwrap();

        match peers.get_mut(&identity) {
            Some(history) => {
                let elapsed = observation
                    .observed_at
                    .saturating_sub(history.last_observed_at);
                let delta_pieces = observation
                    .pieces_downloaded
                    .saturating_sub(history.last_pieces_downloaded);
                if elapsed > 0 {
                    let rate = delta_pieces as f64 / elapsed as f64;
                    if rate > history.max_pieces_per_second {
                        history.max_pieces_per_second = rate;
                    }
                }
                history.last_pieces_downloaded = observation.pieces_downloaded;
                history.last_observed_at = observation.observed_at;
                Ok(PeerRecord {
                    key: history.key,
                    pieces_per_second: Some(history.max_pieces_per_second),
                })
            }
            None => {
                let key = observation.database_key.unwrap_or_else(|| self.allocate_key());
                peers.insert(
                    identity,
                    PeerHistory {
                        key,
                        last_pieces_downloaded: observation.pieces_downloaded,
                        last_observed_at: observation.observed_at,
                        max_pieces_per_second: 0.0,
                    },
                );
                Ok(PeerRecord {
                    key,
                    pieces_per_second: None,
                })
            }
        }
    }

    async fn record_tracker_request(&self, record: TrackerRequestRecord) -> Result<()> {
        self.tracker_requests.lock().unwrap().push(record);
        Ok(())
    }

    async fn record_dht_request(&self, record: DhtRequestRecord) -> Result<()> {
        self.dht_requests.lock().unwrap().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(pieces: usize, at: u64) -> PeerObservation {
        PeerObservation {
            database_key: None,
            torrent: 1,
            ip: "1.2.3.4".parse().unwrap(),
            port: 6881,
            source: PeerSource::Tracker,
            peer_id: [9u8; 20],
            pieces_downloaded: pieces,
            pieces_count: 100,
            observed_at: at,
        }
    }

    #[tokio::test]
    async fn first_visit_has_no_rate_and_assigns_a_key() {
        let storage = MemoryStorage::new();
        let record = storage.record_peer_visit(observation(0, 1000)).await.unwrap();
        assert!(record.pieces_per_second.is_none());
    }

    #[tokio::test]
    async fn second_visit_computes_rate_and_reuses_the_key() {
        let storage = MemoryStorage::new();
        let first = storage.record_peer_visit(observation(0, 1000)).await.unwrap();
        let second = storage
            .record_peer_visit(observation(10, 1010))
            .await
            .unwrap();
        assert_eq!(first.key, second.key);
        assert_eq!(second.pieces_per_second, Some(1.0));
    }

    #[tokio::test]
    async fn keeps_the_maximum_rate_ever_observed() {
        let storage = MemoryStorage::new();
        storage.record_peer_visit(observation(0, 1000)).await.unwrap();
        storage.record_peer_visit(observation(50, 1010)).await.unwrap();
        let third = storage.record_peer_visit(observation(55, 1020)).await.unwrap();
        // rate dropped on the third visit, but the max from the second sticks.
        assert_eq!(third.pieces_per_second, Some(5.0));
    }

    #[tokio::test]
    async fn incoming_peers_are_keyed_without_their_ephemeral_port() {
        let storage = MemoryStorage::new();
        let mut first = observation(0, 1000);
        first.source = PeerSource::Incoming;
        first.port = 51000;
        let a = storage.record_peer_visit(first).await.unwrap();

        let mut second = observation(5, 1005);
        second.source = PeerSource::Incoming;
        second.port = 51234;
        let b = storage.record_peer_visit(second).await.unwrap();

        assert_eq!(a.key, b.key);
    }
}
