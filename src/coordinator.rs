//! The swarm coordinator (C6): owns the torrent table, the queue, the
//! visited channel and the shutdown signal, and spawns every other
//! long-running component.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conf::Conf;
use crate::dht::DhtConnector;
use crate::magnet::MagnetLink;
use crate::metainfo::Metainfo;
use crate::peer::PeerSession;
use crate::pool::{Pool, VisitedReceiver, VisitedRecord, VisitedSender};
use crate::queue::PrioritySetQueue;
use crate::stats::Stats;
use crate::storage::{DhtRequestRecord, PeerObservation, Storage, TrackerRequestRecord};
use crate::torrent::{now_secs, Peer, PeerKey, PeerSource, Torrent, TorrentTable};
use crate::tracker::{AnnounceParams, TrackerClient};
use crate::{sleep_or_shutdown, Sha1Hash};

/// The only two conditions that abort the whole crawler, per the error
/// taxonomy's propagation rule: everything else is locally recovered.
#[derive(Debug)]
pub enum CoordinatorError {
    NoTorrents,
    DuplicateInfoHash(Sha1Hash),
    Io(std::io::Error),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTorrents => write!(f, "no torrents were imported, nothing to crawl"),
            Self::DuplicateInfoHash(hash) => {
                write!(f, "duplicate info hash at import: {}", hex::encode(hash))
            }
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<std::io::Error> for CoordinatorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Reads every `*.torrent` file in `dir` and inserts it into `torrents`.
/// Malformed files are logged and skipped; a second torrent with an info
/// hash already present is fatal, matching "refuse startup if two imported
/// torrents collide on info hash."
pub fn import_torrent_dir(
    dir: &Path,
    torrents: &mut TorrentTable,
    complete_threshold_fraction: f64,
) -> Result<usize, CoordinatorError> {
    let mut imported = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("torrent") {
            continue;
        }
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        let metainfo = match Metainfo::from_bytes(&bytes) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("failed to decode {}: {}", path.display(), e);
                continue;
            }
        };
        let info_hash = match metainfo.info_hash() {
            Ok(h) => h,
            Err(e) => {
                log::warn!("failed to hash {}: {}", path.display(), e);
                continue;
            }
        };
        let pieces_count = metainfo.pieces_count();
        match torrents.insert(
            metainfo.info.name.clone(),
            metainfo.announce_urls(),
            info_hash,
            pieces_count,
            metainfo.info.piece_length,
            complete_threshold_fraction,
        ) {
            Ok(_) => imported += 1,
            Err(_) => return Err(CoordinatorError::DuplicateInfoHash(info_hash)),
        }
    }
    Ok(imported)
}

/// Resolves every magnet line in `path` to a full torrent via the DHT and
/// the `ut_metadata` fetch (§4.1), inserting each into `torrents`.
pub async fn import_magnet_file(
    path: &Path,
    torrents: &mut TorrentTable,
    dht: &DhtConnector,
    session: &PeerSession,
    local_sub_id: u8,
    bt_port: u16,
    complete_threshold_fraction: f64,
) -> Result<usize, CoordinatorError> {
    let text = fs::read_to_string(path)?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut imported = 0;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let magnet = match MagnetLink::parse(line) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("skipping malformed magnet line: {}", e);
                continue;
            }
        };

        let peers = match dht
            .get_peers(&hex::encode(magnet.info_hash), bt_port, &shutdown)
            .await
        {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("dht lookup for magnet {} failed: {}", hex::encode(magnet.info_hash), e);
                continue;
            }
        };

        let mut resolved = None;
        for (ip, port) in peers {
            let endpoint = std::net::SocketAddr::new(ip, port);
            let stream = match tokio::time::timeout(Duration::from_secs(6), TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => stream,
                _ => continue,
            };
            match session.fetch_metadata(stream, magnet.info_hash, local_sub_id).await {
                Ok(bytes) => {
                    resolved = Some(bytes);
                    break;
                }
                Err(e) => {
                    log::debug!("metadata fetch from {} failed: {}", endpoint, e);
                }
            }
        }

        let info_bytes = match resolved {
            Some(bytes) => bytes,
            None => {
                log::warn!("no peer served metadata for magnet {}", hex::encode(magnet.info_hash));
                continue;
            }
        };
        let info: crate::metainfo::Info = match serde_bencode::from_bytes(&info_bytes) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("failed to decode resolved metadata: {}", e);
                continue;
            }
        };
        let pieces_count = info.pieces.len() / 20;
        let mut announce_urls = magnet.announce_urls.clone();
        announce_urls.dedup();

        match torrents.insert(
            info.name.clone(),
            announce_urls,
            magnet.info_hash,
            pieces_count,
            info.piece_length,
            complete_threshold_fraction,
        ) {
            Ok(_) => imported += 1,
            Err(_) => return Err(CoordinatorError::DuplicateInfoHash(magnet.info_hash)),
        }
    }
    Ok(imported)
}

/// The identity the archiver uses to join a repeated inbound connection to
/// its existing persisted record. Archiver-owned; never touched by workers.
type IncomingIdentityMap = Mutex<HashMap<(IpAddr, crate::TorrentKey), u64>>;

/// Owns every long-running task and the shared state they coordinate
/// through.
pub struct Coordinator {
    conf: Conf,
    torrents: Arc<TorrentTable>,
    queue: Arc<PrioritySetQueue>,
    storage: Arc<dyn Storage>,
    stats: Arc<Stats>,
    dht: Option<Arc<DhtConnector>>,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        conf: Conf,
        torrents: TorrentTable,
        storage: Arc<dyn Storage>,
        dht: Option<DhtConnector>,
    ) -> Result<Self, CoordinatorError> {
        if torrents.is_empty() {
            return Err(CoordinatorError::NoTorrents);
        }
        Ok(Self {
            conf,
            torrents: Arc::new(torrents),
            queue: Arc::new(PrioritySetQueue::new()),
            storage,
            stats: Arc::new(Stats::new()),
            dht: dht.map(Arc::new),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A shared handle callers use to request shutdown (e.g. from a
    /// Ctrl-C handler).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Spawns every component and runs until `shutdown_handle()` is set,
    /// then joins everything in the order the spec requires: DHT requestor,
    /// active pool, tracker requestors, passive listener, archiver drain,
    /// stats ticker.
    pub async fn run(self) -> Result<(), CoordinatorError> {
        let (visited_tx, visited_rx): (VisitedSender, VisitedReceiver) = mpsc::unbounded_channel();

        let dht_handle = self.dht.clone().map(|dht| {
            spawn_dht_requestor(
                dht,
                Arc::clone(&self.torrents),
                Arc::clone(&self.queue),
                Arc::clone(&self.storage),
                Arc::clone(&self.stats),
                self.conf.listener.bittorrent_listen_port,
                self.conf.intervals.dht_request_interval,
                Arc::clone(&self.shutdown),
            )
        });

        let local_dht_port = self.conf.dht.dht_node_port;
        let (pool, pool_handles) = Pool::spawn(
            &self.conf.evaluation,
            &self.conf.network,
            local_dht_port,
            Arc::clone(&self.queue),
            Arc::clone(&self.torrents),
            visited_tx.clone(),
            Arc::clone(&self.shutdown),
        );

        let mut tracker_handles = Vec::new();
        for torrent in self.torrents.iter() {
            if torrent.announce_urls.is_empty() {
                continue;
            }
            tracker_handles.push(spawn_tracker_requestor(
                torrent.clone(),
                Arc::clone(&self.queue),
                Arc::clone(&self.storage),
                Arc::clone(&self.stats),
                self.conf.network.client_id,
                self.conf.listener.bittorrent_listen_port,
                self.conf.network.network_timeout,
                self.conf.intervals.tracker_request_interval,
                Arc::clone(&self.shutdown),
            ));
        }

        let listener_handle = spawn_listener(
            self.conf.listener.bittorrent_listen_port,
            self.conf.network.client_id,
            self.conf.network.network_timeout,
            self.conf.evaluation.receive_message_max,
            Arc::clone(&self.torrents),
            visited_tx,
            Arc::clone(&self.shutdown),
        )
        .await?;

        let identity_map: Arc<IncomingIdentityMap> = Arc::new(Mutex::new(HashMap::new()));
        let archiver_handle = spawn_archiver(
            visited_rx,
            Arc::clone(&self.torrents),
            Arc::clone(&self.queue),
            Arc::clone(&self.storage),
            Arc::clone(&self.stats),
            Arc::clone(&identity_map),
        );

        let pool = Arc::new(pool);
        let stats_handle = spawn_stats_ticker(
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            Arc::clone(&identity_map),
            Arc::clone(&pool),
            self.conf.intervals.statistic_interval,
            Arc::clone(&self.shutdown),
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::delay_for(Duration::from_millis(200)).await;
        }

        if let Some(handle) = dht_handle {
            let _ = handle.await;
        }
        for handle in pool_handles {
            let _ = handle.await;
        }
        for handle in tracker_handles {
            let _ = handle.await;
        }
        let _ = listener_handle.await;
        let _ = archiver_handle.await;
        let _ = stats_handle.await;

        if let Some(dht) = &self.dht {
            if let Err(e) = dht.close(true).await {
                log::warn!("failed to close dht control channel: {}", e);
            }
        }

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_dht_requestor(
    dht: Arc<DhtConnector>,
    torrents: Arc<TorrentTable>,
    queue: Arc<PrioritySetQueue>,
    storage: Arc<dyn Storage>,
    stats: Arc<Stats>,
    bt_port: u16,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !shutdown.load(Ordering::Relaxed) {
            for torrent in torrents.iter() {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let start = std::time::Instant::now();
                let info_hash_hex = torrent.info_hash_hex();
                match dht.get_peers(&info_hash_hex, bt_port, &shutdown).await {
                    Ok(peers) => {
                        let mut duplicates = 0;
                        for (ip, port) in &peers {
                            let endpoint = std::net::SocketAddr::new(*ip, *port);
                            let peer = Peer::new(endpoint, PeerSource::Dht, torrent.key);
                            if !queue.put(peer) {
                                duplicates += 1;
                            }
                        }
                        let record = DhtRequestRecord {
                            torrent: torrent.key,
                            received_peers: peers.len(),
                            duplicate_peers: duplicates,
                            request_duration_ms: start.elapsed().as_millis() as u64,
                        };
                        if let Err(e) = storage.record_dht_request(record).await {
                            log::warn!("failed to record dht request: {}", e);
                            stats.record_persistence_error();
                        }
                    }
                    Err(e) => {
                        log::warn!("dht get_peers for {} failed: {}", torrent.name, e);
                        stats.record_dht_error();
                    }
                }
            }
            sleep_or_shutdown(interval, &shutdown).await;
        }
        log::debug!("dht requestor stopped");
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_tracker_requestor(
    torrent: Torrent,
    queue: Arc<PrioritySetQueue>,
    storage: Arc<dyn Storage>,
    stats: Arc<Stats>,
    peer_id: crate::PeerId,
    bt_port: u16,
    network_timeout: Duration,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut is_first_announce = true;
        while !shutdown.load(Ordering::Relaxed) {
            for (i, announce_url) in torrent.announce_urls.iter().enumerate() {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let client = match TrackerClient::new(announce_url.clone(), network_timeout) {
                    Ok(client) => client,
                    Err(e) => {
                        log::warn!("tracker {} unusable: {}", announce_url, e);
                        stats.record_tracker_error();
                        continue;
                    }
                };

                let mut scrape_triple = (None, None, None);
                if i == 0 {
                    match client.scrape(&torrent.info_hash).await {
                        Ok(record) => {
                            scrape_triple = (
                                Some(record.complete),
                                Some(record.downloaded),
                                Some(record.incomplete),
                            );
                        }
                        Err(e) => log::debug!("scrape against {} failed: {}", announce_url, e),
                    }
                }

                let params = AnnounceParams::new(
                    &torrent.info_hash,
                    &peer_id,
                    bt_port,
                    torrent.pieces_count,
                    is_first_announce,
                );
                match client.announce(&params).await {
                    Ok(record) => {
                        let mut duplicates = 0;
                        for endpoint in &record.peers {
                            let peer = Peer::new(*endpoint, PeerSource::Tracker, torrent.key);
                            if !queue.put(peer) {
                                duplicates += 1;
                            }
                        }
                        if record.interval < interval {
                            log::info!(
                                "tracker {} requested a shorter interval ({:?}) than configured ({:?})",
                                announce_url,
                                record.interval,
                                interval
                            );
                        }
                        let tracker_record = TrackerRequestRecord {
                            torrent: torrent.key,
                            announce_url: announce_url.clone(),
                            received_peers: record.peers.len(),
                            duplicate_peers: duplicates,
                            request_duration_ms: record.request_duration.as_millis() as u64,
                            scrape_complete: scrape_triple.0,
                            scrape_downloaded: scrape_triple.1,
                            scrape_incomplete: scrape_triple.2,
                        };
                        if let Err(e) = storage.record_tracker_request(tracker_record).await {
                            log::warn!("failed to record tracker request: {}", e);
                            stats.record_persistence_error();
                        }
                    }
                    Err(e) => {
                        log::warn!("announce to {} failed: {}", announce_url, e);
                        stats.record_tracker_error();
                    }
                }
            }
            is_first_announce = false;
            sleep_or_shutdown(interval, &shutdown).await;
        }
        log::debug!("tracker requestor for {} stopped", torrent.name);
    })
}

/// Binds the passive listener and spawns its accept loop. Bind failures are
/// surfaced to the caller since an unbindable listen port leaves the
/// crawler with no inbound source at all; the accept loop itself never
/// exits on a per-connection error.
async fn spawn_listener(
    port: u16,
    local_peer_id: crate::PeerId,
    network_timeout: Duration,
    receive_message_max: usize,
    torrents: Arc<TorrentTable>,
    visited_tx: VisitedSender,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, CoordinatorError> {
    let mut listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("passive listener bound to 0.0.0.0:{}", port);

    Ok(tokio::spawn(async move {
        let session = PeerSession::new(local_peer_id, network_timeout, receive_message_max);
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let (socket, peer_addr) = match tokio::time::timeout(Duration::from_millis(500), listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
                Err(_elapsed) => continue,
            };

            let session = session.clone();
            let torrents = Arc::clone(&torrents);
            let visited_tx = visited_tx.clone();
            tokio::spawn(async move {
                match session.run_inbound(socket).await {
                    Ok(result) => {
                        let torrent_key = match torrents.get_by_info_hash(&result.info_hash) {
                            Some(torrent) => torrent.key,
                            None => {
                                log::debug!("inbound {} referenced unknown info hash, dropping", peer_addr);
                                return;
                            }
                        };
                        let peer = Peer::new(peer_addr, PeerSource::Incoming, torrent_key);
                        let record = VisitedRecord {
                            peer,
                            result,
                            next_revisit: 0,
                        };
                        if visited_tx.send(record).is_err() {
                            log::debug!("visited channel closed, dropping inbound result from {}", peer_addr);
                        }
                    }
                    Err(e) => log::debug!("inbound session with {} failed: {}", peer_addr, e),
                }
            });
        }
        log::debug!("passive listener stopped");
    }))
}

fn spawn_archiver(
    mut visited_rx: VisitedReceiver,
    torrents: Arc<TorrentTable>,
    queue: Arc<PrioritySetQueue>,
    storage: Arc<dyn Storage>,
    stats: Arc<Stats>,
    identity_map: Arc<IncomingIdentityMap>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(visited) = visited_rx.recv().await {
            let torrent = match torrents.get(visited.peer.torrent) {
                Some(t) => t,
                None => continue,
            };
            let pieces_downloaded = visited.result.pieces_downloaded(torrent.pieces_count);

            let database_key = match visited.peer.source {
                PeerSource::Incoming => {
                    let identity = (visited.peer.endpoint.ip(), visited.peer.torrent);
                    identity_map.lock().unwrap().get(&identity).copied()
                }
                PeerSource::Tracker | PeerSource::Dht => visited.peer.database_key,
            };

            let is_duplicate_incoming =
                visited.peer.source == PeerSource::Incoming && database_key.is_some();

            let observation = PeerObservation {
                database_key,
                torrent: visited.peer.torrent,
                ip: visited.peer.endpoint.ip(),
                port: visited.peer.endpoint.port(),
                source: visited.peer.source,
                peer_id: visited.result.peer_id,
                pieces_downloaded,
                pieces_count: torrent.pieces_count,
                observed_at: now_secs(),
            };

            match storage.record_peer_visit(observation).await {
                Ok(record) => {
                    if visited.peer.source == PeerSource::Incoming {
                        let identity = (visited.peer.endpoint.ip(), visited.peer.torrent);
                        identity_map.lock().unwrap().insert(identity, record.key);
                        stats.record_incoming(visited.peer.torrent, is_duplicate_incoming);
                    } else if pieces_downloaded < torrent.complete_threshold {
                        let mut next_peer = visited.peer;
                        next_peer.database_key = Some(record.key);
                        next_peer.revisit = visited.next_revisit;
                        next_peer.last_peer_id = Some(visited.result.peer_id);
                        next_peer.last_pieces_downloaded = Some(pieces_downloaded);
                        queue.force_put(next_peer);
                    }
                }
                Err(e) => {
                    log::warn!("failed to persist visit: {}", e);
                    stats.record_persistence_error();
                }
            }
        }
        log::debug!("archiver stopped (visited channel closed)");
    })
}

fn spawn_stats_ticker(
    queue: Arc<PrioritySetQueue>,
    stats: Arc<Stats>,
    identity_map: Arc<IncomingIdentityMap>,
    pool: Arc<Pool>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !shutdown.load(Ordering::Relaxed) {
            sleep_or_shutdown(interval, &shutdown).await;
            let unique_incoming = identity_map.lock().unwrap().len();
            let snapshot = stats.snapshot(queue.len(), unique_incoming, pool.activity_fraction());
            snapshot.log();
        }
        log::debug!("stats ticker stopped");
    })
}
