//! The active-evaluation pool (C5): a fixed number of identical workers
//! that drain [`crate::queue::PrioritySetQueue`], dial candidate peers, and
//! run an outbound peer-wire session against each.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conf::{EvaluationConf, NetworkConf};
use crate::peer::{PeerSession, VisitResult};
use crate::torrent::{now_secs, Peer, TorrentTable};

/// How long a worker sleeps before re-trying a peer whose `revisit` is
/// still in the future. Short enough that the heap's earliest-deadline
/// peer isn't starved behind it for long.
const NOT_YET_DUE_BACKOFF: Duration = Duration::from_millis(500);

/// One successfully evaluated peer, destined for the archiver.
#[derive(Debug)]
pub struct VisitedRecord {
    pub peer: Peer,
    pub result: VisitResult,
    pub next_revisit: u64,
}

pub type VisitedSender = mpsc::UnboundedSender<VisitedRecord>;
pub type VisitedReceiver = mpsc::UnboundedReceiver<VisitedRecord>;

/// Cumulative, atomic counters surfaced to the statistics ticker. Dial and
/// session failures are not retried by the pool itself — the peer's source
/// will re-offer it — so only the counts survive past the failed attempt.
#[derive(Default)]
pub struct PoolCounters {
    pub dial_failures_first_contact: AtomicU64,
    pub dial_failures_later_contact: AtomicU64,
    pub session_failures_first_contact: AtomicU64,
    pub session_failures_later_contact: AtomicU64,
    pub visits_succeeded: AtomicU64,
}

impl PoolCounters {
    fn record_dial_failure(&self, first_contact: bool) {
        let counter = if first_contact {
            &self.dial_failures_first_contact
        } else {
            &self.dial_failures_later_contact
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_session_failure(&self, first_contact: bool) {
        let counter = if first_contact {
            &self.session_failures_first_contact
        } else {
            &self.session_failures_later_contact
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A cheap per-worker "busy since" sample. Zero means idle; otherwise the
/// epoch-second the worker started its current dial-or-session attempt.
/// The statistics ticker averages `is_busy()` across every worker to report
/// pool utilisation.
#[derive(Default)]
pub struct ActivityTimer(AtomicU64);

impl ActivityTimer {
    fn mark_busy(&self) {
        self.0.store(now_secs(), Ordering::Relaxed);
    }

    fn mark_idle(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }
}

/// The fixed-size pool of active-evaluation workers.
pub struct Pool {
    activity: Vec<Arc<ActivityTimer>>,
    pub counters: Arc<PoolCounters>,
}

impl Pool {
    /// Spawns `conf.peer_evaluation_threads` workers, each dialing peers
    /// popped from `queue` and running an outbound session against
    /// `torrents`. Successful visits are pushed onto `visited_tx`; the
    /// returned join handles resolve once every worker observes `shutdown`.
    pub fn spawn(
        conf: &EvaluationConf,
        network: &NetworkConf,
        local_dht_port: u16,
        queue: Arc<crate::queue::PrioritySetQueue>,
        torrents: Arc<TorrentTable>,
        visited_tx: VisitedSender,
        shutdown: Arc<AtomicBool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let session = Arc::new(
            PeerSession::new(
                network.client_id,
                network.network_timeout,
                conf.receive_message_max,
            )
            .with_dht_port(local_dht_port),
        );

        let counters = Arc::new(PoolCounters::default());
        let mut activity = Vec::with_capacity(conf.peer_evaluation_threads);
        let mut handles = Vec::with_capacity(conf.peer_evaluation_threads);

        for worker_id in 0..conf.peer_evaluation_threads {
            let timer = Arc::new(ActivityTimer::default());
            activity.push(Arc::clone(&timer));

            let worker = Worker {
                id: worker_id,
                session: Arc::clone(&session),
                network_timeout: network.network_timeout,
                evaluator_reaction: conf.evaluator_reaction,
                peer_revisit_delay: conf.peer_revisit_delay,
                queue: Arc::clone(&queue),
                torrents: Arc::clone(&torrents),
                visited_tx: visited_tx.clone(),
                counters: Arc::clone(&counters),
                activity: timer,
                shutdown: Arc::clone(&shutdown),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        (Self { activity, counters }, handles)
    }

    /// Fraction of workers currently mid-dial or mid-session, in `[0, 1]`.
    pub fn activity_fraction(&self) -> f64 {
        if self.activity.is_empty() {
            return 0.0;
        }
        let busy = self.activity.iter().filter(|t| t.is_busy()).count();
        busy as f64 / self.activity.len() as f64
    }
}

struct Worker {
    id: usize,
    session: Arc<PeerSession>,
    network_timeout: Duration,
    evaluator_reaction: Duration,
    peer_revisit_delay: Duration,
    queue: Arc<crate::queue::PrioritySetQueue>,
    torrents: Arc<TorrentTable>,
    visited_tx: VisitedSender,
    counters: Arc<PoolCounters>,
    activity: Arc<ActivityTimer>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self) {
        log::debug!("evaluation worker {} starting", self.id);
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let peer = match self.queue.get() {
                Some(peer) => peer,
                None => {
                    crate::sleep_or_shutdown(self.evaluator_reaction, &self.shutdown).await;
                    continue;
                }
            };

            let now = now_secs();
            if peer.revisit > now {
                tokio::time::delay_for(NOT_YET_DUE_BACKOFF).await;
                self.queue.force_put(peer);
                continue;
            }

            self.activity.mark_busy();
            self.evaluate(peer).await;
            self.activity.mark_idle();
        }
        log::debug!("evaluation worker {} stopped", self.id);
    }

    /// Dials and evaluates one peer. Dial and session failures are logged,
    /// counted, and the peer dropped; only a successful visit reaches the
    /// archiver via the visited channel.
    async fn evaluate(&self, peer: Peer) {
        let first_contact = peer.database_key.is_none();
        let endpoint: SocketAddr = peer.endpoint;

        let stream = match tokio::time::timeout(self.network_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("dial {} failed: {}", endpoint, e);
                self.counters.record_dial_failure(first_contact);
                return;
            }
            Err(_elapsed) => {
                log::debug!("dial {} timed out", endpoint);
                self.counters.record_dial_failure(first_contact);
                return;
            }
        };

        let info_hash = match self.torrents.get(peer.torrent) {
            Some(torrent) => torrent.info_hash,
            None => {
                log::warn!("peer {} references unknown torrent {}", endpoint, peer.torrent);
                return;
            }
        };

        let result = match self.session.run_outbound(stream, info_hash).await {
            Ok(result) => result,
            Err(e) => {
                log::debug!("session with {} failed: {}", endpoint, e);
                self.counters.record_session_failure(first_contact);
                return;
            }
        };

        self.counters.visits_succeeded.fetch_add(1, Ordering::Relaxed);
        let next_revisit = now_secs() + self.peer_revisit_delay.as_secs();
        let record = VisitedRecord {
            peer,
            result,
            next_revisit,
        };
        if self.visited_tx.send(record).is_err() {
            log::debug!("visited channel closed, dropping result for {}", endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PeerSource;
    use tokio::net::TcpListener;

    fn test_conf() -> (EvaluationConf, NetworkConf) {
        let mut eval = EvaluationConf::default();
        eval.peer_evaluation_threads = 2;
        eval.evaluator_reaction = Duration::from_millis(20);
        eval.peer_revisit_delay = Duration::from_secs(300);
        let network = NetworkConf {
            network_timeout: Duration::from_millis(200),
            client_id: [0x11u8; 20],
        };
        (eval, network)
    }

    #[tokio::test]
    async fn successful_visit_reaches_visited_channel() {
        let info_hash = [0x22u8; 20];
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let remote_peer_id = [0x33u8; 20];
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let session = PeerSession::new(remote_peer_id, Duration::from_millis(200), 128);
            session.run_inbound(socket).await.unwrap()
        });

        let mut torrents = TorrentTable::new();
        let torrent_key = torrents
            .insert("test".into(), vec![], info_hash, 10, 1 << 14, 0.98)
            .unwrap();
        let torrents = Arc::new(torrents);

        let queue = Arc::new(crate::queue::PrioritySetQueue::new());
        queue.put(Peer::new(addr, PeerSource::Tracker, torrent_key));

        let (eval, network) = test_conf();
        let (visited_tx, mut visited_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (_pool, handles) = Pool::spawn(
            &eval,
            &network,
            6881,
            queue,
            torrents,
            visited_tx,
            Arc::clone(&shutdown),
        );

        let visited = tokio::time::timeout(Duration::from_secs(2), visited_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(visited.result.peer_id, remote_peer_id);
        assert!(visited.next_revisit > now_secs());

        server.await.unwrap();
        shutdown.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
    }

    #[tokio::test]
    async fn dial_failure_is_counted_and_peer_is_dropped() {
        // nothing listens on this port; connect fails fast.
        let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let mut torrents = TorrentTable::new();
        let torrent_key = torrents
            .insert("test".into(), vec![], [0x44u8; 20], 10, 1 << 14, 0.98)
            .unwrap();
        let torrents = Arc::new(torrents);

        let queue = Arc::new(crate::queue::PrioritySetQueue::new());
        queue.put(Peer::new(unreachable, PeerSource::Tracker, torrent_key));

        let (eval, network) = test_conf();
        let (visited_tx, mut visited_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (pool, handles) = Pool::spawn(
            &eval,
            &network,
            6881,
            queue,
            torrents,
            visited_tx,
            Arc::clone(&shutdown),
        );

        tokio::time::delay_for(Duration::from_millis(300)).await;
        assert!(visited_rx.try_recv().is_err());
        let total_failures = pool.counters.dial_failures_first_contact.load(Ordering::Relaxed)
            + pool.counters.dial_failures_later_contact.load(Ordering::Relaxed);
        assert!(total_failures >= 1);

        shutdown.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
    }
}
