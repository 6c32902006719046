//! Crawler-wide statistics: cheap atomics updated by producers and workers,
//! snapshotted periodically by the coordinator's statistics ticker. Mirrors
//! the periodic summary `original_source/analyzer.py` logs, generalized
//! from a single-process counter dump to per-torrent breakdowns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::TorrentKey;

/// Per-torrent counters the archiver updates as incoming connections
/// arrive.
#[derive(Default)]
struct TorrentCounters {
    incoming_total: u64,
    incoming_duplicates: u64,
}

/// Cumulative, crate-wide counters. Cheap to update from any task; expensive
/// fields (queue length, pool activity) are sampled directly from their
/// owners at snapshot time instead of mirrored here.
#[derive(Default)]
pub struct Stats {
    tracker_errors: AtomicU64,
    dht_errors: AtomicU64,
    persistence_errors: AtomicU64,
    per_torrent: Mutex<HashMap<TorrentKey, TorrentCounters>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tracker_error(&self) {
        self.tracker_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dht_error(&self) {
        self.dht_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_error(&self) {
        self.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one incoming connection for `torrent`, `is_duplicate` when
    /// the archiver's identity map already had an entry for that peer.
    pub fn record_incoming(&self, torrent: TorrentKey, is_duplicate: bool) {
        let mut per_torrent = self.per_torrent.lock().unwrap();
        let counters = per_torrent.entry(torrent).or_default();
        counters.incoming_total += 1;
        if is_duplicate {
            counters.incoming_duplicates += 1;
        }
    }

    /// A point-in-time snapshot, combining this struct's own counters with
    /// figures sampled from the queue, the pool, and the archiver's
    /// identity-map size (all owned elsewhere, so passed in).
    pub fn snapshot(&self, queue_len: usize, unique_incoming: usize, worker_activity: f64) -> Snapshot {
        let per_torrent = self
            .per_torrent
            .lock()
            .unwrap()
            .iter()
            .map(|(&torrent, counters)| {
                (
                    torrent,
                    PerTorrentSnapshot {
                        incoming_total: counters.incoming_total,
                        incoming_duplicates: counters.incoming_duplicates,
                    },
                )
            })
            .collect();

        Snapshot {
            queue_len,
            unique_incoming,
            worker_activity,
            tracker_errors: self.tracker_errors.load(Ordering::Relaxed),
            dht_errors: self.dht_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            per_torrent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PerTorrentSnapshot {
    pub incoming_total: u64,
    pub incoming_duplicates: u64,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub queue_len: usize,
    pub unique_incoming: usize,
    pub worker_activity: f64,
    pub tracker_errors: u64,
    pub dht_errors: u64,
    pub persistence_errors: u64,
    pub per_torrent: HashMap<TorrentKey, PerTorrentSnapshot>,
}

impl Snapshot {
    /// Logs this snapshot at `info`, one line per torrent plus a summary
    /// line, matching the density of a periodic console report.
    pub fn log(&self) {
        log::info!(
            "stats: queue={} unique_incoming={} worker_activity={:.0}% tracker_errors={} dht_errors={} persistence_errors={}",
            self.queue_len,
            self.unique_incoming,
            self.worker_activity * 100.0,
            self.tracker_errors,
            self.dht_errors,
            self.persistence_errors,
        );
        for (torrent, counters) in &self.per_torrent {
            log::info!(
                "stats: torrent={} incoming_total={} incoming_duplicates={}",
                torrent,
                counters.incoming_total,
                counters.incoming_duplicates,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_incoming_and_errors() {
        let stats = Stats::new();
        stats.record_incoming(1, false);
        stats.record_incoming(1, true);
        stats.record_tracker_error();
        stats.record_dht_error();
        stats.record_dht_error();

        let snapshot = stats.snapshot(5, 1, 0.5);
        assert_eq!(snapshot.queue_len, 5);
        assert_eq!(snapshot.tracker_errors, 1);
        assert_eq!(snapshot.dht_errors, 2);
        let per_torrent = snapshot.per_torrent.get(&1).unwrap();
        assert_eq!(per_torrent.incoming_total, 2);
        assert_eq!(per_torrent.incoming_duplicates, 1);
    }
}
