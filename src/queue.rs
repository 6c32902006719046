//! The priority-set queue (C4): a deduplicating min-heap of scheduled peer
//! evaluations, ordered by revisit time.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use crate::torrent::{Peer, PeerKey};

/// Wraps a [`Peer`] for heap ordering: earliest `revisit` pops first.
#[derive(Debug, Clone)]
struct ScheduledPeer(Peer);

impl PartialEq for ScheduledPeer {
    fn eq(&self, other: &Self) -> bool {
        self.0.revisit == other.0.revisit
    }
}
impl Eq for ScheduledPeer {}

impl PartialOrd for ScheduledPeer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledPeer {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the *smallest* revisit
        // (earliest deadline) is popped first.
        other.0.revisit.cmp(&self.0.revisit)
    }
}

/// A deduplicating min-heap of scheduled peer evaluations, protected by a
/// single mutex.
///
/// The "seen-ever" set is an add-only membership filter: it is never
/// shrunk, so a peer that finished earlier is not re-queued by a tracker
/// retransmitting it. [`PrioritySetQueue::force_put`] bypasses the
/// dedup check entirely — it is how the archiver re-schedules a known
/// revisit.
#[derive(Default)]
pub struct PrioritySetQueue {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<ScheduledPeer>,
    seen_ever: HashSet<PeerKey>,
}

impl PrioritySetQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `peer` unless it is a duplicate.
    ///
    /// A peer with no `database_key` whose equality key is already in the
    /// seen-ever set is dropped and `false` is returned. Peers with a
    /// `database_key` (known revisits) always insert. Returns `true` iff
    /// the peer was pushed onto the heap.
    pub fn put(&self, peer: Peer) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if peer.database_key.is_none() {
            let key = peer.key();
            if !inner.seen_ever.insert(key) {
                return false;
            }
        }
        inner.heap.push(ScheduledPeer(peer));
        true
    }

    /// Inserts `peer` unconditionally, recording its key in the seen-ever
    /// set. Used when the archiver writes an unfinished peer back with a
    /// future revisit time.
    pub fn force_put(&self, peer: Peer) {
        let mut inner = self.inner.lock().unwrap();
        inner.seen_ever.insert(peer.key());
        inner.heap.push(ScheduledPeer(peer));
    }

    /// Pops the peer with the earliest revisit time, if any.
    pub fn get(&self) -> Option<Peer> {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.pop().map(|scheduled| scheduled.0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PeerSource;

    fn peer(ip: &str, port: u16, revisit: u64) -> Peer {
        let mut p = Peer::new(format!("{}:{}", ip, port).parse().unwrap(), PeerSource::Tracker, 1);
        p.revisit = revisit;
        p
    }

    #[test]
    fn pops_earliest_revisit_first() {
        let queue = PrioritySetQueue::new();
        queue.put(peer("1.1.1.1", 1, 50));
        queue.put(peer("2.2.2.2", 2, 10));
        queue.put(peer("3.3.3.3", 3, 30));

        assert_eq!(queue.get().unwrap().revisit, 10);
        assert_eq!(queue.get().unwrap().revisit, 30);
        assert_eq!(queue.get().unwrap().revisit, 50);
        assert!(queue.get().is_none());
    }

    #[test]
    fn duplicate_suppression_matches_scenario_5() {
        let queue = PrioritySetQueue::new();
        assert!(queue.put(peer("1.2.3.4", 6881, 0)));
        assert!(!queue.put(peer("1.2.3.4", 6881, 0)));

        let mut revisit = Peer::new("1.2.3.4:6881".parse().unwrap(), PeerSource::Tracker, 1);
        revisit.database_key = Some(7);
        queue.force_put(revisit.clone());
        queue.force_put(revisit.clone());
        queue.force_put(revisit);

        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn never_holds_two_outbound_entries_for_same_key_without_database_key() {
        let queue = PrioritySetQueue::new();
        assert!(queue.put(peer("9.9.9.9", 1, 0)));
        assert!(!queue.put(peer("9.9.9.9", 1, 5)));
        assert_eq!(queue.len(), 1);
    }
}
