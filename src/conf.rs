//! This module defines types used to configure the crawler and its parts.

use std::time::Duration;

use crate::PeerId;

/// The global configuration for the crawler and all its components.
#[derive(Clone, Debug)]
pub struct Conf {
    pub evaluation: EvaluationConf,
    pub network: NetworkConf,
    pub intervals: IntervalConf,
    pub listener: ListenerConf,
    pub dht: DhtConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            evaluation: EvaluationConf::default(),
            network: NetworkConf::default(),
            intervals: IntervalConf::default(),
            listener: ListenerConf::default(),
            dht: DhtConf::default(),
        }
    }
}

impl Conf {
    /// Returns the configuration with every documented default applied,
    /// generating a fresh random client id.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Configuration of the active-evaluation pool (C5).
#[derive(Clone, Debug)]
pub struct EvaluationConf {
    /// `peer_evaluation_threads` (default 64): size of the active-eval pool.
    pub peer_evaluation_threads: usize,
    /// `evaluator_reaction` (default 40s): worker poll interval on empty
    /// queue.
    pub evaluator_reaction: Duration,
    /// `peer_revisit_delay` (default 5 min): schedule delta for unfinished
    /// peers.
    pub peer_revisit_delay: Duration,
    /// `receive_message_max` (default 128): cap on messages per peer per
    /// visit.
    pub receive_message_max: usize,
    /// `torrent_complete_threshold` (default 0.98): fraction of pieces
    /// considered "done".
    pub torrent_complete_threshold: f64,
    /// `extension_ut_metadata_id` (default 4): local sub-id advertised to
    /// peers for BEP 9 metadata exchange.
    pub extension_ut_metadata_id: u8,
}

impl Default for EvaluationConf {
    fn default() -> Self {
        Self {
            peer_evaluation_threads: 64,
            evaluator_reaction: Duration::from_secs(40),
            peer_revisit_delay: Duration::from_secs(5 * 60),
            receive_message_max: 128,
            torrent_complete_threshold: 0.98,
            extension_ut_metadata_id: 4,
        }
    }
}

/// Network-level timeouts and identity.
#[derive(Clone, Debug)]
pub struct NetworkConf {
    /// `network_timeout` (default 6s): TCP/UDP socket read/connect timeout.
    pub network_timeout: Duration,
    /// The peer id this crawler announces to trackers and peers.
    pub client_id: PeerId,
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(6),
            client_id: crate::random_peer_id(),
        }
    }
}

/// Per-source polling intervals.
#[derive(Clone, Debug)]
pub struct IntervalConf {
    /// `tracker_request_interval` (default 13 min): per-torrent tracker
    /// poll period.
    pub tracker_request_interval: Duration,
    /// `dht_request_interval` (default 5 min): DHT poll period.
    pub dht_request_interval: Duration,
    /// `statistic_interval` (default 5 min): stats snapshot period.
    pub statistic_interval: Duration,
}

impl Default for IntervalConf {
    fn default() -> Self {
        Self {
            tracker_request_interval: Duration::from_secs(13 * 60),
            dht_request_interval: Duration::from_secs(5 * 60),
            statistic_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Configuration of the passive inbound listener.
#[derive(Clone, Debug)]
pub struct ListenerConf {
    /// `bittorrent_listen_port` (default 6881).
    pub bittorrent_listen_port: u16,
}

impl Default for ListenerConf {
    fn default() -> Self {
        Self {
            bittorrent_listen_port: 6881,
        }
    }
}

/// Configuration of the DHT control channel.
#[derive(Clone, Debug)]
pub struct DhtConf {
    /// `dht_node_port` (default 17000): advertised DHT UDP port.
    pub dht_node_port: u16,
    /// `dht_control_port` (default 17001): the telnet-control TCP port.
    pub dht_control_port: u16,
}

impl Default for DhtConf {
    fn default() -> Self {
        Self {
            dht_node_port: 17000,
            dht_control_port: 17001,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let conf = Conf::default();
        assert_eq!(conf.evaluation.peer_evaluation_threads, 64);
        assert_eq!(conf.network.network_timeout, Duration::from_secs(6));
        assert_eq!(
            conf.intervals.tracker_request_interval,
            Duration::from_secs(13 * 60)
        );
        assert_eq!(conf.intervals.dht_request_interval, Duration::from_secs(5 * 60));
        assert_eq!(conf.evaluation.peer_revisit_delay, Duration::from_secs(5 * 60));
        assert_eq!(conf.evaluation.receive_message_max, 128);
        assert_eq!(conf.listener.bittorrent_listen_port, 6881);
        assert_eq!(conf.dht.dht_node_port, 17000);
        assert_eq!(conf.dht.dht_control_port, 17001);
    }
}
