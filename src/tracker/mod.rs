//! The tracker client (C2): one object per torrent, bound to a single
//! announce URL, dispatching to the HTTP or UDP flow by scheme.

pub mod error;
pub mod http;
pub mod udp;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub use error::{Error, Result};

use crate::{PeerId, Sha1Hash};

/// Faked transfer stats declared to the tracker, in units of pieces
/// (treated as bytes-equivalents by the tracker; need not be truthful).
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams<'a> {
    pub info_hash: &'a Sha1Hash,
    pub peer_id: &'a PeerId,
    pub port: u16,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub is_first_announce: bool,
}

impl<'a> AnnounceParams<'a> {
    /// `downloaded = 1.0 * pieces`, `left = 0`, `uploaded = 0.42 * pieces`.
    pub fn new(
        info_hash: &'a Sha1Hash,
        peer_id: &'a PeerId,
        port: u16,
        pieces_count: usize,
        is_first_announce: bool,
    ) -> Self {
        Self {
            info_hash,
            peer_id,
            port,
            downloaded: pieces_count as u64,
            left: 0,
            uploaded: (pieces_count as f64 * 0.42) as u64,
            is_first_announce,
        }
    }
}

/// One completed announce, kept for later analysis: the wall-clock
/// duration of the request alongside what it returned.
#[derive(Debug, Clone)]
pub struct AnnounceRecord {
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
    pub request_duration: Duration,
}

/// One completed scrape, kept for later analysis.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeRecord {
    pub complete: u64,
    pub downloaded: u64,
    pub incomplete: u64,
    pub request_duration: Duration,
}

/// Bound to one announce URL; dispatches every request to the HTTP or UDP
/// flow depending on the URL's scheme.
pub struct TrackerClient {
    announce_url: String,
    parsed: url::Url,
    http: reqwest::Client,
    network_timeout: Duration,
}

impl TrackerClient {
    pub fn new(announce_url: String, network_timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(&announce_url)?;
        match parsed.scheme() {
            "http" | "https" | "udp" => {}
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }
        Ok(Self {
            announce_url,
            parsed,
            http: reqwest::Client::new(),
            network_timeout,
        })
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    pub async fn announce(&self, params: &AnnounceParams<'_>) -> Result<AnnounceRecord> {
        let start = Instant::now();
        let (interval, peers) = match self.parsed.scheme() {
            "http" | "https" => {
                http::announce(&self.http, &self.announce_url, params, self.network_timeout)
                    .await?
            }
            "udp" => udp::announce(&self.parsed, params, self.network_timeout).await?,
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };
        Ok(AnnounceRecord {
            interval: Duration::from_secs(interval),
            peers,
            request_duration: start.elapsed(),
        })
    }

    pub async fn scrape(&self, info_hash: &Sha1Hash) -> Result<ScrapeRecord> {
        let start = Instant::now();
        let record = match self.parsed.scheme() {
            "http" | "https" => {
                let stats =
                    http::scrape(&self.http, &self.announce_url, info_hash, self.network_timeout)
                        .await?;
                ScrapeRecord {
                    complete: stats.complete,
                    downloaded: stats.downloaded,
                    incomplete: stats.incomplete,
                    request_duration: start.elapsed(),
                }
            }
            "udp" => {
                let stats = udp::scrape(&self.parsed, info_hash, self.network_timeout).await?;
                ScrapeRecord {
                    complete: stats.seeders as u64,
                    downloaded: stats.completed as u64,
                    incomplete: stats.leechers as u64,
                    request_duration: start.elapsed(),
                }
            }
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme_at_construction() {
        let result = TrackerClient::new("ftp://tracker.example/announce".to_string(), Duration::from_secs(1));
        assert!(matches!(result, Err(Error::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[test]
    fn accepts_http_https_and_udp_schemes() {
        for url in [
            "http://tracker.example/announce",
            "https://tracker.example/announce",
            "udp://tracker.example:80/announce",
        ] {
            assert!(TrackerClient::new(url.to_string(), Duration::from_secs(1)).is_ok());
        }
    }

    #[test]
    fn announce_params_fakes_transfer_stats() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let params = AnnounceParams::new(&info_hash, &peer_id, 6881, 100, true);
        assert_eq!(params.downloaded, 100);
        assert_eq!(params.left, 0);
        assert_eq!(params.uploaded, 42);
    }
}
