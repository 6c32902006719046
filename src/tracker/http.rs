//! HTTP(S) announce and scrape, per the original BitTorrent tracker
//! protocol (not UDP, see [`super::udp`]).

use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde_bencode::value::Value;

use super::error::{Error, Result};
use super::AnnounceParams;

/// Bytes that must be percent-escaped in a tracker query parameter: every
/// byte that isn't `A-Za-z0-9.-_~` is reserved, mirroring the escaping most
/// trackers expect for raw 20-byte `info_hash`/`peer_id` values.
const TRACKER_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(0x7f);

fn escape(bytes: &[u8]) -> String {
    percent_encode(bytes, TRACKER_ESCAPE).to_string()
}

/// Issues an HTTP(S) announce request and returns `(interval_secs, peers)`.
pub async fn announce(
    client: &reqwest::Client,
    announce_url: &str,
    params: &AnnounceParams<'_>,
    timeout: Duration,
) -> Result<(u64, Vec<SocketAddr>)> {
    let mut url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        announce_url,
        escape(params.info_hash),
        escape(params.peer_id),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if params.is_first_announce {
        url.push_str("&event=started");
    }

    let response = client.get(&url).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus(status.as_u16()));
    }
    let body = response.bytes().await?;
    decode_announce_response(&body)
}

/// Scrape statistics for one torrent: `(complete, downloaded, incomplete)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    pub complete: u64,
    pub downloaded: u64,
    pub incomplete: u64,
}

/// Issues an HTTP(S) scrape request by substituting the last `announce`
/// path component with `scrape`, per convention. Returns
/// [`Error::ScrapeUnsupported`] if the announce URL has no such component.
pub async fn scrape(
    client: &reqwest::Client,
    announce_url: &str,
    info_hash: &[u8; 20],
    timeout: Duration,
) -> Result<ScrapeStats> {
    let scrape_url = scrape_url_from_announce(announce_url)?;
    let url = format!("{}?info_hash={}", scrape_url, escape(info_hash));

    let response = client.get(&url).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus(status.as_u16()));
    }
    let body = response.bytes().await?;
    decode_scrape_response(&body, info_hash)
}

/// Replaces the last `announce` path component with `scrape`, the
/// widely-implemented (if fragile) convention from BEP 48's predecessor.
/// Whichever occurrence is replaced is the last one in the string, matching
/// every tracker implementation this convention was reverse-engineered
/// from; a URL with `announce` embedded earlier in its path keeps that
/// occurrence untouched.
fn scrape_url_from_announce(announce_url: &str) -> Result<String> {
    match announce_url.rfind("announce") {
        Some(idx) => {
            let mut scrape_url = announce_url.to_string();
            scrape_url.replace_range(idx..idx + "announce".len(), "scrape");
            Ok(scrape_url)
        }
        None => Err(Error::ScrapeUnsupported),
    }
}

fn decode_announce_response(body: &[u8]) -> Result<(u64, Vec<SocketAddr>)> {
    let value: Value = serde_bencode::de::from_bytes(body)?;

    if let Some(Value::Bytes(reason)) = get_field(&value, b"failure reason")? {
        return Err(Error::Failure(String::from_utf8_lossy(reason).into_owned()));
    }

    let interval = match get_field(&value, b"interval")? {
        Some(Value::Int(n)) if *n >= 0 => *n as u64,
        _ => 0,
    };

    let mut peers = Vec::new();
    if let Some(Value::Bytes(compact)) = get_field(&value, b"peers")? {
        peers.extend(parse_compact_ipv4(compact)?);
    }
    if let Some(Value::Bytes(compact6)) = get_field(&value, b"peers6")? {
        peers.extend(parse_compact_ipv6(compact6)?);
    }

    Ok((interval, peers))
}

fn decode_scrape_response(body: &[u8], info_hash: &[u8; 20]) -> Result<ScrapeStats> {
    let value: Value = serde_bencode::de::from_bytes(body)?;

    let files = match get_field(&value, b"files")? {
        Some(files @ Value::Dict(_)) => files,
        _ => return Err(Error::Failure("scrape response missing \"files\"".into())),
    };
    let entry = get_field(files, info_hash)?
        .ok_or_else(|| Error::Failure("scrape response missing our info hash".into()))?;

    let complete = require_uint(entry, b"complete")?;
    let downloaded = require_uint(entry, b"downloaded")?;
    let incomplete = require_uint(entry, b"incomplete")?;

    Ok(ScrapeStats {
        complete,
        downloaded,
        incomplete,
    })
}

/// Looks up `key` in `value`, which must be a bencoded dict. The map's
/// concrete type (the crate's choice of `HashMap` or `BTreeMap`) is never
/// named here, so this compiles against either.
fn get_field<'a>(value: &'a Value, key: &[u8]) -> Result<Option<&'a Value>> {
    match value {
        Value::Dict(d) => Ok(d.get(key)),
        _ => Err(Error::Failure("expected a bencoded dict".into())),
    }
}

fn require_uint(value: &Value, key: &[u8]) -> Result<u64> {
    match get_field(value, key)? {
        Some(Value::Int(n)) if *n >= 0 => Ok(*n as u64),
        _ => Err(Error::Failure(format!(
            "scrape response missing or malformed \"{}\"",
            String::from_utf8_lossy(key)
        ))),
    }
}

fn parse_compact_ipv4(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    const ENTRY_LEN: usize = 6;
    if bytes.len() % ENTRY_LEN != 0 {
        return Err(Error::ShortResponse {
            expected: ENTRY_LEN,
            got: bytes.len() % ENTRY_LEN,
        });
    }
    Ok(bytes
        .chunks_exact(ENTRY_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes(chunk[4..6].try_into().unwrap());
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

fn parse_compact_ipv6(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
    const ENTRY_LEN: usize = 18;
    if bytes.len() % ENTRY_LEN != 0 {
        return Err(Error::ShortResponse {
            expected: ENTRY_LEN,
            got: bytes.len() % ENTRY_LEN,
        });
    }
    Ok(bytes
        .chunks_exact(ENTRY_LEN)
        .map(|chunk| {
            let octets: [u8; 16] = chunk[0..16].try_into().unwrap();
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes(chunk[16..18].try_into().unwrap());
            SocketAddr::new(IpAddr::V6(ip), port)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_url_replaces_last_announce() {
        let url = scrape_url_from_announce("http://tracker.example/announce").unwrap();
        assert_eq!(url, "http://tracker.example/scrape");
    }

    #[test]
    fn scrape_url_unsupported_without_announce_component() {
        assert!(matches!(
            scrape_url_from_announce("http://tracker.example/a"),
            Err(Error::ScrapeUnsupported)
        ));
    }

    #[test]
    fn decodes_compact_ipv4_peers_and_interval() {
        let mut body = b"d8:intervali900e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.push(b'e');
        let (interval, peers) = decode_announce_response(&body).unwrap();
        assert_eq!(interval, 900);
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn interval_defaults_to_zero_on_wrong_type() {
        let body = b"d8:interval3:abc5:peers0:e".to_vec();
        let (interval, peers) = decode_announce_response(&body).unwrap();
        assert_eq!(interval, 0);
        assert!(peers.is_empty());
    }

    #[test]
    fn failure_reason_is_a_fatal_tracker_error() {
        let body = b"d14:failure reason11:no such keye".to_vec();
        assert!(matches!(
            decode_announce_response(&body),
            Err(Error::Failure(_))
        ));
    }

    #[test]
    fn decodes_scrape_stats() {
        let info_hash = [0x11u8; 20];
        let mut body = b"d5:filesd20:".to_vec();
        body.extend_from_slice(&info_hash);
        body.extend_from_slice(b"d8:completei5e10:downloadedi42e10:incompletei2eeee");
        let stats = decode_scrape_response(&body, &info_hash).unwrap();
        assert_eq!(
            stats,
            ScrapeStats {
                complete: 5,
                downloaded: 42,
                incomplete: 2
            }
        );
    }
}
