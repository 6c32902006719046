//! Magnet link parsing.
//!
//! Bootstraps a swarm without a `.torrent` file: `magnet:?xt=urn:btih:<hex
//! or base32>&dn=<name>&tr=<announce>&tr=<announce>...`. The info hash may
//! be encoded as 40 hex characters or 32 base32 characters (BEP 9); both
//! are accepted.

use std::fmt;

use crate::Sha1Hash;

/// A parsed magnet link: enough to ask the DHT connector for metadata
/// peers and start a `ut_metadata` fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: Sha1Hash,
    pub display_name: Option<String>,
    pub announce_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MagnetError {
    NotAMagnetUri,
    MissingInfoHash,
    InvalidInfoHash(String),
}

impl fmt::Display for MagnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAMagnetUri => write!(f, "not a magnet: uri"),
            Self::MissingInfoHash => write!(f, "magnet link has no xt=urn:btih parameter"),
            Self::InvalidInfoHash(s) => write!(f, "invalid info hash encoding: {}", s),
        }
    }
}

impl std::error::Error for MagnetError {}

impl MagnetLink {
    /// Parses one line of a magnet file.
    pub fn parse(line: &str) -> Result<Self, MagnetError> {
        let line = line.trim();
        let rest = line
            .strip_prefix("magnet:?")
            .ok_or(MagnetError::NotAMagnetUri)?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut announce_urls = Vec::new();

        for pair in rest.split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            let value = percent_decode(value);
            match key {
                "xt" => {
                    if let Some(hash_str) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(decode_info_hash(hash_str)?);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => announce_urls.push(value),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?,
            display_name,
            announce_urls,
        })
    }
}

fn decode_info_hash(s: &str) -> Result<Sha1Hash, MagnetError> {
    if s.len() == 40 {
        let bytes = hex::decode(s).map_err(|_| MagnetError::InvalidInfoHash(s.to_string()))?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(hash)
    } else if s.len() == 32 {
        let bytes =
            base32_decode(s).ok_or_else(|| MagnetError::InvalidInfoHash(s.to_string()))?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(hash)
    } else {
        Err(MagnetError::InvalidInfoHash(s.to_string()))
    }
}

/// Decodes RFC 4648 base32 (no padding), the encoding BEP 9 allows for info
/// hashes as an alternative to hex.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    for c in s.to_ascii_uppercase().bytes() {
        let value = ALPHABET.iter().position(|&b| b == c)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    Some(out)
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_info_hash_and_trackers() {
        let hash_hex = "a".repeat(40);
        let line = format!(
            "magnet:?xt=urn:btih:{}&dn=My+Torrent&tr=udp%3A%2F%2Ftracker.example%3A80",
            hash_hex
        );
        let magnet = MagnetLink::parse(&line).unwrap();
        assert_eq!(magnet.info_hash, [0xaa; 20]);
        assert_eq!(magnet.display_name.as_deref(), Some("My+Torrent"));
        assert_eq!(magnet.announce_urls, vec!["udp://tracker.example:80"]);
    }

    #[test]
    fn rejects_non_magnet_line() {
        assert_eq!(
            MagnetLink::parse("http://example.com").unwrap_err(),
            MagnetError::NotAMagnetUri
        );
    }

    #[test]
    fn rejects_missing_info_hash() {
        assert_eq!(
            MagnetLink::parse("magnet:?dn=foo").unwrap_err(),
            MagnetError::MissingInfoHash
        );
    }

    #[test]
    fn base32_round_trips_known_vector() {
        // "f" -> base32 "MY======" (RFC 4648 test vector, padding stripped)
        let decoded = base32_decode("MY").unwrap();
        assert_eq!(decoded, vec![b'f']);
    }
}
