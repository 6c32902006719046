//! Bencoded `.torrent` metainfo decoding.
//!
//! Full info-dict parsing and hashing is, per the crawler's scope, an
//! external collaborator's job — this module only extracts the handful of
//! fields the crawler actually needs: the announce URLs, the info hash, the
//! piece count and the piece size. File layout (multi-file archives, exact
//! byte offsets) is never reconstructed because the crawler never touches
//! piece data.

use serde_bencode::Error as BencodeError;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

const SHA1_LEN: usize = 20;

/// A parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, BencodeError> {
        serde_bencode::from_bytes(buf)
    }

    /// SHA-1 of the bencoded info dict, the swarm's info hash.
    ///
    /// Re-encoding must preserve dict key order for this to match the
    /// original info hash — `serde_bencode` sorts keys lexicographically,
    /// the same canonical order the BitTorrent spec requires.
    pub fn info_hash(&self) -> Result<Sha1Hash, BencodeError> {
        let bytes = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&bytes);
        let mut info_hash = [0u8; SHA1_LEN];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Number of pieces, derived from the length of the concatenated piece
    /// hashes (each is 20 bytes).
    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / SHA1_LEN
    }

    /// All announce URLs, de-duplicated, primary announce first, then each
    /// tier of `announce-list` in order.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(primary) = &self.announce {
            urls.push(primary.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }
}

/// The `info` dictionary of a `.torrent` file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

/// Placeholder kept only so `serde_bytes` round-trips the raw pieces blob
/// without going through `Vec<u8>` twice; unused directly but documents the
/// on-wire shape of the field.
#[allow(dead_code)]
type PiecesBlob = ByteBuf;

#[cfg(test)]
mod tests {
    use super::*;

    fn bstr(s: &str) -> String {
        format!("{}:{}", s.len(), s)
    }

    fn sample_bytes() -> Vec<u8> {
        let mut pieces = vec![b'A'; 20];
        pieces.extend(vec![b'B'; 20]);
        let pieces = String::from_utf8_lossy(&pieces).into_owned();
        let info = format!(
            "d6:lengthi20e4:name{}12:piece lengthi10e6:pieces{}e",
            bstr("sampl"),
            bstr(&pieces),
        );
        let announce = "udp://a.example";
        format!(
            "d8:announce{}4:info{}e",
            bstr(announce),
            info
        )
        .into_bytes()
    }

    #[test]
    fn parses_announce_and_pieces_count() {
        let metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        assert_eq!(metainfo.announce.as_deref(), Some("udp://a.example"));
        assert_eq!(metainfo.pieces_count(), 2);
        assert_eq!(metainfo.info.name, "sampl");
    }

    #[test]
    fn info_hash_is_stable() {
        let metainfo = Metainfo::from_bytes(&sample_bytes()).unwrap();
        let a = metainfo.info_hash().unwrap();
        let b = metainfo.info_hash().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn announce_urls_dedupes_across_list() {
        let metainfo = Metainfo {
            info: Info {
                name: "x".into(),
                pieces: vec![0u8; 20],
                piece_length: 10,
                length: Some(10),
                files: None,
                private: None,
            },
            announce: Some("http://a".into()),
            announce_list: Some(vec![vec!["http://a".into(), "http://b".into()]]),
        };
        assert_eq!(metainfo.announce_urls(), vec!["http://a", "http://b"]);
    }
}
