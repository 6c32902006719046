//! BEP 10 Extension Protocol handshake and the BEP 9 `ut_metadata`
//! metadata-fetch flow used to resolve magnet links.
//!
//! The extension messages exchanged here are tiny, fixed-shape bencoded
//! dicts (`{"m": {"ut_metadata": N}}`, `{"msg_type": 0, "piece": N}`)
//! immediately followed, in the `piece` response, by a raw (non-bencoded)
//! metadata block. `serde_bencode` (the crate used for whole `.torrent`
//! files elsewhere in this crawler) only exposes whole-buffer decoding, so
//! extracting "the dict, then whatever raw bytes follow it" needs a small
//! local bencode value with a prefix-scanning decoder; that lives here
//! rather than in `metainfo`, which never needs it.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use super::bitfield::MSG_EXTENDED;
use super::codec::RawMessage;
use super::error::{Error, Result};
use crate::Sha1Hash;

/// Local extended-message sub-id `0` is reserved for the extended
/// handshake itself, per BEP 10.
const HANDSHAKE_SUB_ID: u8 = 0;

/// Fixed metadata block size, per BEP 9.
pub const METADATA_BLOCK_LEN: usize = 16384;

/// A bencode value, restricted to what the extension dicts need.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BValue {
    Int(i64),
    Bytes(Vec<u8>),
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            BValue::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            BValue::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            BValue::Dict(map) => {
                out.push(b'd');
                // `BTreeMap` iterates in key order, which is bencode's
                // required canonical (sorted) dict key order.
                for (k, v) in map {
                    BValue::Bytes(k.clone()).encode(out);
                    v.encode(out);
                }
                out.push(b'e');
            }
        }
    }

    fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

fn dict(pairs: Vec<(&[u8], BValue)>) -> BValue {
    BValue::Dict(pairs.into_iter().map(|(k, v)| (k.to_vec(), v)).collect())
}

/// Builds the extended handshake payload: `{"m": {"ut_metadata": <local
/// sub-id>}}`.
pub fn build_extended_handshake(ut_metadata_id: u8) -> RawMessage {
    let value = dict(vec![(
        b"m",
        dict(vec![(b"ut_metadata", BValue::Int(ut_metadata_id as i64))]),
    )]);
    let mut payload = vec![HANDSHAKE_SUB_ID];
    value.encode(&mut payload);
    RawMessage::new(MSG_EXTENDED, payload)
}

/// The remote peer's extended handshake, as far as this crawler cares.
#[derive(Debug, Clone, Copy)]
pub struct RemoteExtendedHandshake {
    pub ut_metadata_id: u8,
    pub metadata_size: usize,
}

/// Scans a collected message list for the extended handshake (type `20`,
/// sub-id `0`) and extracts the remote's `ut_metadata` sub-id and
/// `metadata_size`.
pub fn find_extended_handshake(messages: &[RawMessage]) -> Result<RemoteExtendedHandshake> {
    for msg in messages {
        if msg.kind != MSG_EXTENDED as i16 {
            continue;
        }
        if msg.payload.is_empty() || msg.payload[0] != HANDSHAKE_SUB_ID {
            continue;
        }
        let (value, _) = match decode_bencode_prefix(&msg.payload[1..]) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let dict = match value.as_dict() {
            Some(d) => d,
            None => continue,
        };
        let m = match dict.get(b"m".as_slice()).and_then(BValue::as_dict) {
            Some(m) => m,
            None => continue,
        };
        let ut_metadata_id = match m.get(b"ut_metadata".as_slice()).and_then(BValue::as_int) {
            Some(id) => id as u8,
            None => continue,
        };
        let metadata_size = match dict.get(b"metadata_size".as_slice()).and_then(BValue::as_int) {
            Some(size) => size as usize,
            None => continue,
        };
        return Ok(RemoteExtendedHandshake {
            ut_metadata_id,
            metadata_size,
        });
    }
    Err(Error::NoExtendedHandshake)
}

/// Builds one `ut_metadata` request message for block `piece`.
pub fn build_metadata_request(remote_sub_id: u8, piece: usize) -> RawMessage {
    let value = dict(vec![
        (b"msg_type", BValue::Int(0)),
        (b"piece", BValue::Int(piece as i64)),
    ]);
    let mut payload = vec![remote_sub_id];
    value.encode(&mut payload);
    RawMessage::new(MSG_EXTENDED, payload)
}

/// Extracts the metadata block carried by a `ut_metadata` data message
/// (`msg_type == 1`), if `msg` is one addressed to `local_sub_id`.
///
/// The raw block bytes follow the bencoded dict in the payload and are not
/// bencoded themselves, so they are the remainder of the payload after the
/// dict's own length.
pub fn parse_metadata_piece(msg: &RawMessage, local_sub_id: u8) -> Option<(usize, &[u8])> {
    if msg.kind != MSG_EXTENDED as i16 {
        return None;
    }
    if msg.payload.is_empty() || msg.payload[0] != local_sub_id {
        return None;
    }
    let (value, consumed) = decode_bencode_prefix(&msg.payload[1..]).ok()?;
    let dict = value.as_dict()?;
    let msg_type = dict.get(b"msg_type".as_slice()).and_then(BValue::as_int)?;
    if msg_type != 1 {
        return None;
    }
    let piece = dict.get(b"piece".as_slice()).and_then(BValue::as_int)? as usize;
    let block = &msg.payload[1 + consumed..];
    Some((piece, block))
}

/// Number of `B`-sized blocks needed to cover `metadata_size` bytes.
pub fn block_count(metadata_size: usize) -> usize {
    (metadata_size + METADATA_BLOCK_LEN - 1) / METADATA_BLOCK_LEN
}

/// Concatenates metadata blocks received out of order, keyed by piece
/// index, and verifies the result hashes to `info_hash`.
pub fn assemble_metadata(
    blocks: &BTreeMap<usize, Vec<u8>>,
    block_total: usize,
    info_hash: &Sha1Hash,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for i in 0..block_total {
        match blocks.get(&i) {
            Some(block) => out.extend_from_slice(block),
            None => return Err(Error::IncompleteMetadata),
        }
    }
    let digest = Sha1::digest(&out);
    if digest.as_slice() != info_hash {
        return Err(Error::MetadataHashMismatch);
    }
    Ok(out)
}

/// Decodes one bencode value from the start of `buf` and returns it along
/// with the number of bytes it occupied. See the module doc for why this
/// exists alongside `serde_bencode`.
fn decode_bencode_prefix(buf: &[u8]) -> Result<(BValue, usize)> {
    match buf.first() {
        Some(b'i') => {
            let end = find(buf, b'e', 1)?;
            let n: i64 = std::str::from_utf8(&buf[1..end])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(bencode_err)?;
            Ok((BValue::Int(n), end + 1))
        }
        Some(c) if c.is_ascii_digit() => {
            let colon = find(buf, b':', 0)?;
            let len: usize = std::str::from_utf8(&buf[0..colon])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(bencode_err)?;
            let start = colon + 1;
            let end = start + len;
            if buf.len() < end {
                return Err(bencode_err());
            }
            Ok((BValue::Bytes(buf[start..end].to_vec()), end))
        }
        Some(b'l') => {
            let mut pos = 1;
            loop {
                if buf.get(pos) == Some(&b'e') {
                    pos += 1;
                    break;
                }
                let (_, consumed) = decode_bencode_prefix(&buf[pos..])?;
                pos += consumed;
            }
            // lists never appear in the dicts this module builds or reads;
            // skip over them structurally without keeping the contents.
            Ok((BValue::Bytes(Vec::new()), pos))
        }
        Some(b'd') => {
            let mut pos = 1;
            let mut map = BTreeMap::new();
            loop {
                if buf.get(pos) == Some(&b'e') {
                    pos += 1;
                    break;
                }
                let (key, consumed) = decode_bencode_prefix(&buf[pos..])?;
                pos += consumed;
                let key = match key {
                    BValue::Bytes(b) => b,
                    _ => return Err(bencode_err()),
                };
                let (value, consumed) = decode_bencode_prefix(&buf[pos..])?;
                pos += consumed;
                map.insert(key, value);
            }
            Ok((BValue::Dict(map), pos))
        }
        _ => Err(bencode_err()),
    }
}

fn find(buf: &[u8], needle: u8, from: usize) -> Result<usize> {
    buf[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|p| p + from)
        .ok_or_else(bencode_err)
}

fn bencode_err() -> Error {
    Error::MalformedExtension("malformed bencode prefix".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_handshake_round_trip() {
        let msg = build_extended_handshake(4);
        let parsed = find_extended_handshake(std::slice::from_ref(&msg)).unwrap();
        assert_eq!(parsed.ut_metadata_id, 4);
    }

    #[test]
    fn metadata_request_round_trip_via_parse() {
        let req = build_metadata_request(4, 2);
        assert_eq!(req.kind, MSG_EXTENDED as i16);
        assert_eq!(req.payload[0], 4);
    }

    #[test]
    fn ut_metadata_fetch_scenario_6() {
        let block0 = vec![0xAAu8; METADATA_BLOCK_LEN];
        let block1 = vec![0xBBu8; METADATA_BLOCK_LEN];
        let mut full = block0.clone();
        full.extend_from_slice(&block1);
        let info_hash: Sha1Hash = {
            let digest = Sha1::digest(&full);
            let mut h = [0u8; 20];
            h.copy_from_slice(&digest);
            h
        };

        let local_sub_id = 6u8;
        let make_piece_msg = |piece: usize, block: &[u8]| -> RawMessage {
            let value = dict(vec![
                (b"msg_type", BValue::Int(1)),
                (b"piece", BValue::Int(piece as i64)),
            ]);
            let mut payload = vec![local_sub_id];
            value.encode(&mut payload);
            payload.extend_from_slice(block);
            RawMessage::new(MSG_EXTENDED, payload)
        };

        // peer replies out of order: piece 1 before piece 0
        let messages = vec![make_piece_msg(1, &block1), make_piece_msg(0, &block0)];

        let total = block_count(full.len());
        assert_eq!(total, 2);

        let mut blocks = BTreeMap::new();
        for msg in &messages {
            let (piece, block) = parse_metadata_piece(msg, local_sub_id).unwrap();
            blocks.insert(piece, block.to_vec());
        }

        let assembled = assemble_metadata(&blocks, total, &info_hash).unwrap();
        assert_eq!(assembled, full);
    }

    #[test]
    fn assemble_metadata_rejects_hash_mismatch() {
        let mut blocks = BTreeMap::new();
        blocks.insert(0, vec![1, 2, 3]);
        let wrong_hash = [0u8; 20];
        assert!(assemble_metadata(&blocks, 1, &wrong_hash).is_err());
    }
}
