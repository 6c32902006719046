//! Bitfield reconstruction from an unordered stream of collected messages.
//!
//! Peers often send a `bitfield` message immediately followed by a burst of
//! `have` messages — both must be merged into a single observation, which
//! is exactly what [`reconstruct`] does.

use crate::peer::codec::RawMessage;
use crate::{empty_bitfield, Bitfield};

pub const MSG_CHOKE: u8 = 0;
pub const MSG_UNCHOKE: u8 = 1;
pub const MSG_INTERESTED: u8 = 2;
pub const MSG_NOT_INTERESTED: u8 = 3;
pub const MSG_HAVE: u8 = 4;
pub const MSG_BITFIELD: u8 = 5;
pub const MSG_REQUEST: u8 = 6;
pub const MSG_PIECE: u8 = 7;
pub const MSG_CANCEL: u8 = 8;
pub const MSG_PORT: u8 = 9;
pub const MSG_EXTENDED: u8 = 20;

/// Reconstructs a peer's piece-availability bitfield from the ordered list
/// of messages collected in one session.
///
/// - A valid `bitfield` message (length exactly `ceil(pieces_count/8)`,
///   with zero padding bits) replaces the reconstructed state.
/// - A `have` message sets the corresponding bit if `index < pieces_count`.
/// - Anything else is ignored (but still present in `messages` for the
///   caller's own record-keeping).
pub fn reconstruct(messages: &[RawMessage], pieces_count: usize) -> Bitfield {
    let mut bitfield = empty_bitfield(pieces_count);
    let expected_bytes = (pieces_count + 7) / 8;

    for msg in messages {
        match msg.kind {
            k if k == MSG_BITFIELD as i16 => {
                if let Some(parsed) = parse_bitfield(&msg.payload, pieces_count, expected_bytes) {
                    bitfield = parsed;
                }
            }
            k if k == MSG_HAVE as i16 => {
                if let Some(index) = parse_have(&msg.payload) {
                    if index < pieces_count {
                        bitfield.set(index, true);
                    }
                }
            }
            _ => {}
        }
    }

    bitfield
}

/// Validates and parses a `bitfield` message payload.
///
/// Returns `None` (message ignored) if the payload length doesn't match
/// `expected_bytes`, or if any padding bit in the last byte is set.
fn parse_bitfield(payload: &[u8], pieces_count: usize, expected_bytes: usize) -> Option<Bitfield> {
    if payload.len() != expected_bytes {
        return None;
    }
    let padding_bits = expected_bytes * 8 - pieces_count;
    if padding_bits > 0 {
        let last_byte = payload[expected_bytes - 1];
        let padding_mask = (1u8 << padding_bits) - 1;
        if last_byte & padding_mask != 0 {
            return None;
        }
    }

    let mut bitfield: Bitfield = Bitfield::from_vec(payload.to_vec());
    bitfield.truncate(pieces_count);
    Some(bitfield)
}

fn parse_have(payload: &[u8]) -> Option<usize> {
    if payload.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn have(index: u32) -> RawMessage {
        RawMessage::new(MSG_HAVE, index.to_be_bytes().to_vec())
    }

    fn bitfield_msg(bytes: Vec<u8>) -> RawMessage {
        RawMessage::new(MSG_BITFIELD, bytes)
    }

    #[test]
    fn merges_bitfield_and_haves_scenario_4() {
        let messages = vec![
            bitfield_msg(vec![0b1000_0000, 0b0100_0000]),
            have(2),
            have(4),
            have(9),
        ];
        let bf = reconstruct(&messages, 10);
        assert_eq!(bf.count_ones(), 5);
        for i in [0usize, 1, 2, 4, 9] {
            assert!(*bf.get(i).unwrap(), "expected bit {} set", i);
        }
    }

    #[test]
    fn ignores_have_beyond_pieces_count() {
        let messages = vec![have(100)];
        let bf = reconstruct(&messages, 10);
        assert_eq!(bf.count_ones(), 0);
    }

    #[test]
    fn ignores_malformed_bitfield_wrong_length() {
        let messages = vec![bitfield_msg(vec![0xFF])];
        // pieces_count=10 needs 2 bytes; this payload of 1 byte is ignored
        let bf = reconstruct(&messages, 10);
        assert_eq!(bf.count_ones(), 0);
    }

    #[test]
    fn rejects_bitfield_with_nonzero_padding() {
        // pieces_count=1 => 1 byte, 7 padding bits must be zero
        let messages = vec![bitfield_msg(vec![0b1000_0001])];
        let bf = reconstruct(&messages, 1);
        // padding bit set => message ignored entirely
        assert_eq!(bf.count_ones(), 0);
    }

    #[test]
    fn accepts_bitfield_with_zero_padding_single_piece() {
        let messages = vec![bitfield_msg(vec![0b1000_0000])];
        let bf = reconstruct(&messages, 1);
        assert_eq!(bf.count_ones(), 1);
        assert!(*bf.get(0).unwrap());
    }

    #[test]
    fn exact_multiple_of_eight_has_no_padding() {
        let messages = vec![bitfield_msg(vec![0xFF])];
        let bf = reconstruct(&messages, 8);
        assert_eq!(bf.count_ones(), 8);
    }

    #[test]
    fn last_bitfield_seen_replaces_earlier_one() {
        let messages = vec![
            bitfield_msg(vec![0b1111_1111]),
            bitfield_msg(vec![0b0000_0001]),
        ];
        let bf = reconstruct(&messages, 8);
        assert_eq!(bf.count_ones(), 1);
        assert!(*bf.get(7).unwrap());
    }

    #[test]
    fn bitfield_update_is_idempotent() {
        let payload = vec![0b1010_0000];
        let messages = vec![bitfield_msg(payload.clone()), bitfield_msg(payload)];
        let bf = reconstruct(&messages, 8);
        assert_eq!(bf.count_ones(), 2);
    }
}
