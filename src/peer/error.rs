//! Errors produced by a peer-wire session (`PeerError` in spec terms).

use std::fmt;
use std::io;

/// Any protocol violation, short read, I/O failure, or unsupported
/// extension encountered while running a peer session.
#[derive(Debug)]
pub enum Error {
    /// `pstr` was not `"BitTorrent protocol"`.
    WrongProtocol,
    /// The outbound handshake's echoed info hash didn't match what we sent.
    InfoHashMismatch,
    /// The handshake's info hash is not known to the torrent table
    /// (inbound sessions only; the caller discards the connection).
    UnknownInfoHash,
    /// A message claimed a length that would exceed any sane frame size.
    MessageTooLarge(u32),
    /// The remote peer does not support an extension required for the
    /// requested operation (e.g. `ut_metadata` without BEP 10).
    UnsupportedExtension,
    /// The fetched metadata's SHA-1 did not match the target info hash.
    MetadataHashMismatch,
    /// One or more metadata blocks were never received before the message
    /// cap was reached.
    IncompleteMetadata,
    /// The remote peer never sent an extended handshake before the message
    /// cap was reached.
    NoExtendedHandshake,
    /// Underlying I/O failure (includes short reads/EOF via
    /// `UnexpectedEof` and `TimedOut`).
    Io(io::Error),
    /// Malformed bencode where one was expected (extension messages).
    Bencode(serde_bencode::Error),
    /// A hand-scanned bencode prefix (see `peer::extension`) was truncated
    /// or otherwise malformed.
    MalformedExtension(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongProtocol => write!(f, "handshake pstr is not \"BitTorrent protocol\""),
            Self::InfoHashMismatch => write!(f, "peer echoed a different info hash"),
            Self::UnknownInfoHash => write!(f, "info hash not found in torrent table"),
            Self::MessageTooLarge(len) => write!(f, "message length {} exceeds sane bound", len),
            Self::UnsupportedExtension => write!(f, "peer does not support required extension"),
            Self::MetadataHashMismatch => write!(f, "fetched metadata hash mismatch"),
            Self::NoExtendedHandshake => write!(f, "no extended handshake received"),
            Self::IncompleteMetadata => write!(f, "metadata fetch incomplete: missing blocks"),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::MalformedExtension(s) => write!(f, "malformed extension message: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
