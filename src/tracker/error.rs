//! Errors surfaced by a tracker announce or scrape request.

use std::fmt;
use std::io;

/// Any failure while talking to a tracker. The caller treats every variant
/// the same way: skip this interval, retry on the next one.
#[derive(Debug)]
pub enum Error {
    /// The announce URL's scheme is neither `http(s)` nor `udp`.
    UnsupportedScheme(String),
    /// The tracker responded with a `failure reason` (HTTP) or an error
    /// action (UDP).
    Failure(String),
    /// HTTP status was not 200.
    HttpStatus(u16),
    /// The announce URL has no `announce` path component, so `scrape` has
    /// no substitution target.
    ScrapeUnsupported,
    /// A UDP response was shorter than the protocol requires.
    ShortResponse { expected: usize, got: usize },
    /// A UDP response's `transaction_id` didn't match the request.
    TransactionIdMismatch { expected: u32, got: u32 },
    /// A UDP connect response's `action` was neither `0` (ok) nor `3`
    /// (error).
    UnexpectedAction(i32),
    Io(io::Error),
    Http(reqwest::Error),
    Bencode(serde_bencode::Error),
    Url(url::ParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedScheme(s) => write!(f, "unsupported tracker scheme: {}", s),
            Self::Failure(reason) => write!(f, "tracker reported failure: {}", reason),
            Self::HttpStatus(code) => write!(f, "tracker responded with HTTP status {}", code),
            Self::ScrapeUnsupported => write!(f, "announce URL has no \"announce\" component"),
            Self::ShortResponse { expected, got } => write!(
                f,
                "tracker response too short: expected at least {} bytes, got {}",
                expected, got
            ),
            Self::TransactionIdMismatch { expected, got } => write!(
                f,
                "tracker transaction id mismatch: expected {}, got {}",
                expected, got
            ),
            Self::UnexpectedAction(action) => {
                write!(f, "unexpected action {} in connect response", action)
            }
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Http(e) => write!(f, "http error: {}", e),
            Self::Bencode(e) => write!(f, "bencode error: {}", e),
            Self::Url(e) => write!(f, "url error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::Url(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
