//! The peer-wire session (C1): one connected peer, handshake through
//! message collection and bitfield reconstruction.

pub mod bitfield;
pub mod codec;
pub mod error;
pub mod extension;
mod session;

pub use error::{Error, Result};
pub use session::{PeerSession, VisitResult};
