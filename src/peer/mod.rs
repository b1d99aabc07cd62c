//! Peer wire protocol: handshake, message framing, and the piece fetcher.

pub mod handshake;
pub mod message;
pub mod session;
