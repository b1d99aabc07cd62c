//! Torrent file parsing and error handling logic.
//!
//! This module provides types and error handling for working with .torrent files, including parsing, validation, and error reporting.
use serde_bencode;
use thiserror::Error;
pub mod file;
pub mod info_hash;

/// Every error the client can raise, from bencode decoding up through the
/// peer session. Kept as one enum (rather than per-module enums nested via
/// `#[from]`) because the CLI boundary only ever needs one `anyhow`-wrapped
/// type to print and exit on.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid data type for field: {0}")]
    InvalidFieldType(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("Path conversion error: {0}")]
    PathConversion(String),

    #[error("Date parse error")]
    DateParseError,

    #[error("Url Parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),

    #[error("Handshake failed: Invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("Handshake failed: Info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Tracker returned HTTP status {0}")]
    Http(reqwest::StatusCode),

    #[error("Tracker rejected the request: {0}")]
    TrackerRejected(String),

    #[error("Peer sent an unexpected message (id {0})")]
    UnexpectedMessage(u8),

    #[error("Timed out waiting for peer")]
    PeerTimeout,

    #[error("Piece {index} failed its SHA-1 check")]
    PieceHashMismatch { index: usize },
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
