//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
use crate::torrent::TorrentError;
use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::instrument;

/// Upper bound on how long a handshake's connect+exchange may take before
/// `TorrentError::HandshakeTimeout` is raised.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates a new handshake with the specified info hash and peer ID.

    Arguments:
    - info_hash - The SHA-1 hash of the torrent's info dictionary
    - peer_id - A unique identifier for this client

    Returns:
    A new Handshake instance with default protocol settings */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *PROTOCOL,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /** Serializes the handshake into a 68-byte array as per the BitTorrent protocol.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID

    Returns:
    A 68-byte array containing the serialized handshake */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads exactly 68 bytes from `stream` and parses them into a
    /// `Handshake`, validating the length byte and protocol tag.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> Result<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;

        let protocol_len = buf[0];
        if protocol_len != 19 {
            return Err(TorrentError::HandshakeInvalidProtocol.into());
        }

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&buf[1..20]);
        if &protocol != PROTOCOL {
            return Err(TorrentError::HandshakeInvalidProtocol.into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /** Validates that this handshake's info hash matches the expected value.

    Arguments:
    - expected_info_hash - The expected SHA-1 hash of the torrent's info dictionary

    Returns:
    A Result that is Ok if the info hashes match, or an error if they don't */
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> Result<()> {
        if self.info_hash != expected_info_hash {
            return Err(TorrentError::HandshakeInfoHashMismatch.into());
        }
        Ok(())
    }

    /// Performs a complete handshake with a peer over a TCP connection and
    /// hands back the still-open socket for the session layer to reuse.
    ///
    /// # How it works
    /// 1. Establishes a TCP connection to the peer's address (IP:port).
    /// 2. Sends our serialized handshake.
    /// 3. Reads and validates the peer's handshake.
    /// 4. Returns the open socket plus the peer's handshake.
    ///
    /// The whole exchange (connect, write, read) is bounded by
    /// [`HANDSHAKE_TIMEOUT`]; exceeding it surfaces `HandshakeTimeout`.
    pub async fn do_handshake(
        peer_addr: impl ToSocketAddrs,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<(TcpStream, Handshake)> {
        timeout(HANDSHAKE_TIMEOUT, Self::do_handshake_inner(peer_addr, info_hash, peer_id))
            .await
            .map_err(|_| TorrentError::HandshakeTimeout)?
    }

    async fn do_handshake_inner(
        peer_addr: impl ToSocketAddrs,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<(TcpStream, Handshake)> {
        let mut stream = TcpStream::connect(peer_addr).await?;

        let our_handshake = Handshake::new(info_hash, peer_id);
        stream.write_all(&our_handshake.serialize()).await?;

        let their_handshake = Handshake::read(&mut stream).await?;
        their_handshake.validate(info_hash)?;

        Ok((stream, their_handshake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_matches_wire_layout() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        let buf = hs.serialize();

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL);
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &info_hash);
        assert_eq!(&buf[48..68], &peer_id);
    }

    #[test]
    fn validate_rejects_mismatched_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate([9u8; 20]).is_err());
        assert!(hs.validate([1u8; 20]).is_ok());
    }
}
