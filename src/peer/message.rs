//! Peer wire message framing: a big-endian 4-byte length prefix followed by
//! that many payload bytes, with byte 0 of a non-empty payload carrying the
//! message id.
use crate::torrent::TorrentError;
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::instrument;

/// Block size used when splitting a piece into `Request`s (16 KiB).
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Upper bound on a single socket read before `PeerTimeout` is raised.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded peer message. `KeepAlive` stands in for a zero-length frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any message id the client doesn't act on. The payload is kept only so
    /// framing stays intact; the session discards it.
    Unknown { id: u8, payload: Bytes },
}

impl PeerMessage {
    /// Serializes this message with its length prefix.
    #[instrument(level = "trace")]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        match self {
            Self::KeepAlive => {}
            Self::Choke => body.put_u8(0),
            Self::Unchoke => body.put_u8(1),
            Self::Interested => body.put_u8(2),
            Self::NotInterested => body.put_u8(3),
            Self::Have { index } => {
                body.put_u8(4);
                body.put_u32(*index);
            }
            Self::Bitfield(bits) => {
                body.put_u8(5);
                body.extend_from_slice(bits);
            }
            Self::Request {
                index,
                begin,
                length,
            } => {
                body.put_u8(6);
                body.put_u32(*index);
                body.put_u32(*begin);
                body.put_u32(*length);
            }
            Self::Piece {
                index,
                begin,
                block,
            } => {
                body.put_u8(7);
                body.put_u32(*index);
                body.put_u32(*begin);
                body.extend_from_slice(block);
            }
            Self::Cancel {
                index,
                begin,
                length,
            } => {
                body.put_u8(8);
                body.put_u32(*index);
                body.put_u32(*begin);
                body.put_u32(*length);
            }
            Self::Unknown { .. } => {
                // The client never originates a message it doesn't understand.
            }
        }

        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32(body.len() as u32);
        framed.extend_from_slice(&body);
        framed.to_vec()
    }

    /// Writes this message to `stream`, length-prefixed.
    pub async fn write(&self, stream: &mut TcpStream) -> Result<()> {
        stream.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Reads one framed message from `stream`. A zero-length frame yields
    /// `KeepAlive` without attempting to read a message id. Every read is
    /// bounded by [`READ_TIMEOUT`] and fully drained (`read_exact`), never a
    /// single short `read`.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        timeout(READ_TIMEOUT, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| TorrentError::PeerTimeout)??;
        let len = BigEndian::read_u32(&len_buf) as usize;

        if len == 0 {
            return Ok(Self::KeepAlive);
        }

        let mut payload = vec![0u8; len];
        timeout(READ_TIMEOUT, stream.read_exact(&mut payload))
            .await
            .map_err(|_| TorrentError::PeerTimeout)??;

        Self::decode(&payload)
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        let id = payload[0];
        let rest = &payload[1..];

        let message = match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => {
                if rest.len() != 4 {
                    return Err(TorrentError::UnexpectedMessage(id).into());
                }
                Self::Have {
                    index: BigEndian::read_u32(rest),
                }
            }
            5 => Self::Bitfield(Bytes::copy_from_slice(rest)),
            6 => {
                if rest.len() != 12 {
                    return Err(TorrentError::UnexpectedMessage(id).into());
                }
                Self::Request {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    length: BigEndian::read_u32(&rest[8..12]),
                }
            }
            7 => {
                if rest.len() < 8 {
                    return Err(TorrentError::UnexpectedMessage(id).into());
                }
                Self::Piece {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    block: Bytes::copy_from_slice(&rest[8..]),
                }
            }
            8 => {
                if rest.len() != 12 {
                    return Err(TorrentError::UnexpectedMessage(id).into());
                }
                Self::Cancel {
                    index: BigEndian::read_u32(&rest[0..4]),
                    begin: BigEndian::read_u32(&rest[4..8]),
                    length: BigEndian::read_u32(&rest[8..12]),
                }
            }
            other => Self::Unknown {
                id: other,
                payload: Bytes::copy_from_slice(rest),
            },
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_encodes_to_zero_length_frame() {
        assert_eq!(PeerMessage::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn choke_round_trips() {
        let encoded = PeerMessage::Choke.encode();
        assert_eq!(encoded, vec![0, 0, 0, 1, 0]);
        let decoded = PeerMessage::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, PeerMessage::Choke);
    }

    #[test]
    fn request_round_trips() {
        let msg = PeerMessage::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 4 + 13);
        let decoded = PeerMessage::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn piece_round_trips_with_block() {
        let block = Bytes::from_static(b"some block bytes");
        let msg = PeerMessage::Piece {
            index: 1,
            begin: 0,
            block: block.clone(),
        };
        let encoded = msg.encode();
        let decoded = PeerMessage::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_id_is_preserved_not_rejected() {
        let decoded = PeerMessage::decode(&[200, 1, 2, 3]).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Unknown {
                id: 200,
                payload: Bytes::from_static(&[1, 2, 3])
            }
        );
    }

    #[test]
    fn malformed_have_payload_is_rejected() {
        assert!(PeerMessage::decode(&[4, 1, 2]).is_err());
    }
}
