//! Post-handshake peer session: the choke/interest state machine and the
//! block-pipelined piece fetcher.
use crate::peer::handshake::Handshake;
use crate::peer::message::{PeerMessage, BLOCK_SIZE};
use crate::torrent::file::TorrentFile;
use crate::torrent::TorrentError;
use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::instrument;

/// Protocol state of a connected peer session, mirroring the handshake's
/// handoff (`Handshaking` lives entirely inside `Handshake::do_handshake`;
/// a `PeerSession` is only ever constructed already past it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingBitfield,
    AwaitingUnchoke,
    Ready,
    Closed,
}

/// An owning byte buffer for one piece, written sparsely by block offset and
/// considered complete once every byte has arrived.
pub struct PieceBuffer {
    data: Vec<u8>,
    received: usize,
}

impl PieceBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            received: 0,
        }
    }

    /// Writes `block` at `begin`. Rejects a `begin` that isn't block-aligned
    /// or a block that would run past the piece's effective length.
    pub fn insert(&mut self, begin: usize, block: &[u8]) -> Result<()> {
        if begin % BLOCK_SIZE as usize != 0 {
            return Err(anyhow::anyhow!(
                "block offset {begin} is not a multiple of the block size"
            ));
        }
        let end = begin + block.len();
        if end > self.data.len() {
            return Err(anyhow::anyhow!(
                "block [{begin}, {end}) overruns piece of length {}",
                self.data.len()
            ));
        }
        self.data[begin..end].copy_from_slice(block);
        self.received += block.len();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.data.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// A connected peer, post-handshake. Owns the socket; dropping the session
/// (success, error, or caller abort) releases it.
pub struct PeerSession {
    stream: TcpStream,
    state: SessionState,
    pub remote_peer_id: [u8; 20],
}

impl PeerSession {
    /// Connects to `peer_addr`, performs the handshake, and returns a
    /// session parked in `AwaitingBitfield`.
    #[instrument(level = "debug", skip(info_hash, our_peer_id))]
    pub async fn connect(
        peer_addr: impl ToSocketAddrs + std::fmt::Debug,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
    ) -> Result<Self> {
        let (stream, handshake) = Handshake::do_handshake(peer_addr, info_hash, our_peer_id).await?;
        Ok(Self {
            stream,
            state: SessionState::AwaitingBitfield,
            remote_peer_id: handshake.peer_id,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reads and applies exactly one protocol event, handling the
    /// state-independent transitions (bitfield -> interested, choke/unchoke)
    /// itself and returning the message for the caller to act on further.
    /// Keep-alives and unknown message ids are consumed without surfacing.
    async fn next_event(&mut self) -> Result<PeerMessage> {
        loop {
            let message = match PeerMessage::read(&mut self.stream).await {
                Ok(message) => message,
                Err(err) => {
                    self.state = SessionState::Closed;
                    return Err(err);
                }
            };

            match &message {
                PeerMessage::KeepAlive => continue,
                PeerMessage::Unknown { id, .. } => {
                    tracing::trace!(id, "discarding unknown peer message");
                    continue;
                }
                PeerMessage::Bitfield(_) => {
                    if self.state == SessionState::AwaitingBitfield {
                        self.state = SessionState::AwaitingUnchoke;
                        PeerMessage::Interested.write(&mut self.stream).await?;
                    }
                    return Ok(message);
                }
                PeerMessage::Have { index } => {
                    tracing::trace!(index, "peer announced piece availability");
                    return Ok(message);
                }
                PeerMessage::Unchoke => {
                    self.state = SessionState::Ready;
                    return Ok(message);
                }
                PeerMessage::Choke => {
                    self.state = SessionState::AwaitingUnchoke;
                    return Ok(message);
                }
                _ => return Ok(message),
            }
        }
    }

    /// Drives the state machine forward until `Ready`, discarding anything
    /// that doesn't cause a transition.
    async fn wait_until_ready(&mut self) -> Result<()> {
        while self.state != SessionState::Ready {
            if self.state == SessionState::Closed {
                return Err(TorrentError::PeerTimeout.into());
            }
            self.next_event().await?;
        }
        Ok(())
    }

    /// Downloads piece `index` per the algorithm in the peer protocol spec:
    /// split into 16 KiB blocks, one outstanding `Request` at a time,
    /// correlate responses by `(index, begin)`, verify SHA-1 on completion.
    #[instrument(level = "debug", skip(self, torrent))]
    pub async fn download_piece(&mut self, torrent: &TorrentFile, index: usize) -> Result<Vec<u8>> {
        self.wait_until_ready().await?;

        let piece_size = torrent.piece_size(index);
        if piece_size <= 0 {
            return Err(anyhow::anyhow!("piece index {index} is out of range"));
        }
        let piece_size = piece_size as usize;
        let expected_hash = *torrent
            .pieces_hash
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("piece index {index} is out of range"))?;

        let mut buffer = PieceBuffer::new(piece_size);
        let mut offset = 0usize;

        while offset < piece_size {
            self.wait_until_ready().await?;

            let block_len = (BLOCK_SIZE as usize).min(piece_size - offset);
            PeerMessage::Request {
                index: index as u32,
                begin: offset as u32,
                length: block_len as u32,
            }
            .write(&mut self.stream)
            .await?;

            let block = loop {
                match self.next_event().await? {
                    PeerMessage::Piece {
                        index: piece_index,
                        begin,
                        block,
                    } => {
                        if piece_index as usize != index {
                            return Err(TorrentError::UnexpectedMessage(7).into());
                        }
                        if begin as usize != offset {
                            tracing::trace!(begin, offset, "ignoring block for another offset");
                            continue;
                        }
                        break Some(block);
                    }
                    PeerMessage::Choke => break None,
                    _ => continue,
                }
            };

            match block {
                Some(block) => {
                    buffer.insert(offset, &block)?;
                    offset += block_len;
                }
                None => continue, // choked mid-piece; wait_until_ready retries this offset
            }
        }

        debug_assert!(buffer.is_complete());
        let data = buffer.into_inner();

        let digest = Sha1::digest(&data);
        if digest.as_slice() != expected_hash {
            self.state = SessionState::Closed;
            return Err(TorrentError::PieceHashMismatch { index }.into());
        }

        Ok(data)
    }

    /// Downloads every piece of `torrent` sequentially over this session and
    /// returns the concatenated file bytes. The session is closed on return,
    /// success or failure.
    #[instrument(level = "debug", skip(self, torrent))]
    pub async fn download_file(&mut self, torrent: &TorrentFile) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(torrent.total_length().max(0) as usize);
        for index in 0..torrent.num_pieces() {
            let piece = match self.download_piece(torrent, index).await {
                Ok(piece) => piece,
                Err(err) => {
                    self.state = SessionState::Closed;
                    return Err(err);
                }
            };
            out.extend_from_slice(&piece);
        }
        self.state = SessionState::Closed;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_buffer_rejects_misaligned_offset() {
        let mut buf = PieceBuffer::new(BLOCK_SIZE as usize * 2);
        assert!(buf.insert(100, &[0u8; 10]).is_err());
    }

    #[test]
    fn piece_buffer_rejects_overrun() {
        let mut buf = PieceBuffer::new(BLOCK_SIZE as usize);
        assert!(buf
            .insert(0, &vec![0u8; BLOCK_SIZE as usize + 1])
            .is_err());
    }

    #[test]
    fn piece_buffer_assembles_in_begin_order() {
        let mut buf = PieceBuffer::new(BLOCK_SIZE as usize * 2);
        let second = vec![2u8; BLOCK_SIZE as usize];
        let first = vec![1u8; BLOCK_SIZE as usize];
        buf.insert(BLOCK_SIZE as usize, &second).unwrap();
        buf.insert(0, &first).unwrap();
        assert!(buf.is_complete());
        let data = buf.into_inner();
        assert_eq!(&data[..BLOCK_SIZE as usize], &first[..]);
        assert_eq!(&data[BLOCK_SIZE as usize..], &second[..]);
    }
}
