//! The block level bookkeeping of a piece that is being downloaded.
//!
//! A [`PieceDownload`] is shared by all peer sessions participating in the
//! piece. It enforces the in-flight invariants: outside the endgame a block
//! is outstanding to at most one peer; in endgame up to a configured number
//! of duplicates are allowed and the first arriving copy wins, the rest are
//! cancelled.

use std::net::SocketAddr;

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

/// The status of a single block within a piece download.
#[derive(Clone, Debug, PartialEq)]
enum BlockStatus {
    Free,
    /// Requested from the listed peers. More than one entry is only possible
    /// in endgame.
    Requested(Vec<SocketAddr>),
    /// Received, remembering who delivered it so hash failures can be
    /// attributed.
    Received { from: SocketAddr },
}

/// What happened to a block that a peer delivered.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReceivedBlock {
    /// The block was accepted. Any other peers the block was outstanding to
    /// (endgame) should be sent a cancel.
    Accepted { cancel: Vec<SocketAddr> },
    /// Another peer won the endgame race, the data is waste.
    Duplicate,
    /// The block doesn't exist within this piece.
    Invalid,
}

/// Tracks the completion of an ongoing piece download.
#[derive(Clone, Debug)]
pub(crate) struct PieceDownload {
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    blocks: Vec<BlockStatus>,
    received_count: usize,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockStatus::Free; block_count(len)],
            received_count: 0,
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` blocks for the given peer and appends them to
    /// `buf`.
    ///
    /// Outside endgame only free blocks are picked. In endgame, blocks
    /// outstanding to fewer than `max_duplicates` other peers are picked as
    /// well, so that the last blocks of a torrent don't hang on a single slow
    /// peer.
    pub fn pick_blocks(
        &mut self,
        count: usize,
        peer: SocketAddr,
        buf: &mut Vec<BlockInfo>,
        endgame: bool,
        max_duplicates: usize,
    ) {
        let (piece_index, piece_len) = (self.index, self.len);
        let mut picked = 0;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            match block {
                BlockStatus::Free => {
                    *block = BlockStatus::Requested(vec![peer]);
                }
                BlockStatus::Requested(peers) if endgame => {
                    if peers.len() >= max_duplicates.max(1)
                        || peers.contains(&peer)
                    {
                        continue;
                    }
                    peers.push(peer);
                }
                _ => continue,
            }
            buf.push(BlockInfo {
                piece_index,
                offset: i as u32 * BLOCK_LEN,
                len: block_len(piece_len, i),
            });
            picked += 1;
        }
    }

    /// Registers a block delivered by a peer.
    pub fn received_block(
        &mut self,
        block: &BlockInfo,
        from: SocketAddr,
    ) -> ReceivedBlock {
        let index = match self.index_of(block) {
            Some(index) => index,
            None => return ReceivedBlock::Invalid,
        };
        match &mut self.blocks[index] {
            BlockStatus::Received { .. } => ReceivedBlock::Duplicate,
            BlockStatus::Requested(peers) => {
                let cancel = peers
                    .iter()
                    .copied()
                    .filter(|peer| *peer != from)
                    .collect();
                self.blocks[index] = BlockStatus::Received { from };
                self.received_count += 1;
                ReceivedBlock::Accepted { cancel }
            }
            BlockStatus::Free => {
                // the request may have timed out on our end while the data
                // was in flight; still accept it
                self.blocks[index] = BlockStatus::Received { from };
                self.received_count += 1;
                ReceivedBlock::Accepted { cancel: Vec::new() }
            }
        }
    }

    /// Removes the peer from a block's requester list, freeing the block if
    /// no other peer has it in flight. Used on request timeout or an explicit
    /// cancel.
    pub fn free_block(&mut self, block: &BlockInfo, peer: SocketAddr) {
        if let Some(index) = self.index_of(block) {
            if let BlockStatus::Requested(peers) = &mut self.blocks[index] {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    self.blocks[index] = BlockStatus::Free;
                }
            }
        }
    }

    /// Releases every block the peer has in flight. Called when a session
    /// disconnects or is choked: whatever it had outstanding becomes
    /// assignable to other peers again.
    pub fn release_peer_blocks(&mut self, peer: SocketAddr) {
        for block in self.blocks.iter_mut() {
            if let BlockStatus::Requested(peers) = block {
                peers.retain(|p| *p != peer);
                if peers.is_empty() {
                    *block = BlockStatus::Free;
                }
            }
        }
    }

    /// The number of blocks not yet received.
    pub fn missing_block_count(&self) -> usize {
        self.blocks.len() - self.received_count
    }

    pub fn is_complete(&self) -> bool {
        self.missing_block_count() == 0
    }

    /// The peers that delivered at least one block of this piece. Used to
    /// attribute a hash failure.
    pub fn contributors(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<_> = self
            .blocks
            .iter()
            .filter_map(|block| match block {
                BlockStatus::Received { from } => Some(*from),
                _ => None,
            })
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    fn index_of(&self, block: &BlockInfo) -> Option<usize> {
        if block.piece_index != self.index
            || block.offset % BLOCK_LEN != 0
            || block.len == 0
        {
            return None;
        }
        let index = (block.offset / BLOCK_LEN) as usize;
        if index >= self.blocks.len() || block.len != block_len(self.len, index)
        {
            return None;
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PIECE_LEN: u32 = 2 * BLOCK_LEN + 1000;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn test_pick_blocks_in_order() {
        let mut download = PieceDownload::new(3, PIECE_LEN);
        let mut picked = Vec::new();
        download.pick_blocks(2, addr(1), &mut picked, false, 1);
        assert_eq!(
            picked,
            vec![
                BlockInfo {
                    piece_index: 3,
                    offset: 0,
                    len: BLOCK_LEN
                },
                BlockInfo {
                    piece_index: 3,
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN
                },
            ]
        );

        // the last, shorter block remains
        picked.clear();
        download.pick_blocks(5, addr(1), &mut picked, false, 1);
        assert_eq!(
            picked,
            vec![BlockInfo {
                piece_index: 3,
                offset: 2 * BLOCK_LEN,
                len: 1000
            }]
        );

        // nothing is left to pick, even for another peer
        picked.clear();
        download.pick_blocks(5, addr(2), &mut picked, false, 1);
        assert!(picked.is_empty());
    }

    #[test]
    fn test_received_block_retires_request() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let mut picked = Vec::new();
        download.pick_blocks(3, addr(1), &mut picked, false, 1);

        for block in &picked {
            assert_eq!(
                download.received_block(block, addr(1)),
                ReceivedBlock::Accepted { cancel: vec![] }
            );
        }
        assert!(download.is_complete());
        assert_eq!(download.contributors(), vec![addr(1)]);

        // a second copy is waste
        assert_eq!(
            download.received_block(&picked[0], addr(2)),
            ReceivedBlock::Duplicate
        );
    }

    #[test]
    fn test_received_block_validates_geometry() {
        let mut download = PieceDownload::new(0, PIECE_LEN);
        let bogus = BlockInfo {
            piece_index: 0,
            offset: 12,
            len: BLOCK_LEN,
        };
        assert_eq!(
            download.received_block(&bogus, addr(1)),
            ReceivedBlock::Invalid
        );
        let wrong_len = BlockInfo {
            piece_index: 0,
            offset: 2 * BLOCK_LEN,
            len: BLOCK_LEN,
        };
        assert_eq!(
            download.received_block(&wrong_len, addr(1)),
            ReceivedBlock::Invalid
        );
    }

    #[test]
    fn test_endgame_duplicates_and_cancel() {
        let mut download = PieceDownload::new(0, PIECE_LEN);

        let mut first = Vec::new();
        download.pick_blocks(3, addr(1), &mut first, true, 2);
        assert_eq!(first.len(), 3);

        // a second peer may double up on the same blocks in endgame
        let mut second = Vec::new();
        download.pick_blocks(3, addr(2), &mut second, true, 2);
        assert_eq!(second, first);

        // but the duplicate cap stops a third
        let mut third = Vec::new();
        download.pick_blocks(3, addr(3), &mut third, true, 2);
        assert!(third.is_empty());

        // and the same peer never doubles up on its own request
        let mut again = Vec::new();
        download.pick_blocks(3, addr(1), &mut again, true, 2);
        assert!(again.is_empty());

        // first arrival wins and the loser is returned for cancelling
        assert_eq!(
            download.received_block(&first[0], addr(2)),
            ReceivedBlock::Accepted {
                cancel: vec![addr(1)]
            }
        );
    }

    #[test]
    fn test_release_peer_blocks() {
        let mut download = PieceDownload::new(0, PIECE_LEN);

        let mut picked = Vec::new();
        download.pick_blocks(1, addr(1), &mut picked, false, 1);
        download.pick_blocks(1, addr(2), &mut picked, false, 1);
        assert_eq!(picked.len(), 2);

        download.release_peer_blocks(addr(1));

        // peer 1's block is free again, peer 2's is still in flight
        let mut repicked = Vec::new();
        download.pick_blocks(3, addr(3), &mut repicked, false, 1);
        assert_eq!(repicked.len(), 2);
        assert_eq!(repicked[0], picked[0]);
    }

    #[test]
    fn test_free_block_respects_other_requesters() {
        let mut download = PieceDownload::new(0, PIECE_LEN);

        let mut picked = Vec::new();
        download.pick_blocks(1, addr(1), &mut picked, true, 2);
        let mut dup = Vec::new();
        download.pick_blocks(1, addr(2), &mut dup, true, 2);
        assert_eq!(picked, dup);

        // freeing one requester keeps the block in flight for the other
        download.free_block(&picked[0], addr(1));
        let mut repicked = Vec::new();
        download.pick_blocks(1, addr(3), &mut repicked, false, 1);
        // not free: addr(2) still has it
        assert!(repicked.is_empty());

        download.free_block(&picked[0], addr(2));
        download.pick_blocks(1, addr(3), &mut repicked, false, 1);
        assert_eq!(repicked, picked);
    }
}
