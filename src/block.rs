//! The block/piece data model (`SPEC_FULL.md` §3).
//!
//! Grounded on `original_source/piece.py`'s `Piece` class: blocks move
//! through the same three-state lifecycle (`get_empty_block`,
//! `are_all_blocks_full`, `_valid_blocks` resetting on a hash mismatch), here
//! given a typed Rust shape instead of the original's list of dicts.

use std::time::Instant;

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash};

/// The status of a single block within a piece.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    Missing,
    Pending,
    Retrieved(Vec<u8>),
}

/// A piece being assembled from blocks, plus the metadata needed to verify
/// and place it once complete.
#[derive(Debug)]
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub expected_hash: Sha1Hash,
    pub len: u32,
    blocks: Vec<BlockStatus>,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        let blocks = vec![BlockStatus::Missing; block_count(len)];
        Self {
            index,
            expected_hash,
            len,
            blocks,
        }
    }

    /// Returns the info for the next block that hasn't yet been requested,
    /// marking it `Pending`.
    pub fn next_missing_block(&mut self) -> Option<BlockInfo> {
        let block_idx = self
            .blocks
            .iter()
            .position(|b| *b == BlockStatus::Missing)?;
        self.blocks[block_idx] = BlockStatus::Pending;
        Some(BlockInfo {
            piece_index: self.index,
            offset: block_idx as u32 * crate::BLOCK_LEN,
            len: block_len(self.len, block_idx),
        })
    }

    /// Records a received block's data. Idempotent: re-delivering the same
    /// block is a no-op once it is already `Retrieved`.
    pub fn receive_block(&mut self, offset: u32, data: Vec<u8>) {
        let block_idx = (offset / crate::BLOCK_LEN) as usize;
        if block_idx >= self.blocks.len() {
            return;
        }
        if matches!(self.blocks[block_idx], BlockStatus::Retrieved(_)) {
            // already have this block; keep the first delivery's bytes
            return;
        }
        self.blocks[block_idx] = BlockStatus::Retrieved(data);
    }

    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| matches!(b, BlockStatus::Retrieved(_)))
    }

    /// Concatenates all block data in ascending offset order. Only
    /// meaningful once [`Piece::is_complete`] is true.
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len as usize);
        for block in &self.blocks {
            if let BlockStatus::Retrieved(data) = block {
                buf.extend_from_slice(data);
            }
        }
        buf
    }

    /// Resets every block to `Missing`, discarding any retrieved data. Used
    /// when the assembled piece fails its hash check.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            *block = BlockStatus::Missing;
        }
    }
}

/// A block request currently in flight to some peer.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub block: BlockInfo,
    pub added_at: Instant,
}

impl PendingRequest {
    pub fn new(block: BlockInfo) -> Self {
        Self {
            block,
            added_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, max_pending_ms: u64) -> bool {
        self.added_at.elapsed().as_millis() as u64 > max_pending_ms
    }

    pub fn refresh(&mut self) {
        self.added_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_completes_after_all_blocks_received() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN * 2, [0u8; 20]);
        assert!(!piece.is_complete());
        let b0 = piece.next_missing_block().unwrap();
        let b1 = piece.next_missing_block().unwrap();
        assert!(piece.next_missing_block().is_none());
        piece.receive_block(b0.offset, vec![1u8; b0.len as usize]);
        assert!(!piece.is_complete());
        piece.receive_block(b1.offset, vec![2u8; b1.len as usize]);
        assert!(piece.is_complete());
        assert_eq!(piece.assemble().len(), (crate::BLOCK_LEN * 2) as usize);
    }

    #[test]
    fn reset_clears_all_blocks_back_to_missing() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN, [0u8; 20]);
        let b0 = piece.next_missing_block().unwrap();
        piece.receive_block(b0.offset, vec![9u8; b0.len as usize]);
        assert!(piece.is_complete());
        piece.reset();
        assert!(!piece.is_complete());
        let again = piece.next_missing_block().unwrap();
        assert_eq!(again.offset, 0);
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let mut piece = Piece::new(0, crate::BLOCK_LEN, [0u8; 20]);
        let b0 = piece.next_missing_block().unwrap();
        piece.receive_block(b0.offset, vec![1u8; b0.len as usize]);
        piece.receive_block(b0.offset, vec![2u8; b0.len as usize]);
        assert_eq!(piece.assemble(), vec![1u8; b0.len as usize]);
    }
}
