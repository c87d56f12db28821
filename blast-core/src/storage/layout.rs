//! Geometry of a torrent's payload: pieces split into fixed-size blocks.

use super::StorageError;
use crate::torrent::PieceIndex;

/// Default transfer unit for block requests.
pub const BLOCK_SIZE: u32 = 16384;

/// Largest piece the engine accepts, in blocks.
pub const MAX_BLOCKS_PER_PIECE: u32 = 32;

/// Maps piece and block indices onto byte ranges of a single payload.
///
/// Every piece has `piece_length` bytes except the last, which holds the
/// remainder. Inside a piece every block has `block_size` bytes except the
/// last, which may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    piece_length: u32,
    total_length: u64,
    block_size: u32,
}

impl BlockLayout {
    /// Creates a layout with the default 16 KiB block size.
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        Self::with_block_size(piece_length, total_length, BLOCK_SIZE)
    }

    /// Creates a layout with an explicit block size.
    pub fn with_block_size(piece_length: u32, total_length: u64, block_size: u32) -> Self {
        Self {
            piece_length,
            total_length,
            block_size,
        }
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of pieces covering the payload.
    pub fn piece_count(&self) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(u64::from(self.piece_length)) as u32
    }

    /// Size of the given piece, or `None` past the end of the payload.
    pub fn piece_size(&self, piece: PieceIndex) -> Option<u32> {
        if piece.as_u32() >= self.piece_count() {
            return None;
        }
        let start = self.piece_offset(piece);
        let remaining = self.total_length - start;
        Some(remaining.min(u64::from(self.piece_length)) as u32)
    }

    /// Absolute byte offset of a piece in the payload.
    pub fn piece_offset(&self, piece: PieceIndex) -> u64 {
        u64::from(piece.as_u32()) * u64::from(self.piece_length)
    }

    /// Number of blocks in a piece of `piece_size` bytes.
    pub fn blocks_in(&self, piece_size: u32) -> u32 {
        piece_size.div_ceil(self.block_size)
    }

    /// Size of a block, or `None` if the address does not exist.
    pub fn block_len(&self, piece: PieceIndex, block: u32) -> Option<u32> {
        let piece_size = self.piece_size(piece)?;
        let begin = block.checked_mul(self.block_size)?;
        if begin >= piece_size {
            return None;
        }
        Some((piece_size - begin).min(self.block_size))
    }

    /// Absolute byte range of a block.
    ///
    /// # Errors
    ///
    /// - `StorageError::BlockOutOfRange` - If the address does not exist
    pub fn block_range(&self, piece: PieceIndex, block: u32) -> Result<(u64, usize), StorageError> {
        let len = self
            .block_len(piece, block)
            .ok_or(StorageError::BlockOutOfRange { piece, block })?;
        let offset = self.piece_offset(piece) + u64::from(block) * u64::from(self.block_size);
        Ok((offset, len as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_sizes_with_short_tail() {
        let layout = BlockLayout::new(32768, 70000);

        assert_eq!(layout.piece_count(), 3);
        assert_eq!(layout.piece_size(PieceIndex::new(0)), Some(32768));
        assert_eq!(layout.piece_size(PieceIndex::new(2)), Some(70000 - 65536));
        assert_eq!(layout.piece_size(PieceIndex::new(3)), None);
    }

    #[test]
    fn test_block_addressing() {
        let layout = BlockLayout::new(32768, 70000);

        assert_eq!(layout.block_len(PieceIndex::new(0), 1), Some(16384));
        assert_eq!(layout.block_len(PieceIndex::new(0), 2), None);
        assert_eq!(layout.block_len(PieceIndex::new(2), 0), Some(4464));
        assert_eq!(layout.block_len(PieceIndex::new(2), 1), None);

        let (offset, len) = layout.block_range(PieceIndex::new(1), 1).unwrap();
        assert_eq!(offset, 32768 + 16384);
        assert_eq!(len, 16384);
        assert!(layout.block_range(PieceIndex::new(9), 0).is_err());
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let layout = BlockLayout::new(16384, 16384 * 4);
        assert_eq!(layout.piece_count(), 4);
        assert_eq!(layout.blocks_in(16384), 1);
        assert_eq!(layout.piece_size(PieceIndex::new(3)), Some(16384));
    }
}
