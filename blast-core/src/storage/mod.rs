//! Storage layer for torrent data.
//!
//! Pieces never touch the disk as a whole: everything is addressed by
//! (piece, block) so a block is either stored completely or not at all.

pub mod file_store;
pub mod layout;
pub mod memory;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use async_trait::async_trait;
pub use file_store::FileBlockStore;
pub use layout::BlockLayout;
pub use memory::MemoryBlockStore;

use crate::torrent::PieceIndex;

/// Block-addressed persistence for torrent payload.
///
/// Implementations map a (piece, block) address to a byte range of the
/// underlying medium. Both calls move exactly one block.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Reads the full block at the given address.
    ///
    /// # Errors
    ///
    /// - `StorageError::BlockOutOfRange` - If the address is outside the torrent
    /// - `StorageError::Io` - If file system operation failed
    async fn read_block(&self, piece: PieceIndex, block: u32) -> Result<Vec<u8>, StorageError>;

    /// Writes one block in a single positioned write.
    ///
    /// # Errors
    ///
    /// - `StorageError::BlockOutOfRange` - If the address is outside the torrent
    /// - `StorageError::BlockSizeMismatch` - If `data` is not the block's exact size
    /// - `StorageError::Io` - If file system operation failed
    async fn write_block(
        &self,
        piece: PieceIndex,
        block: u32,
        data: &[u8],
    ) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Address does not exist in the torrent layout
    #[error("Block {block} of piece {piece} is out of range")]
    BlockOutOfRange {
        /// Piece the block was addressed in
        piece: PieceIndex,
        /// Block index within the piece
        block: u32,
    },

    /// Payload length disagrees with the layout
    #[error("Block {block} of piece {piece} must be {expected} bytes, got {actual}")]
    BlockSizeMismatch {
        piece: PieceIndex,
        block: u32,
        expected: usize,
        actual: usize,
    },

    /// Seed payload length disagrees with the layout
    #[error("Payload is {actual} bytes, layout expects {expected}")]
    PayloadLengthMismatch { expected: u64, actual: u64 },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
