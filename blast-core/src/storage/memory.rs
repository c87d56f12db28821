//! In-memory block storage

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BlockLayout, BlockStore, StorageError};
use crate::torrent::PieceIndex;

/// Block store holding the whole payload in memory.
///
/// Unwritten regions read back as zeros, matching a freshly pre-sized file.
pub struct MemoryBlockStore {
    layout: BlockLayout,
    payload: RwLock<Vec<u8>>,
}

impl MemoryBlockStore {
    /// Creates an empty, zero-filled store.
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            layout,
            payload: RwLock::new(vec![0u8; layout.total_length() as usize]),
        }
    }

    /// Creates a store pre-loaded with a full payload, as a seeder would have.
    ///
    /// # Errors
    ///
    /// - `StorageError::PayloadLengthMismatch` - If `payload` does not match the layout length
    pub fn with_payload(layout: BlockLayout, payload: Vec<u8>) -> Result<Self, StorageError> {
        if payload.len() as u64 != layout.total_length() {
            return Err(StorageError::PayloadLengthMismatch {
                expected: layout.total_length(),
                actual: payload.len() as u64,
            });
        }
        Ok(Self {
            layout,
            payload: RwLock::new(payload),
        })
    }

    /// Copy of the current payload.
    pub fn snapshot(&self) -> Vec<u8> {
        self.payload.read().clone()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn read_block(&self, piece: PieceIndex, block: u32) -> Result<Vec<u8>, StorageError> {
        let (offset, len) = self.layout.block_range(piece, block)?;
        let start = offset as usize;
        Ok(self.payload.read()[start..start + len].to_vec())
    }

    async fn write_block(
        &self,
        piece: PieceIndex,
        block: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let (offset, len) = self.layout.block_range(piece, block)?;
        if data.len() != len {
            return Err(StorageError::BlockSizeMismatch {
                piece,
                block,
                expected: len,
                actual: data.len(),
            });
        }
        let start = offset as usize;
        self.payload.write()[start..start + len].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_fixtures::patterned_bytes;

    #[tokio::test]
    async fn test_seeded_store_serves_blocks() {
        let layout = BlockLayout::new(32768, 50000);
        let payload = patterned_bytes(50000, 1);
        let store = MemoryBlockStore::with_payload(layout, payload.clone()).unwrap();

        let block = store.read_block(PieceIndex::new(1), 0).await.unwrap();
        assert_eq!(block, &payload[32768..49152]);

        let tail = store.read_block(PieceIndex::new(1), 1).await.unwrap();
        assert_eq!(tail, &payload[49152..]);
    }

    #[tokio::test]
    async fn test_write_is_visible_in_snapshot() {
        let layout = BlockLayout::new(16384, 20000);
        let store = MemoryBlockStore::new(layout);
        let tail = patterned_bytes(20000 - 16384, 9);

        store.write_block(PieceIndex::new(1), 0, &tail).await.unwrap();

        let snapshot = store.snapshot();
        assert!(snapshot[..16384].iter().all(|&b| b == 0));
        assert_eq!(&snapshot[16384..], tail.as_slice());
    }

    #[test]
    fn test_payload_length_must_match_layout() {
        let layout = BlockLayout::new(16384, 100);
        assert!(matches!(
            MemoryBlockStore::with_payload(layout, vec![0; 99]),
            Err(StorageError::PayloadLengthMismatch {
                expected: 100,
                actual: 99
            })
        ));
    }
}
