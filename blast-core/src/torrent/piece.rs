//! Hash-verified piece built from fixed-size blocks.
//!
//! A piece tracks which of its blocks arrived, whether the whole piece
//! verified against its SHA-1 signature, and which connections currently
//! have a request out for each block.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::request::{PendingRequests, Request};
use super::{PieceIndex, TorrentError};
use crate::storage::BlockStore;
use crate::storage::layout::{BLOCK_SIZE, MAX_BLOCKS_PER_PIECE};

/// One piece of a torrent.
///
/// Bookkeeping sits behind a short-lived mutex. Store I/O for `feed` and
/// verification is serialized by a second, async lock so a block is written
/// at most once and two verifications never race.
pub struct Piece {
    index: PieceIndex,
    size: u32,
    block_count: u32,
    signature: [u8; 20],
    store: Option<Arc<dyn BlockStore>>,
    state: Mutex<PieceState>,
    io: tokio::sync::Mutex<()>,
}

struct PieceState {
    received: BTreeSet<u32>,
    complete: bool,
    requests: Vec<Vec<(Request, Arc<PendingRequests>)>>,
}

impl Piece {
    /// Creates an empty piece.
    ///
    /// Without a store the piece still tracks received blocks but can never
    /// verify, so it never becomes complete.
    ///
    /// # Errors
    /// - `TorrentError::InvalidPieceSize` - If `size` is zero or above 32 blocks
    pub fn new(
        index: PieceIndex,
        size: u32,
        signature: [u8; 20],
        store: Option<Arc<dyn BlockStore>>,
    ) -> Result<Self, TorrentError> {
        let max = MAX_BLOCKS_PER_PIECE * BLOCK_SIZE;
        if size == 0 || size > max {
            return Err(TorrentError::InvalidPieceSize { size, max });
        }

        let block_count = size.div_ceil(BLOCK_SIZE);
        Ok(Self {
            index,
            size,
            block_count,
            signature,
            store,
            state: Mutex::new(PieceState {
                received: BTreeSet::new(),
                complete: false,
                requests: vec![Vec::new(); block_count as usize],
            }),
            io: tokio::sync::Mutex::new(()),
        })
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Byte offset of a block inside the piece.
    pub fn block_offset(&self, block: u32) -> u32 {
        block * BLOCK_SIZE
    }

    /// Size of a block; only the last one may be short.
    pub fn block_size(&self, block: u32) -> u32 {
        BLOCK_SIZE.min(self.size.saturating_sub(BLOCK_SIZE * block))
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().received.is_empty()
    }

    pub fn received_count(&self) -> u32 {
        self.state.lock().received.len() as u32
    }

    /// Percentage of blocks received, 0.0 to 100.0.
    pub fn completeness(&self) -> f64 {
        100.0 * self.received_count() as f64 / self.block_count as f64
    }

    /// Bytes of this piece not received yet.
    pub fn left(&self) -> u64 {
        let state = self.state.lock();
        let received: u64 = state
            .received
            .iter()
            .map(|&block| u64::from(self.block_size(block)))
            .sum();
        u64::from(self.size) - received
    }

    /// Stores a block received from a peer.
    ///
    /// Returns `true` when the block was new. A block already received is a
    /// silent no-op. On first receipt every pending request for the block is
    /// cancelled on the connection that made it.
    ///
    /// # Errors
    /// - `TorrentError::InvalidBlock` - If `begin` is misaligned or out of range,
    ///   or the payload is not exactly the block's size
    /// - `TorrentError::Storage` - If the store rejects the write
    pub async fn feed(&self, begin: u32, data: &[u8]) -> Result<bool, TorrentError> {
        let block = self.block_at(begin)?;
        let expected = self.block_size(block) as usize;
        if data.len() != expected {
            let reason = if data.len() > BLOCK_SIZE as usize {
                format!("{} bytes exceeds the {BLOCK_SIZE}-byte block size", data.len())
            } else {
                format!("expected {expected} bytes, got {}", data.len())
            };
            return Err(TorrentError::InvalidBlock {
                piece: self.index,
                offset: begin,
                reason,
            });
        }

        let _io = self.io.lock().await;
        if self.state.lock().received.contains(&block) {
            return Ok(false);
        }

        if let Some(store) = &self.store {
            store.write_block(self.index, block, data).await?;
        }

        let cancelled = {
            let mut state = self.state.lock();
            state.received.insert(block);
            std::mem::take(&mut state.requests[block as usize])
        };
        for (request, owner) in cancelled {
            if owner.remove(request.piece_index, request.begin).is_some() {
                tracing::trace!(
                    "Cancelled duplicate request: piece={}, begin={}, owner={}",
                    self.index,
                    request.begin,
                    owner.owner_id()
                );
            }
        }

        Ok(true)
    }

    /// Verifies the piece once every block has arrived.
    ///
    /// Already-complete pieces return `true` without I/O. A piece with
    /// missing blocks returns `false`. Otherwise every block is re-read and
    /// hashed; a mismatch resets the piece.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - If a block cannot be read back
    pub async fn check(&self) -> Result<bool, TorrentError> {
        let _io = self.io.lock().await;
        {
            let state = self.state.lock();
            if state.complete {
                return Ok(true);
            }
            if state.received.len() as u32 != self.block_count {
                return Ok(false);
            }
        }
        self.verify_locked().await
    }

    /// Hashes whatever the store currently holds for this piece.
    ///
    /// Used at start-up to pick up data from an earlier run: a match marks
    /// every block received and the piece complete, a mismatch resets it.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - If a block cannot be read back
    pub async fn verify_existing(&self) -> Result<bool, TorrentError> {
        let _io = self.io.lock().await;
        self.verify_locked().await
    }

    async fn verify_locked(&self) -> Result<bool, TorrentError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        let mut hasher = Sha1::new();
        for block in 0..self.block_count {
            let data = store.read_block(self.index, block).await?;
            hasher.update(&data);
        }
        let digest = hasher.finalize();

        let mut state = self.state.lock();
        if digest.as_slice() == self.signature.as_slice() {
            state.received = (0..self.block_count).collect();
            state.complete = true;
            tracing::debug!("Piece verified: piece={}", self.index);
            Ok(true)
        } else {
            if !state.received.is_empty() {
                tracing::warn!("Piece hash mismatch, resetting: piece={}", self.index);
            }
            state.received.clear();
            state.complete = false;
            Ok(false)
        }
    }

    /// Reads a block of a verified piece for upload.
    ///
    /// Returns `None` if the piece is not complete or `begin` is not a
    /// block boundary inside the piece.
    ///
    /// # Errors
    /// - `TorrentError::Storage` - If the store read fails
    pub async fn read_block_at(&self, begin: u32) -> Result<Option<Vec<u8>>, TorrentError> {
        let Ok(block) = self.block_at(begin) else {
            return Ok(None);
        };
        let Some(store) = &self.store else {
            return Ok(None);
        };
        if !self.is_complete() {
            return Ok(None);
        }
        Ok(Some(store.read_block(self.index, block).await?))
    }

    /// Unreceived block with the fewest pending requests, lowest index first.
    pub fn least_requested_block_index(&self) -> Option<u32> {
        self.least_requested_block(None)
    }

    /// Like [`Self::least_requested_block_index`] but skips blocks `owner`
    /// already asked for.
    pub fn least_requested_block_for(&self, owner: &Arc<PendingRequests>) -> Option<u32> {
        self.least_requested_block(Some(owner))
    }

    fn least_requested_block(&self, skip_owner: Option<&Arc<PendingRequests>>) -> Option<u32> {
        let state = self.state.lock();
        (0..self.block_count)
            .filter(|block| !state.received.contains(block))
            .filter(|&block| {
                skip_owner.is_none_or(|owner| {
                    !state.requests[block as usize]
                        .iter()
                        .any(|(_, requester)| Arc::ptr_eq(requester, owner))
                })
            })
            .min_by_key(|&block| state.requests[block as usize].len())
    }

    /// Mean number of pending (request, requester) pairs per block.
    pub fn average_request_count(&self) -> f64 {
        let state = self.state.lock();
        let pairs: usize = state.requests.iter().map(Vec::len).sum();
        pairs as f64 / self.block_count as f64
    }

    /// Records that `owner` has a request out for a block of this piece.
    pub fn add_request(&self, request: Request, owner: Arc<PendingRequests>) {
        let Ok(block) = self.block_at(request.begin) else {
            tracing::warn!(
                "Ignoring request outside piece: piece={}, begin={}",
                self.index,
                request.begin
            );
            return;
        };
        self.state.lock().requests[block as usize].push((request, owner));
    }

    /// Forgets `owner`'s request for the block at `begin`.
    pub fn remove_request(&self, begin: u32, owner: &Arc<PendingRequests>) {
        let Ok(block) = self.block_at(begin) else {
            return;
        };
        self.state.lock().requests[block as usize]
            .retain(|(_, requester)| !Arc::ptr_eq(requester, owner));
    }

    /// Pending pairs registered against one block.
    pub fn pending_requests_for(&self, block: u32) -> usize {
        self.state
            .lock()
            .requests
            .get(block as usize)
            .map_or(0, Vec::len)
    }

    fn block_at(&self, begin: u32) -> Result<u32, TorrentError> {
        if begin % BLOCK_SIZE != 0 {
            return Err(TorrentError::InvalidBlock {
                piece: self.index,
                offset: begin,
                reason: format!("offset is not a multiple of {BLOCK_SIZE}"),
            });
        }
        if begin >= self.size {
            return Err(TorrentError::InvalidBlock {
                piece: self.index,
                offset: begin,
                reason: format!("offset beyond piece size {}", self.size),
            });
        }
        Ok(begin / BLOCK_SIZE)
    }
}

impl std::fmt::Debug for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("block_count", &self.block_count)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// SHA-1 digest of a byte slice.
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let hash = hasher.finalize();

    let mut hash_array = [0u8; 20];
    hash_array.copy_from_slice(&hash);
    hash_array
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlockLayout, MemoryBlockStore};
    use crate::storage::test_fixtures::patterned_bytes;

    const PIECE_SIZE: u32 = 3 * BLOCK_SIZE + 1000;

    fn piece_with_store(payload: &[u8]) -> (Piece, Arc<MemoryBlockStore>) {
        let layout = BlockLayout::new(PIECE_SIZE, u64::from(PIECE_SIZE));
        let store = Arc::new(MemoryBlockStore::new(layout));
        let piece = Piece::new(
            PieceIndex::new(0),
            PIECE_SIZE,
            sha1_digest(payload),
            Some(store.clone() as Arc<dyn BlockStore>),
        )
        .unwrap();
        (piece, store)
    }

    fn block_of(payload: &[u8], block: u32) -> &[u8] {
        let start = (block * BLOCK_SIZE) as usize;
        let end = (start + BLOCK_SIZE as usize).min(payload.len());
        &payload[start..end]
    }

    #[tokio::test]
    async fn test_completeness_progression_with_duplicate() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 4);
        let (piece, _store) = piece_with_store(&payload);
        assert_eq!(piece.block_count(), 4);

        let mut progression = Vec::new();
        for block in [0, 3, 1, 0, 2] {
            piece
                .feed(block * BLOCK_SIZE, block_of(&payload, block))
                .await
                .unwrap();
            progression.push(piece.completeness());
        }

        assert_eq!(progression, vec![25.0, 50.0, 75.0, 75.0, 100.0]);
        assert!(piece.check().await.unwrap());
        assert!(piece.is_complete());
        assert_eq!(piece.left(), 0);
    }

    #[tokio::test]
    async fn test_refeed_is_idempotent() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 5);
        let (piece, _store) = piece_with_store(&payload);

        assert!(piece.feed(0, block_of(&payload, 0)).await.unwrap());
        assert!(!piece.feed(0, block_of(&payload, 0)).await.unwrap());
        assert_eq!(piece.received_count(), 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_resets_piece() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 6);
        let (piece, _store) = piece_with_store(&payload);

        for block in 0..4 {
            let mut data = block_of(&payload, block).to_vec();
            if block == 2 {
                data[10] ^= 0xFF;
            }
            piece.feed(block * BLOCK_SIZE, &data).await.unwrap();
        }

        assert!(!piece.check().await.unwrap());
        assert!(!piece.is_complete());
        assert!(piece.is_empty());
        assert_eq!(piece.least_requested_block_index(), Some(0));
    }

    #[tokio::test]
    async fn test_check_incomplete_returns_false_without_reset() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 7);
        let (piece, _store) = piece_with_store(&payload);

        piece.feed(0, block_of(&payload, 0)).await.unwrap();
        assert!(!piece.check().await.unwrap());
        assert_eq!(piece.received_count(), 1);
    }

    #[tokio::test]
    async fn test_verify_existing_picks_up_stored_data() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 8);
        let layout = BlockLayout::new(PIECE_SIZE, u64::from(PIECE_SIZE));
        let store = Arc::new(MemoryBlockStore::with_payload(layout, payload.clone()).unwrap());
        let piece = Piece::new(
            PieceIndex::new(0),
            PIECE_SIZE,
            sha1_digest(&payload),
            Some(store as Arc<dyn BlockStore>),
        )
        .unwrap();

        assert!(piece.verify_existing().await.unwrap());
        assert!(piece.is_complete());
        assert_eq!(piece.completeness(), 100.0);
        assert_eq!(piece.least_requested_block_index(), None);

        let tail = piece.read_block_at(3 * BLOCK_SIZE).await.unwrap().unwrap();
        assert_eq!(tail.len(), 1000);
    }

    #[tokio::test]
    async fn test_feed_rejects_bad_blocks() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 9);
        let (piece, _store) = piece_with_store(&payload);

        let misaligned = piece.feed(100, &payload[..16384]).await;
        assert!(matches!(misaligned, Err(TorrentError::InvalidBlock { .. })));

        let short = piece.feed(BLOCK_SIZE, &payload[..1000]).await;
        assert!(matches!(short, Err(TorrentError::InvalidBlock { .. })));

        let too_long = piece.feed(0, &vec![0u8; 16385]).await;
        assert!(matches!(too_long, Err(TorrentError::InvalidBlock { .. })));

        let beyond = piece.feed(4 * BLOCK_SIZE, &payload[..1000]).await;
        assert!(matches!(beyond, Err(TorrentError::InvalidBlock { .. })));

        assert!(piece.is_empty());
    }

    #[test]
    fn test_piece_size_bounds() {
        assert!(matches!(
            Piece::new(PieceIndex::new(0), 0, [0; 20], None),
            Err(TorrentError::InvalidPieceSize { .. })
        ));
        assert!(Piece::new(PieceIndex::new(0), 32 * BLOCK_SIZE + 1, [0; 20], None).is_err());
        assert!(Piece::new(PieceIndex::new(0), 32 * BLOCK_SIZE, [0; 20], None).is_ok());
    }

    #[tokio::test]
    async fn test_least_requested_block_prefers_fewest_then_lowest() {
        let piece = Piece::new(PieceIndex::new(1), PIECE_SIZE, [0; 20], None).unwrap();
        let first = PendingRequests::new();
        let second = PendingRequests::new();

        assert_eq!(piece.least_requested_block_index(), Some(0));

        piece.add_request(Request::new(PieceIndex::new(1), 0, BLOCK_SIZE), first.clone());
        assert_eq!(piece.least_requested_block_index(), Some(1));

        piece.add_request(Request::new(PieceIndex::new(1), BLOCK_SIZE, BLOCK_SIZE), first.clone());
        piece.add_request(Request::new(PieceIndex::new(1), 2 * BLOCK_SIZE, BLOCK_SIZE), second.clone());
        piece.add_request(Request::new(PieceIndex::new(1), 3 * BLOCK_SIZE, 1000), second.clone());
        assert_eq!(piece.least_requested_block_index(), Some(0));
        assert_eq!(piece.least_requested_block_for(&first), Some(2));
        assert_eq!(piece.average_request_count(), 1.0);

        piece.feed(0, &vec![0u8; BLOCK_SIZE as usize]).await.unwrap();
        assert_eq!(piece.least_requested_block_index(), Some(1));

        piece.remove_request(BLOCK_SIZE, &first);
        assert_eq!(piece.pending_requests_for(1), 0);
    }

    #[tokio::test]
    async fn test_least_requested_never_returns_received_block() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 2);
        let piece = Piece::new(PieceIndex::new(0), PIECE_SIZE, [0; 20], None).unwrap();
        let mut received = Vec::new();

        for block in [1, 0, 3] {
            piece
                .feed(block * BLOCK_SIZE, block_of(&payload, block))
                .await
                .unwrap();
            received.push(block);

            let least = piece.least_requested_block_index().unwrap();
            assert!(!received.contains(&least));
        }

        piece
            .feed(2 * BLOCK_SIZE, block_of(&payload, 2))
            .await
            .unwrap();
        assert_eq!(piece.least_requested_block_index(), None);

        // No store attached, so the piece cannot verify.
        assert!(!piece.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_first_receipt_cancels_requests_on_every_connection() {
        let payload = patterned_bytes(PIECE_SIZE as usize, 3);
        let (piece, _store) = piece_with_store(&payload);
        let first = PendingRequests::new();
        let second = PendingRequests::new();

        for owner in [&first, &second] {
            let request = Request::new(PieceIndex::new(0), BLOCK_SIZE, BLOCK_SIZE);
            owner.push(request.clone());
            piece.add_request(request, owner.clone());
        }
        assert_eq!(piece.pending_requests_for(1), 2);

        piece
            .feed(BLOCK_SIZE, block_of(&payload, 1))
            .await
            .unwrap();

        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(piece.pending_requests_for(1), 0);
    }
}
