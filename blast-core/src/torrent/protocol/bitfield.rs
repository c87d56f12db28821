//! Piece availability bitmap exchanged after the handshake.

use std::sync::Arc;

use bytes::Bytes;

use crate::torrent::TorrentError;
use crate::torrent::piece::Piece;

/// Which pieces a side has.
///
/// Bits are numbered from the high bit of the first byte. Spare bits in the
/// last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an empty bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Parses a bitfield received from a peer.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong byte length or spare bits set
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self, TorrentError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Bitfield of {} bytes for {piece_count} pieces, expected {expected}",
                    bytes.len()
                ),
            });
        }

        let spare = expected * 8 - piece_count;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::ProtocolError {
                    message: "Bitfield has spare bits set".to_string(),
                });
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            piece_count,
        })
    }

    /// Bitfield of the verified pieces in `pieces`.
    pub fn from_pieces(pieces: &[Arc<Piece>]) -> Self {
        let mut bitfield = Self::new(pieces.len());
        for (index, piece) in pieces.iter().enumerate() {
            if piece.is_complete() {
                bitfield.set(index);
            }
        }
        bitfield
    }

    /// Returns true if the piece at `index` is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Marks the piece at `index` available. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
    }

    /// Number of available pieces.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Payload of a `Bitfield` message.
    pub fn to_payload(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;
    use crate::torrent::piece::sha1_digest;
    use crate::storage::layout::BLOCK_SIZE;
    use crate::storage::{BlockLayout, BlockStore, MemoryBlockStore};

    #[test]
    fn test_bit_order_is_high_bit_first() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);
        assert_eq!(bitfield.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(9));
        assert!(!bitfield.has(10));
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_set_out_of_range_is_ignored() {
        let mut bitfield = Bitfield::new(3);
        bitfield.set(3);
        bitfield.set(100);
        assert_eq!(bitfield.count(), 0);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Bitfield::from_bytes(&[0xff], 9).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x80, 0x00], 9).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x80], 9).is_ok());
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        assert!(Bitfield::from_bytes(&[0b1110_0001], 3).is_err());
        let bitfield = Bitfield::from_bytes(&[0b1110_0000], 3).unwrap();
        assert!(bitfield.is_complete());
    }

    #[test]
    fn test_whole_bytes_have_no_spare_bits() {
        let bitfield = Bitfield::from_bytes(&[0xff, 0xff], 16).unwrap();
        assert!(bitfield.is_complete());
        assert_eq!(bitfield.piece_count(), 16);
    }

    #[tokio::test]
    async fn test_from_pieces_marks_verified_pieces() {
        let data = vec![7u8; BLOCK_SIZE as usize];
        let layout = BlockLayout::new(BLOCK_SIZE, 2 * u64::from(BLOCK_SIZE));
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new(layout));
        let pieces: Vec<Arc<Piece>> = (0..2)
            .map(|i| {
                Arc::new(
                    Piece::new(PieceIndex::new(i), BLOCK_SIZE, sha1_digest(&data), Some(store.clone()))
                        .unwrap(),
                )
            })
            .collect();

        pieces[1].feed(0, &data).await.unwrap();
        assert!(pieces[1].check().await.unwrap());

        let bitfield = Bitfield::from_pieces(&pieces);
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
        assert_eq!(bitfield.to_payload().as_ref(), &[0b0100_0000]);
    }
}
