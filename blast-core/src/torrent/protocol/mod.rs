//! BitTorrent wire protocol abstractions and message types.
//!
//! BitTorrent peer-to-peer protocol implementation following BEP 3, plus
//! the two key-exchange messages of the encrypted session. Defines message
//! types, handshake framing, piece bitmaps and the cipher-aware socket
//! halves used by peer connections.

pub mod bitfield;
pub mod handshake;
pub mod messages;
pub mod transport;
pub mod types;

// Re-export public API
pub use bitfield::Bitfield;
pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::{MAX_FRAME_LENGTH, MessageCodec};
pub use transport::{CryptoReader, CryptoWriter};
pub use types::{PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use super::types::CLIENT_PREFIX;
    use super::*;
    use crate::torrent::InfoHash;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate();
        let bytes = peer_id.as_bytes();

        assert_eq!(&bytes[..8], CLIENT_PREFIX);
        assert!(bytes[8..].iter().all(u8::is_ascii_digit));

        let peer_id2 = PeerId::generate();
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_peer_handshake_creation() {
        let info_hash = InfoHash::new([1u8; 20]);
        let peer_id = PeerId::new([2u8; 20]);

        let handshake = PeerHandshake::new(info_hash, peer_id);

        assert_eq!(handshake.protocol, "BitTorrent protocol");
        assert_eq!(handshake.info_hash, info_hash);
        assert_eq!(handshake.peer_id, peer_id);
        assert!(!handshake.supports_encryption());
        assert!(handshake.with_encryption(true).supports_encryption());
    }

    #[test]
    fn test_key_exchange_classification() {
        assert!(
            PeerMessage::SendSymmetricKey {
                key: bytes::Bytes::from_static(&[1])
            }
            .is_key_exchange()
        );
        assert!(!PeerMessage::Interested.is_key_exchange());
        assert_eq!(PeerMessage::KeepAlive.kind(), "keep-alive");
    }
}
