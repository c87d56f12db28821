//! Core types for the BitTorrent wire protocol

use bytes::Bytes;
use num_bigint::BigUint;

use crate::torrent::{InfoHash, PieceIndex};

/// Client prefix of generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-BL0100-";

/// Protocol identifier sent in every handshake.
pub const PROTOCOL_ID: &str = "BitTorrent protocol";

/// Reserved-field bit advertising encryption support.
const ENCRYPTION_BIT: usize = 60;

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer id: client prefix followed by 12 random ASCII digits.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        for byte in &mut id[8..] {
            *byte = b'0' + rand::random_range(0..10u8);
        }
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Message ids of the wire catalog.
pub mod message_id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SEND_RSA_KEY: u8 = 10;
    pub const SEND_SYMMETRIC_KEY: u8 = 11;
}

/// BitTorrent wire protocol messages.
///
/// The BEP 3 catalog plus two key-exchange messages that are only legal
/// while an encrypted session is being negotiated.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Inform peer that we are choking them
    Choke,
    /// Inform peer that we are no longer choking them
    Unchoke,
    /// Inform peer that we are interested in their pieces
    Interested,
    /// Inform peer that we are not interested in their pieces
    NotInterested,
    /// Inform peer that we have acquired a specific piece
    Have {
        /// Index of the piece we now have
        piece_index: PieceIndex,
    },
    /// Send our complete piece availability bitmap
    Bitfield {
        /// Bitmap indicating which pieces we have
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// Send a block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The actual block data
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Inform peer of our DHT port
    Port {
        port: u16,
    },
    /// RSA public key offered during encryption negotiation
    SendRsaKey {
        /// Modulus size the sender generated its key for
        modulus_bits: u32,
        /// Public exponent
        public_key: BigUint,
        modulus: BigUint,
    },
    /// Symmetric XOR key, sent over the RSA channel
    SendSymmetricKey {
        key: Bytes,
    },
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
            PeerMessage::SendRsaKey { .. } => "send-rsa-key",
            PeerMessage::SendSymmetricKey { .. } => "send-symmetric-key",
        }
    }

    /// Whether this is one of the key-exchange extension messages.
    pub fn is_key_exchange(&self) -> bool {
        matches!(
            self,
            PeerMessage::SendRsaKey { .. } | PeerMessage::SendSymmetricKey { .. }
        )
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_ID.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Sets or clears the encryption-support bit.
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        let (byte, mask) = encryption_bit();
        if enabled {
            self.reserved[byte] |= mask;
        } else {
            self.reserved[byte] &= !mask;
        }
        self
    }

    /// Whether the sender advertised encryption support.
    pub fn supports_encryption(&self) -> bool {
        let (byte, mask) = encryption_bit();
        self.reserved[byte] & mask == mask
    }
}

/// Byte index and mask of reserved bit 60. Bits count from the low end of
/// each byte, so the flag lands on 0x10 of the last reserved byte.
fn encryption_bit() -> (usize, u8) {
    (ENCRYPTION_BIT / 8, 1 << (ENCRYPTION_BIT % 8))
}
