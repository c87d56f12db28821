//! BitTorrent download engine: pieces, scheduling, peers and lifecycle.

pub mod encryption;
pub mod manager;
pub mod metainfo;
pub mod peer_connection;
pub mod piece;
pub mod piece_manager;
pub mod protocol;
pub mod rate;
pub mod request;
pub mod session;
pub mod tracker;

use std::fmt;

pub use manager::TorrentManager;
pub use metainfo::{BencodeTorrentParser, TorrentCreator, TorrentMetadata, encode_torrent};
pub use peer_connection::{ConnectionRole, PeerConnection, PeerStatus, TorrentContext};
pub use piece::Piece;
pub use piece_manager::PieceManager;
pub use protocol::{Bitfield, PeerHandshake, PeerId, PeerMessage};
pub use rate::RateMeter;
pub use request::{PendingRequests, Request};
pub use session::{PeerStats, Torrent, TorrentState, TorrentStats};
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient};

use crate::crypto::CryptoError;
use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses the 40-character hex form.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - If the string is not 20 hex-encoded bytes
    pub fn from_hex(hex_str: &str) -> Result<Self, TorrentError> {
        let bytes = hex::decode(hex_str).map_err(|e| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid info hash hex: {e}"),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::InvalidTorrentFile {
                reason: format!("Info hash must be 20 bytes: {hex_str}"),
            })?;
        Ok(Self(hash))
    }

    /// URL-safe form used in tracker query strings.
    ///
    /// Unreserved characters pass through, every other byte becomes `%XX`.
    pub fn url_encoded(&self) -> String {
        url_encode_bytes(&self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Percent-encodes raw bytes for a query string.
pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers all failure modes in BitTorrent protocol operations including
/// file parsing, network communication, and data verification.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker request timed out: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker {url} returned status {status}")]
    TrackerServerError { url: String, status: u16 },

    #[error("Unsupported tracker URL: {url}")]
    UnsupportedTracker { url: String },

    #[error("Tracker {url} refused announce: {reason}")]
    TrackerFailure { url: String, reason: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Piece size {size} outside 1..={max} bytes")]
    InvalidPieceSize { size: u32, max: u32 },

    #[error("Rejected block at piece {piece} offset {offset}: {reason}")]
    InvalidBlock {
        piece: PieceIndex,
        offset: u32,
        reason: String,
    },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Handshake info hash {received} does not match {expected}")]
    InfoHashMismatch {
        expected: InfoHash,
        received: InfoHash,
    },

    #[error("Encryption negotiation failed: {reason}")]
    EncryptionNegotiation { reason: String },

    #[error("Encryption error")]
    Encryption(#[from] CryptoError),

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} is not running")]
    TorrentStopped { info_hash: InfoHash },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Whether the remote side broke the protocol, as opposed to a local
    /// failure or a clean close.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TorrentError::ProtocolError { .. }
                | TorrentError::InfoHashMismatch { .. }
                | TorrentError::EncryptionNegotiation { .. }
                | TorrentError::InvalidBlock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(InfoHash::from_hex(&info_hash.to_string()).unwrap(), info_hash);
    }

    #[test]
    fn test_info_hash_from_bad_hex() {
        assert!(InfoHash::from_hex("zz").is_err());
        assert!(InfoHash::from_hex("0123").is_err());
    }

    #[test]
    fn test_info_hash_url_encoding() {
        let mut hash = [b'a'; 20];
        hash[0] = 0x00;
        hash[1] = 0xff;
        hash[2] = b' ';
        hash[3] = b'~';
        let encoded = InfoHash::new(hash).url_encoded();
        assert!(encoded.starts_with("%00%FF%20~aaaa"));
        assert_eq!(encoded.len(), 9 + 1 + 16);
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.to_string(), "10");
    }

    #[test]
    fn test_protocol_violation_classification() {
        let violation = TorrentError::ProtocolError {
            message: "bad id".to_string(),
        };
        assert!(violation.is_protocol_violation());

        let io = TorrentError::Io(std::io::Error::other("reset"));
        assert!(!io.is_protocol_violation());
    }
}
