//! BitTorrent handshake serialization and deserialization

use super::types::{PROTOCOL_ID, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Size of a handshake carrying the standard protocol identifier.
pub const HANDSHAKE_LEN: usize = 1 + PROTOCOL_ID.len() + 8 + 20 + 20;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);

        // Protocol name length
        buf.push(handshake.protocol.len() as u8);

        // Protocol name
        buf.extend_from_slice(handshake.protocol.as_bytes());

        // Reserved bytes
        buf.extend_from_slice(&handshake.reserved);

        // Info hash
        buf.extend_from_slice(handshake.info_hash.as_bytes());

        // Peer ID
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes a 68-byte handshake.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong length or protocol identifier
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::ProtocolError {
                message: format!("Handshake of {} bytes, expected {HANDSHAKE_LEN}", data.len()),
            });
        }

        let protocol_len = data[0] as usize;
        if protocol_len != PROTOCOL_ID.len() || &data[1..1 + protocol_len] != PROTOCOL_ID.as_bytes()
        {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Unsupported protocol identifier: {}",
                    String::from_utf8_lossy(&data[1..(1 + protocol_len).min(data.len())])
                ),
            });
        }

        let mut offset = 1 + protocol_len;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[offset..offset + 8]);
        offset += 8;

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[offset..offset + 20]);
        offset += 20;

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&data[offset..offset + 20]);

        Ok(PeerHandshake {
            protocol: PROTOCOL_ID.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        })
    }
}
