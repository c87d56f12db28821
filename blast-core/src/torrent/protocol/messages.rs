//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::types::{PeerMessage, message_id};
use crate::crypto::rsa::{from_signed_bytes, to_signed_bytes};
use crate::storage::layout::BLOCK_SIZE;
use crate::torrent::{PieceIndex, TorrentError};

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LENGTH: u32 = 1 << 20;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message into a length-prefixed frame.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0
            }
            PeerMessage::Choke => {
                buf.put_u32(1); // Length = 1
                buf.put_u8(message_id::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(message_id::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(message_id::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(message_id::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(message_id::HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(message_id::BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // Length = 1 + 4 + 4 + 4
                buf.put_u8(message_id::REQUEST);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // Length = 1 + 4 + 4 + data.len()
                buf.put_u8(message_id::PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(message_id::CANCEL);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3); // Length = 1 + 2
                buf.put_u8(message_id::PORT);
                buf.put_u16(*port);
            }
            PeerMessage::SendRsaKey {
                modulus_bits,
                public_key,
                modulus,
            } => {
                let key = to_signed_bytes(public_key);
                let modulus = to_signed_bytes(modulus);
                // Length = 1 + 4 + (4 + key) + (4 + modulus)
                buf.put_u32(13 + key.len() as u32 + modulus.len() as u32);
                buf.put_u8(message_id::SEND_RSA_KEY);
                buf.put_u32(*modulus_bits);
                buf.put_u32(key.len() as u32);
                buf.extend_from_slice(&key);
                buf.put_u32(modulus.len() as u32);
                buf.extend_from_slice(&modulus);
            }
            PeerMessage::SendSymmetricKey { key } => {
                buf.put_u32(1 + key.len() as u32);
                buf.put_u8(message_id::SEND_SYMMETRIC_KEY);
                buf.extend_from_slice(key);
            }
        }

        buf
    }

    /// Deserializes one complete frame.
    ///
    /// The frame must be exactly `4 + length` bytes. Fixed-shape messages
    /// must carry their exact length; anything else would desynchronize the
    /// stream, so it is an error rather than skipped.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Unknown id, wrong length or malformed payload
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(protocol_error("Message too short"));
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length > MAX_FRAME_LENGTH {
            return Err(protocol_error(format!("Frame of {length} bytes exceeds limit")));
        }
        if buf.remaining() != length as usize {
            return Err(protocol_error(format!(
                "Frame declares {length} bytes but carries {}",
                buf.remaining()
            )));
        }

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = buf.get_u8();

        match message_id {
            message_id::CHOKE => expect_length(length, 1, "Choke").map(|_| PeerMessage::Choke),
            message_id::UNCHOKE => {
                expect_length(length, 1, "Unchoke").map(|_| PeerMessage::Unchoke)
            }
            message_id::INTERESTED => {
                expect_length(length, 1, "Interested").map(|_| PeerMessage::Interested)
            }
            message_id::NOT_INTERESTED => {
                expect_length(length, 1, "NotInterested").map(|_| PeerMessage::NotInterested)
            }
            message_id::HAVE => {
                expect_length(length, 5, "Have")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            message_id::BITFIELD => {
                let bitfield = Bytes::copy_from_slice(buf);
                Ok(PeerMessage::Bitfield { bitfield })
            }
            message_id::REQUEST => {
                expect_length(length, 13, "Request")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                })
            }
            message_id::PIECE => {
                if length < 9 || length > 9 + BLOCK_SIZE {
                    return Err(protocol_error(format!(
                        "Invalid Piece message length {length}"
                    )));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data = Bytes::copy_from_slice(buf);
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                })
            }
            message_id::CANCEL => {
                expect_length(length, 13, "Cancel")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Cancel {
                    piece_index,
                    offset,
                    length,
                })
            }
            message_id::PORT => {
                expect_length(length, 3, "Port")?;
                let port = buf.get_u16();
                Ok(PeerMessage::Port { port })
            }
            message_id::SEND_RSA_KEY => Self::deserialize_rsa_key(buf),
            message_id::SEND_SYMMETRIC_KEY => {
                if length < 2 {
                    return Err(protocol_error("Empty symmetric key"));
                }
                Ok(PeerMessage::SendSymmetricKey {
                    key: Bytes::copy_from_slice(buf),
                })
            }
            _ => Err(protocol_error(format!("Unknown message ID: {message_id}"))),
        }
    }

    fn deserialize_rsa_key(mut buf: &[u8]) -> Result<PeerMessage, TorrentError> {
        if buf.remaining() < 8 {
            return Err(protocol_error("Invalid SendRsaKey message length"));
        }
        let modulus_bits = buf.get_u32();

        let key_len = buf.get_u32() as usize;
        if buf.remaining() < key_len + 4 {
            return Err(protocol_error("SendRsaKey key length overruns frame"));
        }
        let public_key = from_signed_bytes(&buf[..key_len])
            .map_err(|e| protocol_error(format!("Invalid RSA public key: {e}")))?;
        buf.advance(key_len);

        let modulus_len = buf.get_u32() as usize;
        if buf.remaining() != modulus_len {
            return Err(protocol_error("SendRsaKey modulus length does not match frame"));
        }
        let modulus = from_signed_bytes(buf)
            .map_err(|e| protocol_error(format!("Invalid RSA modulus: {e}")))?;

        Ok(PeerMessage::SendRsaKey {
            modulus_bits,
            public_key,
            modulus,
        })
    }
}

fn expect_length(actual: u32, expected: u32, name: &str) -> Result<(), TorrentError> {
    if actual != expected {
        return Err(protocol_error(format!(
            "Invalid {name} message length {actual}, expected {expected}"
        )));
    }
    Ok(())
}

fn protocol_error(message: impl Into<String>) -> TorrentError {
    TorrentError::ProtocolError {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_message_serialization() {
        let test_cases = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(42),
            },
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000, 0xff]),
            },
            PeerMessage::Request {
                piece_index: PieceIndex::new(10),
                offset: 16384,
                length: 16384,
            },
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(10),
                offset: 0,
                length: 16384,
            },
            PeerMessage::Port { port: 6881 },
            PeerMessage::SendRsaKey {
                modulus_bits: 128,
                public_key: BigUint::from(65537u32),
                modulus: BigUint::from(0xC3A5_9F11_0B7D_2E41u64),
            },
            PeerMessage::SendSymmetricKey {
                key: Bytes::from_static(&[9, 8, 7, 6]),
            },
        ];

        for original_message in test_cases {
            let serialized = MessageCodec::serialize_message(&original_message);
            let deserialized = MessageCodec::deserialize_message(&serialized).unwrap();
            assert_eq!(original_message, deserialized);
        }
    }

    #[test]
    fn test_have_wire_layout() {
        let serialized = MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(7),
        });
        assert_eq!(serialized, vec![0, 0, 0, 5, 4, 0, 0, 0, 7]);

        match MessageCodec::deserialize_message(&serialized).unwrap() {
            PeerMessage::Have { piece_index } => assert_eq!(piece_index.as_u32(), 7),
            other => panic!("Expected Have message, got {other:?}"),
        }
    }

    #[test]
    fn test_rsa_key_wire_layout() {
        let message = PeerMessage::SendRsaKey {
            modulus_bits: 16,
            public_key: BigUint::from(65537u32),
            modulus: BigUint::from(0xB5E3u32),
        };
        let serialized = MessageCodec::serialize_message(&message);

        // 13 + 3 key bytes + 3 modulus bytes (sign byte kept)
        assert_eq!(&serialized[..5], &[0, 0, 0, 19, 10]);
        assert_eq!(&serialized[5..9], &[0, 0, 0, 16]);
        assert_eq!(&serialized[9..16], &[0, 0, 0, 3, 1, 0, 1]);
        assert_eq!(&serialized[16..], &[0, 0, 0, 3, 0, 0xB5, 0xE3]);
    }

    #[test]
    fn test_piece_message_with_data() {
        let piece_data = Bytes::from(vec![1, 2, 3, 4, 5]);
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: piece_data.clone(),
        };

        let serialized = MessageCodec::serialize_message(&message);
        let deserialized = MessageCodec::deserialize_message(&serialized).unwrap();

        if let PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } = deserialized
        {
            assert_eq!(piece_index.as_u32(), 0);
            assert_eq!(offset, 0);
            assert_eq!(data, piece_data);
        } else {
            panic!("Expected Piece message");
        }
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let result = MessageCodec::deserialize_message(&[0, 0, 0, 1, 12]);
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[test]
    fn test_wrong_fixed_lengths_are_rejected() {
        // Choke carrying a payload byte
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 2, 0, 1]).is_err());
        // Have with a 3-byte index
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 4, 4, 0, 0, 7]).is_err());
        // Request one byte short
        let mut request = vec![0, 0, 0, 12, 6];
        request.extend_from_slice(&[0; 11]);
        assert!(MessageCodec::deserialize_message(&request).is_err());
        // Port with a 4-byte payload
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 9, 0, 0, 26, 225]).is_err());
    }

    #[test]
    fn test_frame_length_must_match_buffer() {
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 1, 0, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0]).is_err());
    }

    #[test]
    fn test_oversized_piece_is_rejected() {
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(0),
            offset: 0,
            data: Bytes::from(vec![0u8; BLOCK_SIZE as usize + 1]),
        };
        let serialized = MessageCodec::serialize_message(&message);
        assert!(MessageCodec::deserialize_message(&serialized).is_err());
    }

    #[test]
    fn test_malformed_rsa_key_is_rejected() {
        // key length claims 10 bytes, only 2 present
        let frame = [0, 0, 0, 11, 10, 0, 0, 0, 16, 0, 0, 0, 10, 1, 1];
        assert!(MessageCodec::deserialize_message(&frame).is_err());
    }

    proptest! {
        #[test]
        fn prop_piece_messages_survive_the_codec(
            index in any::<u32>(),
            offset in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let message = PeerMessage::Piece {
                piece_index: PieceIndex::new(index),
                offset,
                data: Bytes::from(data),
            };
            let serialized = MessageCodec::serialize_message(&message);
            prop_assert_eq!(MessageCodec::deserialize_message(&serialized).unwrap(), message);
        }
    }
}
