//! Socket halves that apply the session cipher to every frame.
//!
//! Without a cipher bytes pass through untouched. Once a cipher is set,
//! every plaintext byte occupies `encrypted_block_size()` bytes on the wire,
//! so the reader pulls whole ciphertext blocks before decrypting. Both halves
//! report the wire bytes they move to any attached rate meters.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::handshake::{HANDSHAKE_LEN, HandshakeCodec};
use super::messages::{MAX_FRAME_LENGTH, MessageCodec};
use super::types::{PeerHandshake, PeerMessage, message_id};
use crate::crypto::KeyPair;
use crate::storage::layout::BLOCK_SIZE;
use crate::torrent::TorrentError;
use crate::torrent::rate::RateMeter;

/// Plaintext bytes pulled from the socket per read.
const READ_CHUNK: usize = 4096;

/// Largest legal piece frame: id, index, offset and one block.
const MAX_PIECE_FRAME_LENGTH: u32 = 9 + BLOCK_SIZE;

/// Read half of a peer socket.
pub struct CryptoReader<R> {
    inner: R,
    cipher: Option<Box<dyn KeyPair>>,
    meters: Vec<Arc<RateMeter>>,
}

impl<R: AsyncRead + Unpin + Send> CryptoReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cipher: None,
            meters: Vec::new(),
        }
    }

    /// Records every byte read from the socket into `meter`.
    pub fn count_into(mut self, meter: Arc<RateMeter>) -> Self {
        self.meters.push(meter);
        self
    }

    /// Replaces the decrypting cipher for all subsequent reads.
    pub fn set_cipher(&mut self, cipher: Box<dyn KeyPair>) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Reads exactly `len` plaintext bytes.
    ///
    /// The buffer grows as ciphertext arrives, so a peer announcing a long
    /// frame cannot make us reserve its expanded size up front.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Socket closed or failed
    /// - `TorrentError::Encryption` - Ciphertext could not be decrypted
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TorrentError> {
        let block = self
            .cipher
            .as_ref()
            .map_or(1, |cipher| cipher.encrypted_block_size());
        let mut plain = Vec::with_capacity(len.min(READ_CHUNK));
        let mut wire = vec![0u8; len.min(READ_CHUNK) * block];

        while plain.len() < len {
            let chunk = &mut wire[..(len - plain.len()).min(READ_CHUNK) * block];
            self.inner.read_exact(chunk).await?;
            for meter in &self.meters {
                meter.record(chunk.len() as u64);
            }
            match self.cipher.as_mut() {
                Some(cipher) => plain.extend_from_slice(&cipher.decrypt(chunk)?),
                None => plain.extend_from_slice(chunk),
            }
        }
        Ok(plain)
    }

    /// Reads a 68-byte handshake.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Malformed handshake
    pub async fn read_handshake(&mut self) -> Result<PeerHandshake, TorrentError> {
        let data = self.read_exact(HANDSHAKE_LEN).await?;
        HandshakeCodec::deserialize_handshake(&data)
    }

    /// Reads one length-prefixed message.
    ///
    /// The message id is read before the body so a piece frame longer than
    /// one block is refused without reading its payload.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Oversized frame or undecodable message
    pub async fn read_message(&mut self) -> Result<PeerMessage, TorrentError> {
        let length_buf = self.read_exact(4).await?;
        let length = u32::from_be_bytes([length_buf[0], length_buf[1], length_buf[2], length_buf[3]]);

        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!("Frame of {length} bytes exceeds limit"),
            });
        }

        let mut frame = Vec::with_capacity(5);
        frame.extend_from_slice(&length_buf);
        if length > 0 {
            let id = self.read_exact(1).await?;
            if id[0] == message_id::PIECE && length > MAX_PIECE_FRAME_LENGTH {
                return Err(TorrentError::ProtocolError {
                    message: format!("Piece frame of {length} bytes exceeds one block"),
                });
            }
            frame.extend_from_slice(&id);
            frame.extend_from_slice(&self.read_exact(length as usize - 1).await?);
        }

        MessageCodec::deserialize_message(&frame)
    }
}

/// Write half of a peer socket.
pub struct CryptoWriter<W> {
    inner: W,
    cipher: Option<Box<dyn KeyPair>>,
    meters: Vec<Arc<RateMeter>>,
}

impl<W: AsyncWrite + Unpin + Send> CryptoWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            cipher: None,
            meters: Vec::new(),
        }
    }

    /// Records every byte written to the socket into `meter`.
    pub fn count_into(mut self, meter: Arc<RateMeter>) -> Self {
        self.meters.push(meter);
        self
    }

    /// Replaces the encrypting cipher for all subsequent writes.
    pub fn set_cipher(&mut self, cipher: Box<dyn KeyPair>) {
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypts and writes `data`. Not flushed.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Socket closed or failed
    /// - `TorrentError::Encryption` - Data could not be encrypted
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TorrentError> {
        let written = match self.cipher.as_mut() {
            Some(cipher) => {
                let encrypted = cipher.encrypt(data)?;
                self.inner.write_all(&encrypted).await?;
                encrypted.len()
            }
            None => {
                self.inner.write_all(data).await?;
                data.len()
            }
        };
        for meter in &self.meters {
            meter.record(written as u64);
        }
        Ok(())
    }

    pub async fn write_handshake(&mut self, handshake: &PeerHandshake) -> Result<(), TorrentError> {
        self.write_all(&HandshakeCodec::serialize_handshake(handshake))
            .await
    }

    pub async fn write_message(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.write_all(&MessageCodec::serialize_message(message))
            .await
    }

    pub async fn flush(&mut self) -> Result<(), TorrentError> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write direction.
    pub async fn shutdown(&mut self) -> Result<(), TorrentError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
