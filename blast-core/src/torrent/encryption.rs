//! Key exchange run right after the handshake when both sides advertise
//! encryption.
//!
//! Both peers run the same sequence:
//!
//! 1. send a fresh RSA public key in plaintext
//! 2. read the peer's RSA public key
//! 3. decrypt reads with our private key, encrypt writes with the peer's key
//! 4. send a fresh XOR key over the RSA channel
//! 5. read the peer's XOR key
//! 6. decrypt reads with our XOR key, encrypt writes with the peer's
//!
//! Any other message during the exchange fails the connection, so a peer
//! can never fall back to plaintext.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use super::TorrentError;
use super::protocol::{CryptoReader, CryptoWriter, PeerMessage};
use crate::config::EncryptionConfig;
use crate::crypto::{RsaKeyPair, XorKeyPair};

/// Runs the key exchange and leaves both halves wrapped in the XOR cipher.
///
/// # Errors
/// - `TorrentError::EncryptionNegotiation` - Unexpected message or unusable key
/// - `TorrentError::Io` - Socket failed mid-exchange
pub async fn negotiate<R, W>(
    reader: &mut CryptoReader<R>,
    writer: &mut CryptoWriter<W>,
    config: &EncryptionConfig,
) -> Result<(), TorrentError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let local_rsa = RsaKeyPair::generate(config.rsa_bits)?;
    writer
        .write_message(&PeerMessage::SendRsaKey {
            modulus_bits: local_rsa.bits() as u32,
            public_key: local_rsa.public_key().clone(),
            modulus: local_rsa.modulus().clone(),
        })
        .await?;
    writer.flush().await?;

    let remote_rsa = match reader.read_message().await? {
        PeerMessage::SendRsaKey {
            modulus_bits,
            public_key,
            modulus,
        } => RsaKeyPair::from_public(modulus_bits as usize, public_key, modulus).map_err(|e| {
            TorrentError::EncryptionNegotiation {
                reason: format!("Unusable RSA key: {e}"),
            }
        })?,
        other => {
            return Err(TorrentError::EncryptionNegotiation {
                reason: format!("Expected RSA key, got {}", other.kind()),
            });
        }
    };
    tracing::trace!("RSA keys exchanged: remote_bits={}", remote_rsa.bits());

    reader.set_cipher(Box::new(local_rsa));
    writer.set_cipher(Box::new(remote_rsa));

    let local_xor = XorKeyPair::generate(config.xor_key_length)?;
    writer
        .write_message(&PeerMessage::SendSymmetricKey {
            key: Bytes::copy_from_slice(local_xor.key()),
        })
        .await?;
    writer.flush().await?;

    let remote_xor = match reader.read_message().await? {
        PeerMessage::SendSymmetricKey { key } => {
            XorKeyPair::from_key(key.to_vec()).map_err(|e| TorrentError::EncryptionNegotiation {
                reason: format!("Unusable symmetric key: {e}"),
            })?
        }
        other => {
            return Err(TorrentError::EncryptionNegotiation {
                reason: format!("Expected symmetric key, got {}", other.kind()),
            });
        }
    };

    reader.set_cipher(Box::new(local_xor));
    writer.set_cipher(Box::new(remote_xor));
    tracing::debug!("Encrypted session established");

    Ok(())
}
