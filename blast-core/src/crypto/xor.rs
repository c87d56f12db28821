//! Rolling XOR stream cipher used once the RSA exchange is done.

use rand::RngCore;

use super::{CryptoError, KeyPair};

/// Symmetric XOR key with independent encrypt and decrypt cursors.
///
/// Each direction walks the key on its own and wraps at the key length, so
/// interleaved reads and writes never disturb each other.
#[derive(Clone)]
pub struct XorKeyPair {
    key: Vec<u8>,
    encrypt_cursor: usize,
    decrypt_cursor: usize,
}

impl XorKeyPair {
    /// Generates a random key of `length` bytes.
    ///
    /// # Errors
    /// - `CryptoError::MalformedKey` - If `length` is zero
    pub fn generate(length: usize) -> Result<Self, CryptoError> {
        let mut key = vec![0u8; length];
        rand::rng().fill_bytes(&mut key);
        Self::from_key(key)
    }

    /// Wraps key bytes received from a peer.
    ///
    /// # Errors
    /// - `CryptoError::MalformedKey` - If `key` is empty
    pub fn from_key(key: Vec<u8>) -> Result<Self, CryptoError> {
        if key.is_empty() {
            return Err(CryptoError::MalformedKey {
                reason: "empty symmetric key".to_string(),
            });
        }
        Ok(Self {
            key,
            encrypt_cursor: 0,
            decrypt_cursor: 0,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    fn apply(key: &[u8], cursor: &mut usize, data: &[u8]) -> Vec<u8> {
        data.iter()
            .map(|byte| {
                let out = byte ^ key[*cursor];
                *cursor = (*cursor + 1) % key.len();
                out
            })
            .collect()
    }
}

impl std::fmt::Debug for XorKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorKeyPair")
            .field("key_len", &self.key.len())
            .field("encrypt_cursor", &self.encrypt_cursor)
            .field("decrypt_cursor", &self.decrypt_cursor)
            .finish()
    }
}

impl KeyPair for XorKeyPair {
    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::apply(&self.key, &mut self.encrypt_cursor, data))
    }

    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::apply(&self.key, &mut self.decrypt_cursor, data))
    }

    fn encrypted_block_size(&self) -> usize {
        1
    }
}
