//! Key material used to encrypt a peer session.
//!
//! Sessions start with an RSA exchange, which is only used to carry a
//! symmetric XOR key. Both ciphers sit behind [`KeyPair`] so the transport
//! can swap one for the other without knowing which is active.

pub mod rsa;
pub mod xor;

pub use rsa::RsaKeyPair;
pub use xor::XorKeyPair;

/// Encryption capability applied to one direction of a socket.
///
/// `encrypt` maps every plaintext byte to `encrypted_block_size()` bytes of
/// ciphertext; `decrypt` expects input in whole blocks. Both take `&mut self`
/// because stream ciphers advance internal state.
pub trait KeyPair: Send {
    /// Encrypts a plaintext chunk.
    ///
    /// # Errors
    /// - `CryptoError::MissingKey` - If the pair cannot encrypt
    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypts a chunk made of whole ciphertext blocks.
    ///
    /// # Errors
    /// - `CryptoError::MissingKey` - If the pair holds no private key
    /// - `CryptoError::PartialBlock` - If `data` does not end on a block boundary
    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Ciphertext bytes produced per plaintext byte.
    fn encrypted_block_size(&self) -> usize;
}

/// Errors raised while generating or applying key material.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key size {bits}: must be a multiple of 8 and at least 16 bits")]
    InvalidKeySize { bits: usize },

    #[error("Key pair has no {which} key")]
    MissingKey { which: &'static str },

    #[error("Ciphertext of {len} bytes is not a multiple of the {block_size}-byte block")]
    PartialBlock { len: usize, block_size: usize },

    #[error("Malformed key material: {reason}")]
    MalformedKey { reason: String },
}
