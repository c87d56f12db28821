//! Byte-per-block RSA used to bootstrap an encrypted session.
//!
//! Every plaintext byte is raised to the public exponent on its own and
//! written as a fixed `bits / 8 + 1` byte block, big-endian, zero padded on
//! the left. Decryption keeps the low byte of each decrypted block. The
//! scheme only ever carries a short symmetric key, so throughput is not a
//! concern.

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngCore;

use super::{CryptoError, KeyPair};

/// Public exponent, 2^16 + 1.
pub const PUBLIC_EXPONENT: u32 = 65537;

/// Smallest modulus size that still encrypts a whole byte.
pub const MIN_KEY_BITS: usize = 16;

/// Bases tried by every primality test before the random rounds.
const SMALL_PRIMES: [u32; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

const RANDOM_WITNESS_ROUNDS: usize = 8;

/// RSA key pair, or just a public key when built from a peer's message.
#[derive(Debug, Clone)]
pub struct RsaKeyPair {
    modulus: BigUint,
    public_key: BigUint,
    private_key: Option<BigUint>,
    bits: usize,
}

impl RsaKeyPair {
    /// Generates a fresh pair with a modulus of roughly `bits` bits.
    ///
    /// # Errors
    /// - `CryptoError::InvalidKeySize` - If `bits` is not a multiple of 8 or below 16
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        validate_bits(bits)?;

        let public_key = BigUint::from(PUBLIC_EXPONENT);
        let half = bits / 2;
        loop {
            let p = probable_prime(half);
            let mut q = probable_prime(half);
            while q == p {
                q = probable_prime(half);
            }

            let one = BigUint::one();
            let phi = (&p - &one) * (&q - &one);
            if !public_key.gcd(&phi).is_one() {
                continue;
            }
            let Some(private_key) = public_key.modinv(&phi) else {
                continue;
            };

            let modulus = p * q;
            tracing::trace!("Generated RSA key pair: bits={bits}, modulus={modulus}");
            return Ok(Self {
                modulus,
                public_key,
                private_key: Some(private_key),
                bits,
            });
        }
    }

    /// Builds an encrypt-only pair from a peer's advertised key.
    ///
    /// # Errors
    /// - `CryptoError::InvalidKeySize` - If `bits` is not a multiple of 8 or below 16
    /// - `CryptoError::MalformedKey` - If the modulus is too small to carry a byte
    pub fn from_public(bits: usize, public_key: BigUint, modulus: BigUint) -> Result<Self, CryptoError> {
        validate_bits(bits)?;
        if modulus <= BigUint::from(u8::MAX) {
            return Err(CryptoError::MalformedKey {
                reason: format!("modulus {modulus} cannot encrypt a byte"),
            });
        }
        if modulus.bits() as usize > bits {
            return Err(CryptoError::MalformedKey {
                reason: format!(
                    "modulus has {} bits, key advertises {bits}",
                    modulus.bits()
                ),
            });
        }
        if public_key.is_zero() {
            return Err(CryptoError::MalformedKey {
                reason: "public exponent is zero".to_string(),
            });
        }
        Ok(Self {
            modulus,
            public_key,
            private_key: None,
            bits,
        })
    }

    /// Drops the private half, leaving a pair that can only encrypt.
    pub fn public_only(&self) -> Self {
        Self {
            modulus: self.modulus.clone(),
            public_key: self.public_key.clone(),
            private_key: None,
            bits: self.bits,
        }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    pub fn public_key(&self) -> &BigUint {
        &self.public_key
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }
}

impl KeyPair for RsaKeyPair {
    fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block_size = self.encrypted_block_size();
        let mut ciphertext = vec![0u8; block_size * data.len()];

        for (byte, block) in data.iter().zip(ciphertext.chunks_exact_mut(block_size)) {
            let encrypted = BigUint::from(*byte).modpow(&self.public_key, &self.modulus);
            let bytes = encrypted.to_bytes_be();
            block[block_size - bytes.len()..].copy_from_slice(&bytes);
        }

        Ok(ciphertext)
    }

    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(CryptoError::MissingKey { which: "private" })?;
        let block_size = self.encrypted_block_size();
        if data.len() % block_size != 0 {
            return Err(CryptoError::PartialBlock {
                len: data.len(),
                block_size,
            });
        }

        Ok(data
            .chunks_exact(block_size)
            .map(|block| {
                let decrypted = BigUint::from_bytes_be(block).modpow(private_key, &self.modulus);
                decrypted.to_bytes_be().last().copied().unwrap_or(0)
            })
            .collect())
    }

    fn encrypted_block_size(&self) -> usize {
        self.bits / 8 + 1
    }
}

/// Big-endian two's-complement encoding of a non-negative integer.
///
/// A leading zero byte is kept whenever the top bit would otherwise be set,
/// which is how the key exchange message carries integers.
pub fn to_signed_bytes(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    match bytes.first() {
        Some(first) if first & 0x80 != 0 => {
            let mut signed = Vec::with_capacity(bytes.len() + 1);
            signed.push(0);
            signed.extend_from_slice(&bytes);
            signed
        }
        _ => bytes,
    }
}

/// Inverse of [`to_signed_bytes`].
///
/// # Errors
/// - `CryptoError::MalformedKey` - If the encoding is empty or negative
pub fn from_signed_bytes(bytes: &[u8]) -> Result<BigUint, CryptoError> {
    match bytes.first() {
        None => Err(CryptoError::MalformedKey {
            reason: "empty integer".to_string(),
        }),
        Some(first) if first & 0x80 != 0 => Err(CryptoError::MalformedKey {
            reason: "negative integer".to_string(),
        }),
        Some(_) => Ok(BigUint::from_bytes_be(bytes)),
    }
}

fn validate_bits(bits: usize) -> Result<(), CryptoError> {
    if bits < MIN_KEY_BITS || bits % 8 != 0 {
        return Err(CryptoError::InvalidKeySize { bits });
    }
    Ok(())
}

/// Random odd integer of exactly `bits` bits that passes Miller-Rabin.
fn probable_prime(bits: usize) -> BigUint {
    loop {
        let candidate = random_odd_with_top_bit(bits);
        if is_probable_prime(&candidate) {
            return candidate;
        }
    }
}

fn random_odd_with_top_bit(bits: usize) -> BigUint {
    let mut bytes = vec![0u8; bits.div_ceil(8)];
    rand::rng().fill_bytes(&mut bytes);

    let excess = bytes.len() * 8 - bits;
    bytes[0] &= 0xFF >> excess;
    bytes[0] |= 0x80 >> excess;
    if let Some(last) = bytes.last_mut() {
        *last |= 1;
    }
    BigUint::from_bytes_be(&bytes)
}

fn is_probable_prime(n: &BigUint) -> bool {
    let two = BigUint::from(2u8);
    if *n < two {
        return false;
    }
    for small in SMALL_PRIMES {
        let small = BigUint::from(small);
        if *n == small {
            return true;
        }
        if (n % &small).is_zero() {
            return false;
        }
    }

    let one = BigUint::one();
    let n_minus_one = n - &one;
    let trailing = n_minus_one.trailing_zeros().unwrap_or(0);
    let odd_part = &n_minus_one >> trailing;

    let passes = |witness: &BigUint| {
        let mut x = witness.modpow(&odd_part, n);
        if x == one || x == n_minus_one {
            return true;
        }
        for _ in 1..trailing {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                return true;
            }
            if x == one {
                return false;
            }
        }
        false
    };

    if !SMALL_PRIMES.iter().all(|&base| passes(&BigUint::from(base))) {
        return false;
    }

    // Fixed bases settle everything below 2^81; larger moduli also get random witnesses.
    if n.bits() > 80 {
        let range = n - BigUint::from(3u8);
        for _ in 0..RANDOM_WITNESS_ROUNDS {
            let mut bytes = vec![0u8; n.bits().div_ceil(8) as usize];
            rand::rng().fill_bytes(&mut bytes);
            let witness = BigUint::from_bytes_be(&bytes) % &range + &two;
            if !passes(&witness) {
                return false;
            }
        }
    }
    true
}
