//! # Hashing Utilities
//!
//! Keccak-256 and the "packed" encoding every raw digest in the ledger is
//! built from.
//!
//! ## Packed encoding
//!
//! A raw digest is `keccak256` over a concatenation of fixed-width fields:
//!
//! - unsigned integers as 32-byte big-endian words,
//! - addresses, channel ids and hashes as their 32 raw bytes.
//!
//! Every field is exactly 32 bytes, so two different field tuples can
//! never produce the same preimage. [`PackedEncoder`] builds that preimage
//! without callers having to think about padding.

use sha3::{Digest, Keccak256};

/// A 32-byte digest.
pub type Hash32 = [u8; 32];

/// Keccak-256 of a single byte slice.
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut output = [0u8; 32];
    output.copy_from_slice(&hasher.finalize());
    output
}

/// Keccak-256 over several slices fed in order, without concatenating.
pub fn keccak256_multi(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 32];
    output.copy_from_slice(&hasher.finalize());
    output
}

/// Encode an unsigned integer as a 32-byte big-endian word.
pub fn u256_word(value: u128) -> Hash32 {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Incremental builder for packed preimages.
///
/// ```
/// use hubpay_protocol::crypto::hash::{keccak256, PackedEncoder};
///
/// let digest = PackedEncoder::new().word(7).bytes32(&[1u8; 32]).finish();
/// assert_eq!(digest.len(), 32);
/// assert_ne!(digest, keccak256(b""));
/// ```
#[derive(Debug, Default, Clone)]
pub struct PackedEncoder {
    buf: Vec<u8>,
}

impl PackedEncoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(32 * 6),
        }
    }

    /// Append an unsigned integer as a 32-byte word.
    pub fn word(mut self, value: u128) -> Self {
        self.buf.extend_from_slice(&u256_word(value));
        self
    }

    /// Append 32 raw bytes (address, id, hash).
    pub fn bytes32(mut self, value: &[u8; 32]) -> Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Append the Keccak-256 of a string. Used for kind tags.
    pub fn tag(self, tag: &str) -> Self {
        let hashed = keccak256(tag.as_bytes());
        self.bytes32(&hashed)
    }

    /// The preimage built so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Hash the preimage.
    pub fn finish(self) -> Hash32 {
        keccak256(&self.buf)
    }
}
