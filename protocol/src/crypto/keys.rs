//! # Key Management
//!
//! Ed25519 keypairs, addresses and signatures for every party the ledger
//! talks to: the Provider, the Auditor, Users, their delegates and the
//! consignor.
//!
//! An [`Address`] *is* an Ed25519 verifying key. There is no separate
//! address derivation step, which means "who signed this?" is always
//! answered by verifying against a candidate address, never by recovery.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek does this for us).
//! - Key generation uses `OsRng`.
//! - Secret bytes are never logged and never printed by `Debug`.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not a valid scalar")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

/// An Ed25519 signing keypair.
///
/// Deliberately not `Serialize`. Exporting a secret should be an explicit
/// call to [`to_bytes`](Self::to_bytes), not a side effect of logging a
/// struct.
pub struct Keypair {
    signing_key: SigningKey,
}

/// A 32-byte party identifier: the Ed25519 verifying key.
///
/// `Default` is [`Address::ZERO`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 32]);

/// A detached 64-byte Ed25519 signature.
///
/// Stored as `Vec<u8>` so that malformed input coming off the wire can be
/// represented at all. A wrong-length signature simply fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Keypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests and KDF output only.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstruct a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let arr: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&arr))
    }

    /// The address (verifying key) of this keypair.
    pub fn address(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign arbitrary bytes. In the ledger these bytes are always a digest.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes().to_vec())
    }

    /// Export the raw 32-byte secret. Handle with care.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair(addr={})", self.address())
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

impl Address {
    /// The all-zero address. Used as the native asset identifier.
    pub const ZERO: Address = Address([0u8; 32]);

    /// Wrap raw bytes. No curve check: asset and ledger identifiers are
    /// addresses too, and they are not required to be valid points.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse and check that the bytes are a usable Ed25519 verifying key.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns `true` for [`Address::ZERO`].
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Verify `signature` over `message` against this address.
    ///
    /// Any malformed input (not a curve point, wrong signature length) is
    /// just `false`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Some(sig) = signature.to_dalek() else {
            return false;
        };
        verifying_key.verify(message, &sig).is_ok()
    }

    /// Hex-encoded representation. 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex-encoded address.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

impl Signature {
    /// Wrap whatever bytes arrived. Length is checked at verification time.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw bytes. 64 for anything that can verify.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex-encoded signature.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    fn to_dalek(&self) -> Option<DalekSignature> {
        let arr: [u8; 64] = self.0.as_slice().try_into().ok()?;
        Some(DalekSignature::from_bytes(&arr))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Signature({})", &hex[..hex.len().min(16)])
    }
}
