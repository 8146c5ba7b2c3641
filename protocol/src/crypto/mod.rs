//! # Cryptographic Primitives
//!
//! Everything signature- and digest-related flows through here:
//!
//! - **Ed25519** for signatures. Addresses are verifying keys.
//! - **Keccak-256** for every digest, raw or typed.
//!
//! Two digest families exist. *Raw* digests (`hash::PackedEncoder`) cover
//! co-signed approvals: withdrawals, settlements, rebalances, fees. *Typed*
//! digests (`typed`) cover user-facing transfers and carry a full signing
//! domain.

pub mod hash;
pub mod keys;
pub mod signatures;
pub mod typed;

pub use hash::{keccak256, keccak256_multi, u256_word, Hash32, PackedEncoder};
pub use keys::{Address, KeyError, Keypair, Signature};
pub use signatures::{identify_signer, sign_digest, verify, SignatureError};
pub use typed::{transfer_digest, Domain};
