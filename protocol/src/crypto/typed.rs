//! # Structured (Typed) Message Digests
//!
//! User-facing transfer messages are signed as domain-separated structured
//! data. The layout matches EIP-712:
//!
//! ```text
//! digest          = keccak256(0x19 ‖ 0x01 ‖ domainSeparator ‖ structHash)
//! domainSeparator = keccak256(typeHash(EIP712Domain) ‖ keccak(name)
//!                             ‖ keccak(version) ‖ chainId ‖ verifyingContract)
//! verifyingContract = 12 zero bytes ‖ low 20 bytes of the ledger address
//! structHash      = keccak256(typeHash(Transfer) ‖ channelID ‖ balance
//!                             ‖ nonce ‖ additionalHash)
//! ```
//!
//! The domain pins protocol name, version, network id and the verifying
//! ledger's address, so a transfer signature cannot be replayed on another
//! network or against another ledger instance.
//!
//! `verifyingContract` is typed `address`, as existing wallet signers
//! expect. A ledger deployed at a 20-byte contract address configures its
//! verifying ledger as that address left-padded to 32 bytes.

use serde::{Deserialize, Serialize};

use super::hash::{keccak256, u256_word, Hash32, PackedEncoder};
use super::keys::Address;
use crate::config::{PROTOCOL_NAME, PROTOCOL_VERSION};

/// Type string of the signing domain.
pub const DOMAIN_TYPE: &str =
    "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";

/// Type string of a transfer message.
pub const TRANSFER_TYPE: &str =
    "Transfer(bytes32 channelID,uint256 balance,uint256 nonce,bytes32 additionalHash)";

/// The signing domain of one ledger instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_ledger: Address,
}

impl Domain {
    /// Domain with the protocol's fixed name and version.
    pub fn new(chain_id: u64, verifying_ledger: Address) -> Self {
        Self {
            name: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            chain_id,
            verifying_ledger,
        }
    }

    /// `keccak256` over the encoded domain struct.
    pub fn separator(&self) -> Hash32 {
        struct_digest(
            &type_hash(DOMAIN_TYPE),
            &[
                keccak256(self.name.as_bytes()),
                keccak256(self.version.as_bytes()),
                u256_word(self.chain_id as u128),
                address_word(&self.verifying_ledger),
            ],
        )
    }
}

/// ABI word of an `address` field: the low 20 bytes, left-padded.
pub fn address_word(address: &Address) -> Hash32 {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&address.as_bytes()[12..]);
    word
}

/// `keccak256` of a type string.
pub fn type_hash(type_string: &str) -> Hash32 {
    keccak256(type_string.as_bytes())
}

/// `keccak256(typeHash ‖ field₀ ‖ field₁ ‖ …)` over pre-encoded 32-byte fields.
pub fn struct_digest(type_hash: &Hash32, fields: &[Hash32]) -> Hash32 {
    let mut enc = PackedEncoder::new().bytes32(type_hash);
    for field in fields {
        enc = enc.bytes32(field);
    }
    enc.finish()
}

/// The final `0x19 0x01` digest a signer signs.
pub fn typed_digest(domain_separator: &Hash32, struct_hash: &Hash32) -> Hash32 {
    let mut preimage = Vec::with_capacity(66);
    preimage.extend_from_slice(&[0x19, 0x01]);
    preimage.extend_from_slice(domain_separator);
    preimage.extend_from_slice(struct_hash);
    keccak256(&preimage)
}

/// Full typed-message digest: hash the struct, then wrap it in the domain.
pub fn structured_digest(
    domain_separator: &Hash32,
    type_hash: &Hash32,
    fields: &[Hash32],
) -> Hash32 {
    typed_digest(domain_separator, &struct_digest(type_hash, fields))
}

/// Digest of a transfer message within `domain`.
pub fn transfer_digest(
    domain: &Domain,
    channel_id: &Hash32,
    balance: u64,
    nonce: u64,
    additional_hash: &Hash32,
) -> Hash32 {
    structured_digest(
        &domain.separator(),
        &type_hash(TRANSFER_TYPE),
        &[
            *channel_id,
            u256_word(balance as u128),
            u256_word(nonce as u128),
            *additional_hash,
        ],
    )
}
