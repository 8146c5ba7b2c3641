//! # Digital Signatures
//!
//! Sign and verify digests. Every signature the ledger checks is over a
//! 32-byte digest produced by [`super::hash`] or [`super::typed`], never
//! over a raw struct, so the digest is the only thing that decides what a
//! signature authorizes.
//!
//! Verification answers yes or no. It does not say *why* a signature is
//! bad, and it never panics on malformed input.

use thiserror::Error;

use super::hash::Hash32;
use super::keys::{Address, Keypair, Signature};

/// Errors during signature operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature verification failed")]
    VerificationFailed,

    #[error("no candidate signer produced this signature")]
    UnknownSigner,
}

/// Sign a digest.
pub fn sign_digest(keypair: &Keypair, digest: &Hash32) -> Signature {
    keypair.sign(digest)
}

/// `true` iff `signature` is `expected_signer`'s signature over `digest`.
pub fn verify(digest: &Hash32, signature: &Signature, expected_signer: &Address) -> bool {
    expected_signer.verify(digest, signature)
}

/// Like [`verify`], but as a `Result` for `?`-heavy call sites.
pub fn verify_strict(
    digest: &Hash32,
    signature: &Signature,
    expected_signer: &Address,
) -> Result<(), SignatureError> {
    if verify(digest, signature, expected_signer) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

/// Return the first candidate whose signature this is.
///
/// Ed25519 has no public-key recovery, so "who signed this" means trying
/// each address that could legitimately have signed. Candidate lists in
/// the ledger are small and bounded (a user plus a handful of delegates).
pub fn identify_signer<'a, I>(
    digest: &Hash32,
    signature: &Signature,
    candidates: I,
) -> Result<Address, SignatureError>
where
    I: IntoIterator<Item = &'a Address>,
{
    candidates
        .into_iter()
        .find(|candidate| verify(digest, signature, candidate))
        .copied()
        .ok_or(SignatureError::UnknownSigner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::keccak256;

    #[test]
    fn test_sign_and_verify_digest() {
        let kp = Keypair::generate();
        let digest = keccak256(b"withdraw 80");
        let sig = sign_digest(&kp, &digest);
        assert!(verify(&digest, &sig, &kp.address()));
        assert!(verify_strict(&digest, &sig, &kp.address()).is_ok());
    }

    #[test]
    fn test_wrong_signer_fails() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();
        let digest = keccak256(b"settle");
        let sig = sign_digest(&kp1, &digest);
        assert!(!verify(&digest, &sig, &kp2.address()));
        assert_eq!(
            verify_strict(&digest, &sig, &kp2.address()),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn test_identify_signer_picks_the_right_candidate() {
        let a = Keypair::from_seed(&[1u8; 32]);
        let b = Keypair::from_seed(&[2u8; 32]);
        let c = Keypair::from_seed(&[3u8; 32]);
        let digest = keccak256(b"transfer");
        let sig = sign_digest(&b, &digest);
        let candidates = [a.address(), b.address(), c.address()];
        assert_eq!(identify_signer(&digest, &sig, &candidates), Ok(b.address()));
    }

    #[test]
    fn test_identify_signer_none_match() {
        let a = Keypair::generate();
        let outsider = Keypair::generate();
        let digest = keccak256(b"transfer");
        let sig = sign_digest(&outsider, &digest);
        assert_eq!(
            identify_signer(&digest, &sig, &[a.address()]),
            Err(SignatureError::UnknownSigner)
        );
    }
}
