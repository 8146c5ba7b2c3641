//! # Ledger Errors
//!
//! One error enum for every ledger operation. Each variant names exactly
//! what went wrong so callers can react without string matching.
//!
//! Every operation validates first and mutates second: if you get an `Err`
//! back, nothing changed.

use hubpay_protocol::config::ConfigError;
use hubpay_protocol::crypto::Address;
use hubpay_protocol::storage::DbError;
use thiserror::Error;

/// Errors returned by ledger operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // -- Authorization ------------------------------------------------------
    /// The signature does not verify against the party it claims to be from.
    #[error("invalid signature")]
    InvalidSignature,

    /// The caller or signer holds no role that allows this operation.
    #[error("unauthorized signer {signer}: {reason}")]
    UnauthorizedSigner { signer: Address, reason: &'static str },

    // -- Ordering -----------------------------------------------------------
    /// The message's nonce is not strictly greater than the last accepted one.
    #[error("stale nonce: got {got}, last accepted {last}")]
    StaleNonce { got: u64, last: u64 },

    // -- Funds --------------------------------------------------------------
    #[error("insufficient balance: need {needed}, available {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    /// `amount` disagrees with the cumulative `balance` of the proof.
    #[error("balance mismatch: proof claims {claimed}, expected {expected}")]
    BalanceMismatch { claimed: u64, expected: u64 },

    /// Checked arithmetic refused an overflow.
    #[error("amount overflow")]
    AmountOverflow,

    // -- Channel state ------------------------------------------------------
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("channel {0} already exists")]
    ChannelAlreadyExists(String),

    #[error("no payment network for asset {0}")]
    NetworkNotFound(Address),

    // -- Proposals ----------------------------------------------------------
    #[error("proposal expired at block {last_commit_block}, current height {height}")]
    ProposalExpired { last_commit_block: u64, height: u64 },

    #[error("a proposal is already pending for {0}")]
    ProposalAlreadyPending(String),

    #[error("no pending proposal for {0}")]
    NoPendingProposal(String),

    #[error("proposal still live until block {last_commit_block}, current height {height}")]
    ProposalNotExpired { last_commit_block: u64, height: u64 },

    // -- Disputes -----------------------------------------------------------
    #[error("challenge window open until block {settle_block}, current height {height}")]
    ChallengeWindowOpen { settle_block: u64, height: u64 },

    #[error("challenge window closed at block {settle_block}, current height {height}")]
    ChallengeWindowClosed { settle_block: u64, height: u64 },

    // -- Delegation ---------------------------------------------------------
    #[error("user {0} already has the maximum number of delegates")]
    DelegateLimitReached(Address),

    #[error("{delegate} is not a delegate of {user}")]
    DelegateNotFound { user: Address, delegate: Address },

    // -- Escrow & storage ---------------------------------------------------
    /// The escrow's custody and the ledger's books disagree. Needs a human.
    #[error("reconciliation mismatch for asset {asset}: ledger {ledger}, escrow {escrow}")]
    ReconciliationMismatch {
        asset: Address,
        ledger: u64,
        escrow: u64,
    },

    #[error("escrow rejected the request: {0}")]
    EscrowRejected(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl From<DbError> for LedgerError {
    fn from(e: DbError) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Checked `a + b` for ledger amounts.
pub(crate) fn add(a: u64, b: u64) -> LedgerResult<u64> {
    a.checked_add(b).ok_or(LedgerError::AmountOverflow)
}

/// Checked `a - b`, reported as an insufficient balance.
pub(crate) fn sub(a: u64, b: u64) -> LedgerResult<u64> {
    a.checked_sub(b).ok_or(LedgerError::InsufficientBalance {
        needed: b,
        available: a,
    })
}
