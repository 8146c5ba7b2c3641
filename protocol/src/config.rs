//! # Protocol Configuration & Constants
//!
//! Every magic number in the ledger lives here, next to the one struct that
//! describes a concrete deployment ([`LedgerConfig`]).
//!
//! Anything that ends up inside a signed digest (protocol name, version,
//! network id) is part of the wire contract. Changing one of those values
//! invalidates every signature already handed out, so don't.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::keys::Address;

// ---------------------------------------------------------------------------
// Network Identifiers
// ---------------------------------------------------------------------------

/// Mainnet. Mistakes here cost real money.
pub const NETWORK_ID_MAINNET: u64 = 1;

/// Testnet.
pub const NETWORK_ID_TESTNET: u64 = 4;

/// Devnet. Reset whenever someone feels like it.
pub const NETWORK_ID_DEVNET: u64 = 1337;

// ---------------------------------------------------------------------------
// Signature Domain
// ---------------------------------------------------------------------------

/// Protocol name bound into the typed-message domain separator.
pub const PROTOCOL_NAME: &str = "litexlayer2";

/// Protocol version bound into the typed-message domain separator.
pub const PROTOCOL_VERSION: &str = "1";

/// Kind tag for user withdrawal approvals.
pub const TAG_USER_WITHDRAW: &str = "userWithdraw";

/// Kind tag for provider withdrawal approvals.
pub const TAG_PROVIDER_WITHDRAW: &str = "providerWithdraw";

/// Kind tag for cooperative settlement approvals.
pub const TAG_COOPERATIVE_SETTLE: &str = "cooperativeSettle";

/// Kind tag for moving pooled liquidity into a channel.
pub const TAG_REBALANCE_IN: &str = "rebalanceIn";

/// Kind tag for fee proofs.
pub const TAG_FEE: &str = "fee";

// ---------------------------------------------------------------------------
// Ledger Parameters
// ---------------------------------------------------------------------------

/// Fee rates are expressed in parts of this denominator (basis points).
/// A rate of 100 charges 1% of every user-paid transfer.
pub const FEE_RATE_DENOMINATOR: u64 = 10_000;

/// Upper bound for a configured fee rate. 100% would eat the whole transfer.
pub const MAX_FEE_RATE: u64 = FEE_RATE_DENOMINATOR;

/// How many delegates a single user may register. Keeps the
/// "is this key allowed to sign for that user" scan bounded.
pub const MAX_DELEGATES_PER_USER: usize = 5;

/// Default challenge window for a force close, in anchor blocks.
pub const DEFAULT_SETTLE_WINDOW_BLOCKS: u64 = 5;

/// Default lifetime of a rebalance proposal, in anchor blocks.
pub const DEFAULT_REBALANCE_COMMIT_BLOCKS: u64 = 20;

// ---------------------------------------------------------------------------
// LedgerConfig
// ---------------------------------------------------------------------------

/// Errors raised by [`LedgerConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("provider, auditor and verifying ledger addresses must be distinct")]
    RoleCollision,

    #[error("settle window must be at least one block")]
    EmptySettleWindow,

    #[error("rebalance commit window must be at least one block")]
    EmptyRebalanceWindow,

    #[error("max delegates must be between 1 and {MAX_DELEGATES_PER_USER}, got {0}")]
    DelegateCapacity(usize),
}

/// Deployment parameters of a single ledger instance.
///
/// The ledger never reads files. Hosts build this struct however they like
/// (it derives serde) and hand it to `Ledger::new`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Chain or network identifier bound into every typed digest.
    pub network_id: u64,
    /// The ledger's own address. Every digest is bound to it.
    pub verifying_ledger: Address,
    /// The hub. Counterparty to every channel.
    pub provider: Address,
    /// Neutral co-signer for withdrawals, settlements and rebalances.
    pub auditor: Address,
    /// Key trusted to ratify proofs signed by delegate keys.
    pub consignor: Address,
    /// Force-close challenge window in anchor blocks.
    pub settle_window_blocks: u64,
    /// Lifetime of a rebalance proposal in anchor blocks.
    pub rebalance_commit_blocks: u64,
    /// Per-user delegate capacity.
    pub max_delegates: usize,
}

impl LedgerConfig {
    /// Builds a config with default windows and delegate capacity.
    pub fn new(
        network_id: u64,
        verifying_ledger: Address,
        provider: Address,
        auditor: Address,
        consignor: Address,
    ) -> Self {
        Self {
            network_id,
            verifying_ledger,
            provider,
            auditor,
            consignor,
            settle_window_blocks: DEFAULT_SETTLE_WINDOW_BLOCKS,
            rebalance_commit_blocks: DEFAULT_REBALANCE_COMMIT_BLOCKS,
            max_delegates: MAX_DELEGATES_PER_USER,
        }
    }

    /// Checks the invariants a ledger relies on at construction time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider == self.auditor
            || self.provider == self.verifying_ledger
            || self.auditor == self.verifying_ledger
        {
            return Err(ConfigError::RoleCollision);
        }
        if self.settle_window_blocks == 0 {
            return Err(ConfigError::EmptySettleWindow);
        }
        if self.rebalance_commit_blocks == 0 {
            return Err(ConfigError::EmptyRebalanceWindow);
        }
        if self.max_delegates == 0 || self.max_delegates > MAX_DELEGATES_PER_USER {
            return Err(ConfigError::DelegateCapacity(self.max_delegates));
        }
        Ok(())
    }
}

/// Returns a friendly name for a network ID, mainly for logging.
pub fn network_name(network_id: u64) -> String {
    match network_id {
        NETWORK_ID_MAINNET => "mainnet".to_string(),
        NETWORK_ID_TESTNET => "testnet".to_string(),
        NETWORK_ID_DEVNET => "devnet".to_string(),
        other => format!("unknown({})", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 32])
    }

    fn sample() -> LedgerConfig {
        LedgerConfig::new(NETWORK_ID_DEVNET, addr(1), addr(2), addr(3), addr(4))
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn test_provider_cannot_be_auditor() {
        let mut cfg = sample();
        cfg.auditor = cfg.provider;
        assert_eq!(cfg.validate(), Err(ConfigError::RoleCollision));
    }

    #[test]
    fn test_zero_windows_rejected() {
        let mut cfg = sample();
        cfg.settle_window_blocks = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::EmptySettleWindow));

        let mut cfg = sample();
        cfg.rebalance_commit_blocks = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyRebalanceWindow));
    }

    #[test]
    fn test_delegate_capacity_bounds() {
        let mut cfg = sample();
        cfg.max_delegates = MAX_DELEGATES_PER_USER + 1;
        assert!(cfg.validate().is_err());
        cfg.max_delegates = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = sample();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: LedgerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn test_fee_constants_sanity() {
        assert!(MAX_FEE_RATE <= FEE_RATE_DENOMINATOR);
        assert!(FEE_RATE_DENOMINATOR > 0);
    }

    #[test]
    fn test_network_name_formatting() {
        assert_eq!(network_name(NETWORK_ID_MAINNET), "mainnet");
        assert_eq!(network_name(99), "unknown(99)");
    }
}
