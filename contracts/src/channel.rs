//! # Channels
//!
//! A channel is the bilateral account between the provider and one user
//! for one asset. Its value lives in two buckets, `user_balance` and
//! `provider_balance`; transfers move value between them and nothing else
//! does, except deposits, withdrawals, rebalances and settlement.
//!
//! ## Lifecycle
//!
//! ```text
//!   Empty ──open──► Open ──propose settle / close──► Closing ──► Settled
//!                    ▲                                  │
//!                    └──────── unlock (timeout) ────────┘
//! ```
//!
//! A settled channel can be opened again. Each opening of the same
//! `(provider, user, asset)` triple is a new epoch with its own id, so
//! proofs signed for an earlier epoch name a settled channel and go nowhere.

use hubpay_protocol::crypto::{keccak256_multi, u256_word, Address, Hash32, Signature};
use serde::{Deserialize, Serialize};

use crate::error::{add, sub, LedgerResult};

/// Channel identifier.
///
/// The first opening is `keccak256(provider ‖ user ‖ asset)`; reopening
/// number `epoch` appends the epoch as a 32-byte word.
pub fn channel_id(provider: &Address, user: &Address, asset: &Address, epoch: u64) -> Hash32 {
    if epoch == 0 {
        return keccak256_multi(&[provider.as_bytes(), user.as_bytes(), asset.as_bytes()]);
    }
    let word = u256_word(epoch as u128);
    keccak256_multi(&[provider.as_bytes(), user.as_bytes(), asset.as_bytes(), &word])
}

/// Short hex form of a channel id for logs and error messages.
pub fn short_id(id: &Hash32) -> String {
    hex::encode(&id[..8])
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// No channel under this id.
    #[default]
    Empty,
    Open,
    /// Settlement in progress, cooperative or forced. No transfers.
    Closing,
    Settled,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Empty => write!(f, "Empty"),
            ChannelStatus::Open => write!(f, "Open"),
            ChannelStatus::Closing => write!(f, "Closing"),
            ChannelStatus::Settled => write!(f, "Settled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Asset movement
// ---------------------------------------------------------------------------

/// How this channel's asset leaves custody. Fixed when the channel opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetMover {
    /// The chain's native asset, identified by [`Address::ZERO`].
    Native,
    /// A fungible token identified by its contract address.
    Token { contract: Address },
}

impl AssetMover {
    pub fn resolve(asset: &Address) -> Self {
        if asset.is_zero() {
            AssetMover::Native
        } else {
            AssetMover::Token { contract: *asset }
        }
    }

    /// The asset identifier the escrow books this mover under.
    pub fn asset(&self) -> Address {
        match self {
            AssetMover::Native => Address::ZERO,
            AssetMover::Token { contract } => *contract,
        }
    }
}

// ---------------------------------------------------------------------------
// Balance proofs
// ---------------------------------------------------------------------------

/// Which side pays in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    UserToProvider,
    ProviderToUser,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::UserToProvider => Direction::ProviderToUser,
            Direction::ProviderToUser => Direction::UserToProvider,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::UserToProvider => write!(f, "user->provider"),
            Direction::ProviderToUser => write!(f, "provider->user"),
        }
    }
}

/// A signed statement that the payer has transferred `balance` in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceProof {
    pub channel_id: Hash32,
    /// Cumulative amount paid in this direction.
    pub balance: u64,
    pub nonce: u64,
    /// Gross amount of this single transfer.
    pub amount: u64,
    pub additional_hash: Hash32,
    pub signature: Signature,
    /// The key that produced `signature` (the payer or a delegate).
    pub signer: Address,
    /// Ratification attached by `guard_balance_proof`.
    pub consignor_signature: Option<Signature>,
}

impl BalanceProof {
    pub fn is_ratified(&self) -> bool {
        self.consignor_signature.is_some()
    }
}

/// Per-direction progress: what was paid so far and under which nonce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub transferred: u64,
    pub nonce: u64,
    pub proof: Option<BalanceProof>,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Hash32,
    pub user: Address,
    pub asset: Address,
    pub mover: AssetMover,
    /// Cumulative user deposits.
    pub deposit: u64,
    pub user_balance: u64,
    /// Channel-local provider balance. Not the pooled one.
    pub provider_balance: u64,
    /// Cumulative confirmed user withdrawals.
    pub user_withdraw: u64,
    /// Cumulative pool liquidity moved in, as last co-signed.
    pub rebalance_in: u64,
    pub rebalance_nonce: u64,
    /// Payments from user to provider.
    pub user_side: TransferState,
    /// Payments from provider to user.
    pub provider_side: TransferState,
    /// Fees charged on this channel and not yet realized.
    pub fee_pending: u64,
    /// A provider-paid proof waiting for a rebalance to land.
    pub arrears: Option<BalanceProof>,
    pub status: ChannelStatus,
    pub opened_at: u64,
    /// How many times this `(provider, user, asset)` was opened before.
    #[serde(default)]
    pub epoch: u64,
}

impl Channel {
    pub fn open(
        id: Hash32,
        user: Address,
        asset: Address,
        deposit: u64,
        height: u64,
        epoch: u64,
    ) -> Self {
        Self {
            id,
            user,
            asset,
            mover: AssetMover::resolve(&asset),
            deposit,
            user_balance: deposit,
            provider_balance: 0,
            user_withdraw: 0,
            rebalance_in: 0,
            rebalance_nonce: 0,
            user_side: TransferState::default(),
            provider_side: TransferState::default(),
            fee_pending: 0,
            arrears: None,
            status: ChannelStatus::Open,
            opened_at: height,
            epoch,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ChannelStatus::Open
    }

    /// `user_balance + provider_balance`.
    pub fn total(&self) -> LedgerResult<u64> {
        add(self.user_balance, self.provider_balance)
    }

    /// Deposits net of confirmed withdrawals.
    pub fn net_deposit(&self) -> LedgerResult<u64> {
        sub(self.deposit, self.user_withdraw)
    }

    pub fn side(&self, direction: Direction) -> &TransferState {
        match direction {
            Direction::UserToProvider => &self.user_side,
            Direction::ProviderToUser => &self.provider_side,
        }
    }

    pub fn side_mut(&mut self, direction: Direction) -> &mut TransferState {
        match direction {
            Direction::UserToProvider => &mut self.user_side,
            Direction::ProviderToUser => &mut self.provider_side,
        }
    }

    /// What the paying side of `direction` can spend right now.
    pub fn spendable(&self, direction: Direction) -> u64 {
        match direction {
            Direction::UserToProvider => self.user_balance,
            Direction::ProviderToUser => self.provider_balance.saturating_sub(self.fee_pending),
        }
    }

    /// Move `amount` from the payer's bucket to the payee's. Checked, and
    /// leaves the channel untouched on error.
    pub fn shift(&mut self, direction: Direction, amount: u64) -> LedgerResult<()> {
        match direction {
            Direction::UserToProvider => {
                let user = sub(self.user_balance, amount)?;
                let provider = add(self.provider_balance, amount)?;
                self.user_balance = user;
                self.provider_balance = provider;
            }
            Direction::ProviderToUser => {
                let provider = sub(self.provider_balance, amount)?;
                let user = add(self.user_balance, amount)?;
                self.provider_balance = provider;
                self.user_balance = user;
            }
        }
        Ok(())
    }

    /// Zero both buckets once the channel's value has been paid out.
    pub fn mark_settled(&mut self) {
        self.user_balance = 0;
        self.provider_balance = 0;
        self.fee_pending = 0;
        self.arrears = None;
        self.status = ChannelStatus::Settled;
    }
}
