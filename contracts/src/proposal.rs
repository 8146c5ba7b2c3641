//! # Proposals
//!
//! Anything that takes value out of a channel or out of the pool needs
//! more than one signature. A proposal is opened by the party that wants
//! the change, collects co-signatures, and is applied exactly once when
//! the last required signature arrives.
//!
//! | Kind                | Opened by | Co-signers         | Keyed by        |
//! |---------------------|-----------|--------------------|-----------------|
//! | User withdraw       | User      | Provider + Auditor | channel id      |
//! | Provider withdraw   | Provider  | Auditor            | asset           |
//! | Cooperative settle  | User      | Provider + Auditor | channel id      |
//! | Rebalance           | Provider  | Auditor            | message digest  |
//!
//! Rebalances are keyed by their digest, not the channel, so an auditor
//! signature can never be replayed onto a different channel.
//!
//! Every proposal has a `last_commit_block`. After that height it can no
//! longer be confirmed, and anyone may unlock it. Unlocking discards the
//! proposal and nothing else. There is no cancel: the proposer cannot back
//! out of a number the other side already agreed to.

use std::collections::BTreeMap;

use hubpay_protocol::config::{
    TAG_COOPERATIVE_SETTLE, TAG_PROVIDER_WITHDRAW, TAG_REBALANCE_IN, TAG_USER_WITHDRAW,
};
use hubpay_protocol::crypto::{Address, Hash32, PackedEncoder, Signature};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::channel::{short_id, ChannelStatus};
use crate::error::{add, sub, LedgerError, LedgerResult};
use crate::escrow::EscrowInterface;
use crate::ledger::Ledger;
use crate::roles::Role;
use crate::transfer::ArrearsStatus;

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// What the provider and the auditor sign to approve a user withdrawal.
pub fn user_withdraw_digest(
    ledger: &Address,
    channel_id: &Hash32,
    amount: u64,
    last_commit_block: u64,
) -> Hash32 {
    PackedEncoder::new()
        .bytes32(ledger.as_bytes())
        .tag(TAG_USER_WITHDRAW)
        .bytes32(channel_id)
        .word(amount as u128)
        .word(last_commit_block as u128)
        .finish()
}

/// What the auditor signs to approve a provider withdrawal.
pub fn provider_withdraw_digest(
    ledger: &Address,
    asset: &Address,
    amount: u64,
    last_commit_block: u64,
) -> Hash32 {
    PackedEncoder::new()
        .bytes32(ledger.as_bytes())
        .tag(TAG_PROVIDER_WITHDRAW)
        .bytes32(asset.as_bytes())
        .word(amount as u128)
        .word(last_commit_block as u128)
        .finish()
}

/// What the provider and the auditor sign to settle a channel.
pub fn cooperative_settle_digest(
    ledger: &Address,
    channel_id: &Hash32,
    balance: u64,
    last_commit_block: u64,
) -> Hash32 {
    PackedEncoder::new()
        .bytes32(ledger.as_bytes())
        .tag(TAG_COOPERATIVE_SETTLE)
        .bytes32(channel_id)
        .word(balance as u128)
        .word(last_commit_block as u128)
        .finish()
}

/// What the provider and the auditor sign to move pool liquidity into a
/// channel. `amount` is the channel's cumulative rebalance-in.
pub fn rebalance_digest(ledger: &Address, channel_id: &Hash32, amount: u64, nonce: u64) -> Hash32 {
    PackedEncoder::new()
        .bytes32(ledger.as_bytes())
        .tag(TAG_REBALANCE_IN)
        .bytes32(channel_id)
        .word(amount as u128)
        .word(nonce as u128)
        .finish()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    UserWithdraw,
    ProviderWithdraw,
    CooperativeSettle,
    Rebalance,
}

impl ProposalKind {
    fn key_prefix(self) -> u8 {
        match self {
            ProposalKind::UserWithdraw => 1,
            ProposalKind::ProviderWithdraw => 2,
            ProposalKind::CooperativeSettle => 3,
            ProposalKind::Rebalance => 4,
        }
    }
}

impl std::fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalKind::UserWithdraw => write!(f, "user withdraw"),
            ProposalKind::ProviderWithdraw => write!(f, "provider withdraw"),
            ProposalKind::CooperativeSettle => write!(f, "cooperative settle"),
            ProposalKind::Rebalance => write!(f, "rebalance"),
        }
    }
}

/// Co-signatures collected so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approvals {
    pub provider: Option<Signature>,
    pub auditor: Option<Signature>,
}

impl Approvals {
    fn record(&mut self, role: Role, signature: Signature) {
        match role {
            Role::Provider => self.provider = Some(signature),
            Role::Auditor => self.auditor = Some(signature),
            _ => {}
        }
    }

    pub fn is_complete(&self) -> bool {
        self.provider.is_some() && self.auditor.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserWithdrawProposal {
    pub channel_id: Hash32,
    pub amount: u64,
    pub receiver: Address,
    pub last_commit_block: u64,
    pub approvals: Approvals,
    pub is_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderWithdrawProposal {
    pub asset: Address,
    pub amount: u64,
    pub last_commit_block: u64,
    pub auditor_signature: Option<Signature>,
    pub is_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeSettleProposal {
    pub channel_id: Hash32,
    /// What the user receives. The rest of the channel returns to the pool.
    pub balance: u64,
    pub last_commit_block: u64,
    pub approvals: Approvals,
    pub is_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProposal {
    pub digest: Hash32,
    pub channel_id: Hash32,
    /// Cumulative rebalance-in after confirmation.
    pub amount: u64,
    pub nonce: u64,
    pub last_commit_block: u64,
    pub approvals: Approvals,
    pub is_confirmed: bool,
}

/// A proposal of any kind, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalRecord {
    UserWithdraw(UserWithdrawProposal),
    ProviderWithdraw(ProviderWithdrawProposal),
    CooperativeSettle(CooperativeSettleProposal),
    Rebalance(RebalanceProposal),
}

impl ProposalRecord {
    /// Storage key: one kind byte followed by the subject id.
    pub fn key(&self) -> Vec<u8> {
        let (kind, subject): (ProposalKind, &[u8; 32]) = match self {
            ProposalRecord::UserWithdraw(p) => (ProposalKind::UserWithdraw, &p.channel_id),
            ProposalRecord::ProviderWithdraw(p) => (ProposalKind::ProviderWithdraw, p.asset.as_bytes()),
            ProposalRecord::CooperativeSettle(p) => (ProposalKind::CooperativeSettle, &p.channel_id),
            ProposalRecord::Rebalance(p) => (ProposalKind::Rebalance, &p.digest),
        };
        let mut key = Vec::with_capacity(33);
        key.push(kind.key_prefix());
        key.extend_from_slice(subject);
        key
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every proposal the ledger knows about, confirmed or not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalRegistry {
    user_withdraws: BTreeMap<Hash32, UserWithdrawProposal>,
    provider_withdraws: BTreeMap<Address, ProviderWithdrawProposal>,
    settles: BTreeMap<Hash32, CooperativeSettleProposal>,
    rebalances: BTreeMap<Hash32, RebalanceProposal>,
}

impl ProposalRegistry {
    pub fn user_withdraw(&self, channel_id: &Hash32) -> Option<&UserWithdrawProposal> {
        self.user_withdraws.get(channel_id)
    }

    pub fn provider_withdraw(&self, asset: &Address) -> Option<&ProviderWithdrawProposal> {
        self.provider_withdraws.get(asset)
    }

    pub fn cooperative_settle(&self, channel_id: &Hash32) -> Option<&CooperativeSettleProposal> {
        self.settles.get(channel_id)
    }

    pub fn rebalance(&self, digest: &Hash32) -> Option<&RebalanceProposal> {
        self.rebalances.get(digest)
    }

    pub fn has_pending_withdraw(&self, channel_id: &Hash32) -> bool {
        self.user_withdraws
            .get(channel_id)
            .is_some_and(|p| !p.is_confirmed)
    }

    /// The unconfirmed rebalance targeting `channel_id`, if any.
    pub fn pending_rebalance_for(&self, channel_id: &Hash32) -> Option<&RebalanceProposal> {
        self.rebalances
            .values()
            .find(|p| !p.is_confirmed && p.channel_id == *channel_id)
    }

    /// The kind of unconfirmed proposal on `channel_id`, if any.
    pub fn pending_on_channel(&self, channel_id: &Hash32) -> Option<ProposalKind> {
        if self.has_pending_withdraw(channel_id) {
            return Some(ProposalKind::UserWithdraw);
        }
        if self.settles.get(channel_id).is_some_and(|p| !p.is_confirmed) {
            return Some(ProposalKind::CooperativeSettle);
        }
        self.pending_rebalance_for(channel_id)
            .map(|_| ProposalKind::Rebalance)
    }

    /// Drop every unconfirmed proposal on `channel_id`.
    pub(crate) fn discard_channel(&mut self, channel_id: &Hash32) -> Vec<ProposalKind> {
        let mut dropped = Vec::new();
        if self.has_pending_withdraw(channel_id) {
            self.user_withdraws.remove(channel_id);
            dropped.push(ProposalKind::UserWithdraw);
        }
        if self.settles.get(channel_id).is_some_and(|p| !p.is_confirmed) {
            self.settles.remove(channel_id);
            dropped.push(ProposalKind::CooperativeSettle);
        }
        let before = self.rebalances.len();
        self.rebalances
            .retain(|_, p| p.is_confirmed || p.channel_id != *channel_id);
        if self.rebalances.len() != before {
            dropped.push(ProposalKind::Rebalance);
        }
        dropped
    }

    /// Forget confirmed rebalances on `channel_id` other than `latest`.
    /// The channel's `rebalance_in` and nonce already carry their effect.
    pub(crate) fn prune_confirmed_rebalances(&mut self, channel_id: &Hash32, latest: &Hash32) -> usize {
        let before = self.rebalances.len();
        self.rebalances.retain(|digest, p| {
            digest == latest || !p.is_confirmed || p.channel_id != *channel_id
        });
        before - self.rebalances.len()
    }

    pub(crate) fn records(&self) -> Vec<(Vec<u8>, ProposalRecord)> {
        let records = self
            .user_withdraws
            .values()
            .cloned()
            .map(ProposalRecord::UserWithdraw)
            .chain(
                self.provider_withdraws
                    .values()
                    .cloned()
                    .map(ProposalRecord::ProviderWithdraw),
            )
            .chain(self.settles.values().cloned().map(ProposalRecord::CooperativeSettle))
            .chain(self.rebalances.values().cloned().map(ProposalRecord::Rebalance));
        records.map(|r| (r.key(), r)).collect()
    }

    pub(crate) fn insert_record(&mut self, record: ProposalRecord) {
        match record {
            ProposalRecord::UserWithdraw(p) => {
                self.user_withdraws.insert(p.channel_id, p);
            }
            ProposalRecord::ProviderWithdraw(p) => {
                self.provider_withdraws.insert(p.asset, p);
            }
            ProposalRecord::CooperativeSettle(p) => {
                self.settles.insert(p.channel_id, p);
            }
            ProposalRecord::Rebalance(p) => {
                self.rebalances.insert(p.digest, p);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl<E: EscrowInterface> Ledger<E> {
    fn ensure_live(&self, last_commit_block: u64) -> LedgerResult<()> {
        if self.height > last_commit_block {
            return Err(LedgerError::ProposalExpired {
                last_commit_block,
                height: self.height,
            });
        }
        Ok(())
    }

    fn ensure_expired(&self, last_commit_block: u64) -> LedgerResult<()> {
        if self.height <= last_commit_block {
            return Err(LedgerError::ProposalNotExpired {
                last_commit_block,
                height: self.height,
            });
        }
        Ok(())
    }

    fn ensure_no_pending(&self, channel_id: &Hash32) -> LedgerResult<()> {
        match self.proposals.pending_on_channel(channel_id) {
            Some(kind) => Err(LedgerError::ProposalAlreadyPending(format!(
                "{kind} on channel {}",
                short_id(channel_id)
            ))),
            None => Ok(()),
        }
    }

    fn open_channel_for(&self, channel_id: &Hash32) -> LedgerResult<&crate::channel::Channel> {
        let channel = self.channel(channel_id)?;
        if !channel.is_open() {
            return Err(LedgerError::ChannelNotOpen(short_id(channel_id)));
        }
        Ok(channel)
    }

    // -- User withdraw ------------------------------------------------------

    /// The user asks to take `amount` out of the channel to `receiver`.
    pub fn user_propose_withdraw(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        amount: u64,
        receiver: Address,
        last_commit_block: u64,
    ) -> LedgerResult<()> {
        let channel = self.channel(channel_id)?;
        self.roles
            .authorize(caller, &[Role::User], Some(&channel.user), &self.delegates)?;
        let channel = self.open_channel_for(channel_id)?;
        let available = channel.user_balance;
        self.ensure_no_pending(channel_id)?;
        self.ensure_live(last_commit_block)?;
        if amount == 0 {
            return Err(LedgerError::InvalidArgument("withdraw amount must be positive"));
        }
        if amount > available {
            return Err(LedgerError::InsufficientBalance {
                needed: amount,
                available,
            });
        }

        self.proposals.user_withdraws.insert(
            *channel_id,
            UserWithdrawProposal {
                channel_id: *channel_id,
                amount,
                receiver,
                last_commit_block,
                approvals: Approvals::default(),
                is_confirmed: false,
            },
        );
        info!(channel = %short_id(channel_id), amount, last_commit_block, "user withdraw proposed");
        Ok(())
    }

    /// Provider or auditor co-signs the pending user withdrawal. Returns
    /// `true` once both have signed and the withdrawal has been applied.
    pub fn confirm_user_withdraw(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        signature: Signature,
    ) -> LedgerResult<bool> {
        let role = self.roles.authorize(
            caller,
            &[Role::Provider, Role::Auditor],
            None,
            &self.delegates,
        )?;
        let proposal = self
            .proposals
            .user_withdraws
            .get(channel_id)
            .filter(|p| !p.is_confirmed)
            .cloned()
            .ok_or_else(|| LedgerError::NoPendingProposal(short_id(channel_id)))?;
        self.ensure_live(proposal.last_commit_block)?;
        let digest = user_withdraw_digest(
            &self.config.verifying_ledger,
            channel_id,
            proposal.amount,
            proposal.last_commit_block,
        );
        self.roles.authorize_signature(role, &digest, &signature)?;

        let mut approvals = proposal.approvals.clone();
        approvals.record(role, signature);
        if !approvals.is_complete() {
            if let Some(p) = self.proposals.user_withdraws.get_mut(channel_id) {
                p.approvals = approvals;
            }
            info!(channel = %short_id(channel_id), %role, "user withdraw co-signed");
            return Ok(false);
        }

        // Final signature: validate the effect, then apply it.
        let channel = self.open_channel_for(channel_id)?;
        let asset = channel.asset;
        let user_balance = sub(channel.user_balance, proposal.amount)?;
        let user_withdraw = add(channel.user_withdraw, proposal.amount)?;
        let total_withdraw = add(self.network(&asset)?.user_total_withdraw, proposal.amount)?;

        let channel = self.channel_mut(channel_id)?;
        channel.user_balance = user_balance;
        channel.user_withdraw = user_withdraw;
        self.network_mut(&asset)?.user_total_withdraw = total_withdraw;
        if let Some(p) = self.proposals.user_withdraws.get_mut(channel_id) {
            p.approvals = approvals;
            p.is_confirmed = true;
        }
        self.request_payout(&asset, &proposal.receiver, proposal.amount);

        info!(
            channel = %short_id(channel_id),
            amount = proposal.amount,
            receiver = %proposal.receiver,
            "user withdraw confirmed"
        );
        Ok(true)
    }

    /// Discard an expired, unconfirmed user withdrawal.
    pub fn unlock_user_withdraw(&mut self, channel_id: &Hash32) -> LedgerResult<()> {
        let lcb = self
            .proposals
            .user_withdraws
            .get(channel_id)
            .filter(|p| !p.is_confirmed)
            .map(|p| p.last_commit_block)
            .ok_or_else(|| LedgerError::NoPendingProposal(short_id(channel_id)))?;
        self.ensure_expired(lcb)?;
        self.proposals.user_withdraws.remove(channel_id);
        warn!(channel = %short_id(channel_id), "user withdraw unlocked after timeout");
        Ok(())
    }

    // -- Provider withdraw --------------------------------------------------

    /// The provider asks to take `amount` out of the pool of `asset`.
    pub fn provider_propose_withdraw(
        &mut self,
        caller: &Address,
        asset: &Address,
        amount: u64,
        last_commit_block: u64,
    ) -> LedgerResult<()> {
        self.roles
            .authorize(caller, &[Role::Provider], None, &self.delegates)?;
        let pool = self.network(asset)?.provider_balance;
        if self
            .proposals
            .provider_withdraws
            .get(asset)
            .is_some_and(|p| !p.is_confirmed)
        {
            return Err(LedgerError::ProposalAlreadyPending(format!(
                "provider withdraw on asset {asset}"
            )));
        }
        self.ensure_live(last_commit_block)?;
        if amount == 0 {
            return Err(LedgerError::InvalidArgument("withdraw amount must be positive"));
        }
        if amount > pool {
            return Err(LedgerError::InsufficientBalance {
                needed: amount,
                available: pool,
            });
        }

        self.proposals.provider_withdraws.insert(
            *asset,
            ProviderWithdrawProposal {
                asset: *asset,
                amount,
                last_commit_block,
                auditor_signature: None,
                is_confirmed: false,
            },
        );
        info!(%asset, amount, last_commit_block, "provider withdraw proposed");
        Ok(())
    }

    /// The auditor approves the pending provider withdrawal.
    pub fn confirm_provider_withdraw(
        &mut self,
        caller: &Address,
        asset: &Address,
        signature: Signature,
    ) -> LedgerResult<()> {
        self.roles
            .authorize(caller, &[Role::Auditor], None, &self.delegates)?;
        let proposal = self
            .proposals
            .provider_withdraws
            .get(asset)
            .filter(|p| !p.is_confirmed)
            .cloned()
            .ok_or_else(|| LedgerError::NoPendingProposal(asset.to_string()))?;
        self.ensure_live(proposal.last_commit_block)?;
        let digest = provider_withdraw_digest(
            &self.config.verifying_ledger,
            asset,
            proposal.amount,
            proposal.last_commit_block,
        );
        self.roles
            .authorize_signature(Role::Auditor, &digest, &signature)?;

        let mut network = self.network(asset)?.clone();
        network.debit_provider_withdraw(proposal.amount)?;
        let pool = network.provider_balance;
        self.networks.insert(*asset, network);
        if let Some(p) = self.proposals.provider_withdraws.get_mut(asset) {
            p.auditor_signature = Some(signature);
            p.is_confirmed = true;
        }
        let provider = self.roles.provider();
        self.request_payout(asset, &provider, proposal.amount);

        info!(%asset, amount = proposal.amount, pool, "provider withdraw confirmed");
        Ok(())
    }

    pub fn unlock_provider_withdraw(&mut self, asset: &Address) -> LedgerResult<()> {
        let lcb = self
            .proposals
            .provider_withdraws
            .get(asset)
            .filter(|p| !p.is_confirmed)
            .map(|p| p.last_commit_block)
            .ok_or_else(|| LedgerError::NoPendingProposal(asset.to_string()))?;
        self.ensure_expired(lcb)?;
        self.proposals.provider_withdraws.remove(asset);
        warn!(%asset, "provider withdraw unlocked after timeout");
        Ok(())
    }

    // -- Cooperative settle -------------------------------------------------

    /// The user proposes closing the channel, receiving `balance`. The
    /// channel stops accepting transfers immediately.
    pub fn propose_cooperative_settle(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        balance: u64,
        last_commit_block: u64,
    ) -> LedgerResult<()> {
        let channel = self.channel(channel_id)?;
        self.roles
            .authorize(caller, &[Role::User], Some(&channel.user), &self.delegates)?;
        let total = self.open_channel_for(channel_id)?.total()?;
        self.ensure_no_pending(channel_id)?;
        self.ensure_live(last_commit_block)?;
        if balance > total {
            return Err(LedgerError::InsufficientBalance {
                needed: balance,
                available: total,
            });
        }

        self.channel_mut(channel_id)?.status = ChannelStatus::Closing;
        self.proposals.settles.insert(
            *channel_id,
            CooperativeSettleProposal {
                channel_id: *channel_id,
                balance,
                last_commit_block,
                approvals: Approvals::default(),
                is_confirmed: false,
            },
        );
        info!(channel = %short_id(channel_id), balance, last_commit_block, "cooperative settle proposed");
        Ok(())
    }

    /// Provider or auditor co-signs the pending settlement. Returns `true`
    /// once the channel is settled.
    pub fn confirm_cooperative_settle(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        signature: Signature,
    ) -> LedgerResult<bool> {
        let role = self.roles.authorize(
            caller,
            &[Role::Provider, Role::Auditor],
            None,
            &self.delegates,
        )?;
        let proposal = self
            .proposals
            .settles
            .get(channel_id)
            .filter(|p| !p.is_confirmed)
            .cloned()
            .ok_or_else(|| LedgerError::NoPendingProposal(short_id(channel_id)))?;
        self.ensure_live(proposal.last_commit_block)?;
        let digest = cooperative_settle_digest(
            &self.config.verifying_ledger,
            channel_id,
            proposal.balance,
            proposal.last_commit_block,
        );
        self.roles.authorize_signature(role, &digest, &signature)?;

        let mut approvals = proposal.approvals.clone();
        approvals.record(role, signature);
        if !approvals.is_complete() {
            if let Some(p) = self.proposals.settles.get_mut(channel_id) {
                p.approvals = approvals;
            }
            info!(channel = %short_id(channel_id), %role, "cooperative settle co-signed");
            return Ok(false);
        }

        let channel = self.channel(channel_id)?;
        if channel.status != ChannelStatus::Closing {
            return Err(LedgerError::ChannelNotOpen(short_id(channel_id)));
        }
        let (asset, user) = (channel.asset, channel.user);
        let provider_share = sub(channel.total()?, proposal.balance)?;
        let mut network = self.network(&asset)?.clone();
        network.credit_regain(provider_share)?;
        network.record_cooperative_settle(provider_share)?;
        network.record_user_withdraw(proposal.balance)?;

        self.networks.insert(asset, network);
        self.channel_mut(channel_id)?.mark_settled();
        if let Some(p) = self.proposals.settles.get_mut(channel_id) {
            p.approvals = approvals;
            p.is_confirmed = true;
        }
        self.request_payout(&asset, &user, proposal.balance);

        info!(
            channel = %short_id(channel_id),
            user_amount = proposal.balance,
            provider_share,
            "channel settled cooperatively"
        );
        Ok(true)
    }

    /// Discard an expired settlement and reopen the channel.
    pub fn unlock_cooperative_settle(&mut self, channel_id: &Hash32) -> LedgerResult<()> {
        let lcb = self
            .proposals
            .settles
            .get(channel_id)
            .filter(|p| !p.is_confirmed)
            .map(|p| p.last_commit_block)
            .ok_or_else(|| LedgerError::NoPendingProposal(short_id(channel_id)))?;
        self.ensure_expired(lcb)?;
        self.proposals.settles.remove(channel_id);
        let channel = self.channel_mut(channel_id)?;
        if channel.status == ChannelStatus::Closing {
            channel.status = ChannelStatus::Open;
        }
        warn!(channel = %short_id(channel_id), "cooperative settle unlocked after timeout");
        Ok(())
    }

    // -- Rebalance ----------------------------------------------------------

    /// The provider asks to raise the channel's cumulative rebalance-in to
    /// `amount`. Returns the digest the auditor must confirm.
    pub fn propose_rebalance(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        amount: u64,
        nonce: u64,
        signature: Signature,
    ) -> LedgerResult<Hash32> {
        self.roles
            .authorize(caller, &[Role::Provider], None, &self.delegates)?;
        let channel = self.open_channel_for(channel_id)?;
        let (asset, current, last_nonce) =
            (channel.asset, channel.rebalance_in, channel.rebalance_nonce);
        self.ensure_no_pending(channel_id)?;
        if nonce <= last_nonce {
            return Err(LedgerError::StaleNonce {
                got: nonce,
                last: last_nonce,
            });
        }
        let digest = rebalance_digest(&self.config.verifying_ledger, channel_id, amount, nonce);
        self.roles
            .authorize_signature(Role::Provider, &digest, &signature)?;
        let delta = amount
            .checked_sub(current)
            .filter(|d| *d > 0)
            .ok_or(LedgerError::InvalidArgument("rebalance must increase the channel"))?;
        let pool = self.network(&asset)?.provider_balance;
        if delta > pool {
            return Err(LedgerError::InsufficientBalance {
                needed: delta,
                available: pool,
            });
        }
        let last_commit_block = self
            .height
            .checked_add(self.config.rebalance_commit_blocks)
            .ok_or(LedgerError::AmountOverflow)?;

        self.proposals.rebalances.insert(
            digest,
            RebalanceProposal {
                digest,
                channel_id: *channel_id,
                amount,
                nonce,
                last_commit_block,
                approvals: Approvals {
                    provider: Some(signature),
                    auditor: None,
                },
                is_confirmed: false,
            },
        );
        info!(channel = %short_id(channel_id), amount, delta, nonce, "rebalance proposed");
        Ok(digest)
    }

    /// The auditor confirms a rebalance by its digest. Liquidity moves from
    /// the pool into the channel, and any parked arrears are retried.
    pub fn confirm_rebalance(
        &mut self,
        caller: &Address,
        digest: &Hash32,
        signature: Signature,
    ) -> LedgerResult<ArrearsStatus> {
        self.roles
            .authorize(caller, &[Role::Auditor], None, &self.delegates)?;
        let proposal = self
            .proposals
            .rebalances
            .get(digest)
            .filter(|p| !p.is_confirmed)
            .cloned()
            .ok_or_else(|| LedgerError::NoPendingProposal(hex::encode(&digest[..8])))?;
        self.ensure_live(proposal.last_commit_block)?;
        self.roles
            .authorize_signature(Role::Auditor, digest, &signature)?;

        let channel = self.open_channel_for(&proposal.channel_id)?;
        let asset = channel.asset;
        let delta = sub(proposal.amount, channel.rebalance_in)?;
        let provider_balance = add(channel.provider_balance, delta)?;
        let mut network = self.network(&asset)?.clone();
        network.debit_rebalance(delta)?;

        self.networks.insert(asset, network);
        let channel = self.channel_mut(&proposal.channel_id)?;
        channel.provider_balance = provider_balance;
        channel.rebalance_in = proposal.amount;
        channel.rebalance_nonce = proposal.nonce;
        if let Some(p) = self.proposals.rebalances.get_mut(digest) {
            p.approvals.auditor = Some(signature);
            p.is_confirmed = true;
        }
        let pruned = self
            .proposals
            .prune_confirmed_rebalances(&proposal.channel_id, digest);

        info!(
            channel = %short_id(&proposal.channel_id),
            delta,
            rebalance_in = proposal.amount,
            pruned,
            "rebalance confirmed"
        );
        Ok(self.retry_arrears(&proposal.channel_id))
    }

    /// Discard an expired rebalance. Arrears that were waiting on it are
    /// retried and, if still unaffordable, rejected.
    pub fn unlock_rebalance(&mut self, digest: &Hash32) -> LedgerResult<ArrearsStatus> {
        let (lcb, channel_id) = self
            .proposals
            .rebalances
            .get(digest)
            .filter(|p| !p.is_confirmed)
            .map(|p| (p.last_commit_block, p.channel_id))
            .ok_or_else(|| LedgerError::NoPendingProposal(hex::encode(&digest[..8])))?;
        self.ensure_expired(lcb)?;
        self.proposals.rebalances.remove(digest);
        warn!(channel = %short_id(&channel_id), "rebalance unlocked after timeout");
        Ok(self.retry_arrears(&channel_id))
    }
}
