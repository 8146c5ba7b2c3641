//! # Transfers
//!
//! The hot path. A transfer is a balance proof signed by the paying side:
//! "I have now paid `balance` in total, this is message number `nonce`".
//! The ledger checks it in a fixed order and either applies it whole or
//! rejects it untouched:
//!
//! 1. The channel is open and no withdrawal is pending.
//! 2. `nonce` is above the last accepted nonce for that direction.
//! 3. The signature is the payer's, or an enabled delegate's for a user.
//! 4. `amount == balance - previously transferred`, and the payer can
//!    afford it. The provider side must also keep enough to cover fees
//!    charged on the channel but not yet realized.
//!
//! ## Arrears
//!
//! The provider sometimes pays a user before the rebalance that funds the
//! payment has been confirmed. Such a proof is parked in the channel's
//! arrears slot instead of being rejected, and retried whenever the
//! channel's liquidity changes. If the rebalance never lands, the proof is
//! rejected for insufficient balance. The slot holds one proof; further
//! provider payments on the channel wait until it resolves.
//!
//! ## Fees
//!
//! User-paid transfers are charged `amount × fee_rate / 10_000` at the rate
//! in force at that moment. The charge is booked as pending; the provider
//! realizes it later with a signed, nonce-ordered fee proof.

use hubpay_protocol::config::TAG_FEE;
use hubpay_protocol::crypto::{
    identify_signer, transfer_digest, Address, Hash32, PackedEncoder, Signature,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{short_id, BalanceProof, Channel, Direction};
use crate::error::{add, LedgerError, LedgerResult};
use crate::escrow::EscrowInterface;
use crate::ledger::Ledger;
use crate::roles::Role;

/// What the provider signs to realize fees up to `cumulative`.
pub fn fee_digest(ledger: &Address, asset: &Address, cumulative: u64, nonce: u64) -> Hash32 {
    PackedEncoder::new()
        .bytes32(ledger.as_bytes())
        .tag(TAG_FEE)
        .bytes32(asset.as_bytes())
        .word(cumulative as u128)
        .word(nonce as u128)
        .finish()
}

/// Take up to `amount` off a channel's pending fee. Returns what was taken.
fn clear_fee_pending(channel: &mut Channel, amount: u64) -> u64 {
    let cleared = channel.fee_pending.min(amount);
    channel.fee_pending -= cleared;
    cleared
}

/// Result of an accepted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// Balances moved. `fee` is what this transfer was charged.
    Applied { fee: u64 },
    /// Parked until a pending rebalance lands.
    Arrears,
}

/// What happened to a channel's parked arrears after a liquidity change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrearsStatus {
    /// Nothing was parked.
    Empty,
    Applied { nonce: u64 },
    /// Still waiting on a pending rebalance.
    StillParked,
    /// Dropped for good.
    Rejected(LedgerError),
}

impl<E: EscrowInterface> Ledger<E> {
    /// Apply a signed balance proof from `payer`.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer(
        &mut self,
        payer: &Address,
        channel_id: &Hash32,
        balance: u64,
        nonce: u64,
        amount: u64,
        additional_hash: Hash32,
        signature: Signature,
    ) -> LedgerResult<TransferOutcome> {
        let channel = self.channel(channel_id)?;
        let direction = self.direction_of(channel, payer)?;
        if !channel.is_open() || self.proposals.has_pending_withdraw(channel_id) {
            return Err(LedgerError::ChannelNotOpen(short_id(channel_id)));
        }
        let side = channel.side(direction);
        if nonce <= side.nonce {
            return Err(LedgerError::StaleNonce {
                got: nonce,
                last: side.nonce,
            });
        }
        let digest = transfer_digest(&self.domain, channel_id, balance, nonce, &additional_hash);
        let signer = self.identify_payer(direction, &channel.user, &digest, &signature)?;
        let expected = balance.saturating_sub(side.transferred);
        if balance < side.transferred || amount != expected {
            return Err(LedgerError::BalanceMismatch {
                claimed: amount,
                expected,
            });
        }
        if amount == 0 {
            return Err(LedgerError::InvalidArgument("transfer amount must be positive"));
        }

        let proof = BalanceProof {
            channel_id: *channel_id,
            balance,
            nonce,
            amount,
            additional_hash,
            signature,
            signer,
            consignor_signature: None,
        };

        if direction == Direction::ProviderToUser {
            if let Some(parked) = &channel.arrears {
                return Err(LedgerError::ProposalAlreadyPending(format!(
                    "arrears nonce {} on channel {}",
                    parked.nonce,
                    short_id(channel_id)
                )));
            }
        }

        let available = channel.spendable(direction);
        if amount <= available {
            let fee = self.apply_transfer(direction, proof)?;
            return Ok(TransferOutcome::Applied { fee });
        }

        if direction == Direction::ProviderToUser && self.rebalance_covers(channel, amount) {
            self.channel_mut(channel_id)?.arrears = Some(proof);
            info!(channel = %short_id(channel_id), nonce, amount, "transfer parked in arrears");
            return Ok(TransferOutcome::Arrears);
        }

        debug!(channel = %short_id(channel_id), %direction, amount, available, "transfer rejected");
        Err(LedgerError::InsufficientBalance {
            needed: amount,
            available,
        })
    }

    fn direction_of(&self, channel: &Channel, payer: &Address) -> LedgerResult<Direction> {
        match self
            .roles
            .role_of(payer, Some(&channel.user), &self.delegates)
        {
            Some(Role::User) => Ok(Direction::UserToProvider),
            Some(Role::Provider) => Ok(Direction::ProviderToUser),
            _ => Err(LedgerError::UnauthorizedSigner {
                signer: *payer,
                reason: "payer is not a party to this channel",
            }),
        }
    }

    /// Which key signed a proof for the paying side.
    fn identify_payer(
        &self,
        direction: Direction,
        user: &Address,
        digest: &Hash32,
        signature: &Signature,
    ) -> LedgerResult<Address> {
        match direction {
            Direction::ProviderToUser => {
                self.roles
                    .authorize_signature(Role::Provider, digest, signature)?;
                Ok(self.roles.provider())
            }
            Direction::UserToProvider => {
                if let Ok(signer) =
                    identify_signer(digest, signature, &self.delegates.signers_for(user))
                {
                    return Ok(signer);
                }
                match identify_signer(digest, signature, &self.delegates.disabled_for(user)) {
                    Ok(revoked) => Err(LedgerError::UnauthorizedSigner {
                        signer: revoked,
                        reason: "delegate is disabled",
                    }),
                    Err(_) => Err(LedgerError::InvalidSignature),
                }
            }
        }
    }

    /// Would the pending rebalance on this channel make `amount` affordable
    /// for the provider side?
    fn rebalance_covers(&self, channel: &Channel, amount: u64) -> bool {
        let Some(pending) = self.proposals.pending_rebalance_for(&channel.id) else {
            return false;
        };
        let incoming = pending.amount.saturating_sub(channel.rebalance_in);
        channel
            .spendable(Direction::ProviderToUser)
            .checked_add(incoming)
            .is_some_and(|funded| funded >= amount)
    }

    /// Move the balances for an already validated proof. Returns the fee.
    fn apply_transfer(&mut self, direction: Direction, proof: BalanceProof) -> LedgerResult<u64> {
        let mut channel = self.channel(&proof.channel_id)?.clone();
        let mut network = self.network(&channel.asset)?.clone();

        channel.shift(direction, proof.amount)?;
        let fee = match direction {
            Direction::UserToProvider => {
                let fee = network.charge_fee(proof.amount)?;
                channel.fee_pending = add(channel.fee_pending, fee)?;
                fee
            }
            Direction::ProviderToUser => 0,
        };
        let (nonce, amount) = (proof.nonce, proof.amount);
        let side = channel.side_mut(direction);
        side.transferred = proof.balance;
        side.nonce = proof.nonce;
        side.proof = Some(proof);

        info!(
            channel = %short_id(&channel.id),
            %direction,
            nonce,
            amount,
            fee,
            user_balance = channel.user_balance,
            provider_balance = channel.provider_balance,
            "transfer applied"
        );
        self.networks.insert(channel.asset, network);
        self.channels.insert(channel.id, channel);
        Ok(fee)
    }

    /// Retry the parked proof of `channel_id` after its liquidity changed.
    pub(crate) fn retry_arrears(&mut self, channel_id: &Hash32) -> ArrearsStatus {
        let Some(channel) = self.channels.get(channel_id) else {
            return ArrearsStatus::Empty;
        };
        let Some(proof) = channel.arrears.clone() else {
            return ArrearsStatus::Empty;
        };
        let side = &channel.provider_side;
        let verdict = if !channel.is_open() {
            Err(LedgerError::ChannelNotOpen(short_id(channel_id)))
        } else if proof.nonce <= side.nonce {
            Err(LedgerError::StaleNonce {
                got: proof.nonce,
                last: side.nonce,
            })
        } else if proof.balance.checked_sub(side.transferred) != Some(proof.amount) {
            Err(LedgerError::BalanceMismatch {
                claimed: proof.amount,
                expected: proof.balance.saturating_sub(side.transferred),
            })
        } else if proof.amount <= channel.spendable(Direction::ProviderToUser) {
            Ok(true)
        } else if self.rebalance_covers(channel, proof.amount) {
            Ok(false)
        } else {
            Err(LedgerError::InsufficientBalance {
                needed: proof.amount,
                available: channel.spendable(Direction::ProviderToUser),
            })
        };

        match verdict {
            Ok(false) => ArrearsStatus::StillParked,
            Ok(true) => {
                let nonce = proof.nonce;
                if let Some(ch) = self.channels.get_mut(channel_id) {
                    ch.arrears = None;
                }
                match self.apply_transfer(Direction::ProviderToUser, proof) {
                    Ok(_) => {
                        info!(channel = %short_id(channel_id), nonce, "arrears applied");
                        ArrearsStatus::Applied { nonce }
                    }
                    Err(e) => ArrearsStatus::Rejected(e),
                }
            }
            Err(e) => {
                if let Some(ch) = self.channels.get_mut(channel_id) {
                    ch.arrears = None;
                }
                warn!(channel = %short_id(channel_id), nonce = proof.nonce, error = %e, "arrears rejected");
                ArrearsStatus::Rejected(e)
            }
        }
    }

    /// The latest accepted proof for one direction of a channel.
    pub fn accepted_proof(
        &self,
        channel_id: &Hash32,
        direction: Direction,
    ) -> LedgerResult<Option<&BalanceProof>> {
        Ok(self.channel(channel_id)?.side(direction).proof.as_ref())
    }

    /// The proof parked in a channel's arrears slot, if any.
    pub fn arrears(&self, channel_id: &Hash32) -> LedgerResult<Option<&BalanceProof>> {
        Ok(self.channel(channel_id)?.arrears.as_ref())
    }

    /// Attach a consignor's ratification to an accepted delegate-signed
    /// proof. Balances do not change.
    pub fn guard_balance_proof(
        &mut self,
        channel_id: &Hash32,
        direction: Direction,
        nonce: u64,
        consignor_signature: Signature,
    ) -> LedgerResult<()> {
        let channel = self.channel(channel_id)?;
        let side = channel.side(direction);
        let proof = side
            .proof
            .as_ref()
            .filter(|p| p.nonce == nonce)
            .ok_or(LedgerError::StaleNonce {
                got: nonce,
                last: side.nonce,
            })?;
        let delegate_signed = self
            .delegates
            .delegates_of(&channel.user)
            .iter()
            .any(|d| d.address == proof.signer);
        if !delegate_signed {
            return Err(LedgerError::InvalidArgument("proof was not signed by a delegate"));
        }
        let digest = transfer_digest(
            &self.domain,
            channel_id,
            proof.balance,
            proof.nonce,
            &proof.additional_hash,
        );
        let consignor = identify_signer(
            &digest,
            &consignor_signature,
            &[self.roles.consignor(), channel.user],
        )
        .map_err(|_| LedgerError::InvalidSignature)?;

        if let Some(proof) = self.channel_mut(channel_id)?.side_mut(direction).proof.as_mut() {
            proof.consignor_signature = Some(consignor_signature);
        }
        info!(channel = %short_id(channel_id), nonce, %consignor, "balance proof ratified");
        Ok(())
    }

    /// Realize fees of `asset` up to `cumulative` with a provider-signed
    /// fee proof. Returns the newly realized amount.
    pub fn submit_fee(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        asset: &Address,
        cumulative: u64,
        nonce: u64,
        signature: Signature,
    ) -> LedgerResult<u64> {
        self.roles
            .authorize(caller, &[Role::Provider], None, &self.delegates)?;
        if self.channel(channel_id)?.asset != *asset {
            return Err(LedgerError::InvalidArgument("channel does not hold this asset"));
        }
        let digest = fee_digest(&self.config.verifying_ledger, asset, cumulative, nonce);
        self.roles
            .authorize_signature(Role::Provider, &digest, &signature)?;

        let mut network = self.network(asset)?.clone();
        let delta = network.realize_fee(cumulative, nonce)?;
        self.networks.insert(*asset, network);
        let released = self.release_fee_pending(channel_id, asset, delta);

        info!(%asset, cumulative, nonce, delta, released, "fee realized");
        Ok(delta)
    }

    /// Clear `amount` of pending fees for `asset`, starting with
    /// `channel_id` and then every other channel of the asset. The fee proof
    /// is cumulative per asset, so what it realized may have been charged
    /// anywhere. Returns how much was cleared.
    fn release_fee_pending(&mut self, channel_id: &Hash32, asset: &Address, amount: u64) -> u64 {
        let mut remaining = amount;
        if let Some(channel) = self.channels.get_mut(channel_id) {
            remaining -= clear_fee_pending(channel, remaining);
        }
        for (id, channel) in self.channels.iter_mut() {
            if remaining == 0 {
                break;
            }
            if id != channel_id && channel.asset == *asset {
                remaining -= clear_fee_pending(channel, remaining);
            }
        }
        amount - remaining
    }
}
