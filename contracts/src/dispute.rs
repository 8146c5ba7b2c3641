//! # Disputes: the force path
//!
//! When cooperation stalls, either side can close a channel on its own:
//!
//! 1. **Close.** The initiator submits the best proof it holds that was
//!    signed by the *other* side, plus optionally a rebalance-in co-signed
//!    by provider and auditor. The channel goes to `Closing` and a
//!    challenge window of `settle_window_blocks` starts. Pending proposals
//!    on the channel are discarded.
//! 2. **Challenge.** During the window the other side may submit a newer
//!    proof signed by the initiator, superseding what the ledger holds.
//!    That is what stops an initiator from closing on a stale proof.
//! 3. **Settle.** After the window anyone may settle:
//!
//! ```text
//! userDeposit      = deposit - userWithdraw
//! channelTotal     = userDeposit + rebalanceIn
//! userSettleAmount = clamp(0, channelTotal,
//!                          userDeposit + providerTransferred - userTransferred)
//! providerRegain   = userDeposit - userSettleAmount
//! ```
//!
//! The user is paid `userSettleAmount`; everything else in the channel
//! (`providerRegain + rebalanceIn`) goes back to the provider's pool.
//!
//! The ledger's own accepted proofs are the floor for both directions:
//! submitting an older proof than the ledger already holds changes nothing.

use hubpay_protocol::crypto::{identify_signer, transfer_digest, Address, Hash32, Signature};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::{short_id, Channel, ChannelStatus, Direction};
use crate::error::{add, LedgerError, LedgerResult};
use crate::escrow::EscrowInterface;
use crate::ledger::Ledger;
use crate::proposal::rebalance_digest;
use crate::roles::Role;

/// Arguments of [`Ledger::close_channel`].
///
/// A zero `counterparty_balance` and `counterparty_nonce` with no signature
/// means "I hold nothing newer than the ledger". A zero
/// `rebalance_in_amount` means no rebalance claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub counterparty_balance: u64,
    pub counterparty_nonce: u64,
    pub counterparty_additional_hash: Hash32,
    pub counterparty_signature: Option<Signature>,
    pub rebalance_in_amount: u64,
    pub rebalance_in_nonce: u64,
    pub auditor_signature: Option<Signature>,
    pub provider_signature: Option<Signature>,
}

/// State of a channel under force close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingRecord {
    /// `User` or `Provider`.
    pub initiator: Role,
    pub user_transferred: u64,
    pub user_nonce: u64,
    pub provider_transferred: u64,
    pub provider_nonce: u64,
    /// Cumulative rebalance-in the settlement uses.
    pub rebalance_in: u64,
    pub closed_at: u64,
    /// Last block of the challenge window.
    pub settle_block: u64,
}

impl ClosingRecord {
    /// The direction whose payments the initiator signed.
    pub fn initiator_direction(&self) -> Direction {
        match self.initiator {
            Role::Provider => Direction::ProviderToUser,
            _ => Direction::UserToProvider,
        }
    }

    fn progress(&self, direction: Direction) -> (u64, u64) {
        match direction {
            Direction::UserToProvider => (self.user_transferred, self.user_nonce),
            Direction::ProviderToUser => (self.provider_transferred, self.provider_nonce),
        }
    }

    fn set_progress(&mut self, direction: Direction, transferred: u64, nonce: u64) {
        match direction {
            Direction::UserToProvider => {
                self.user_transferred = transferred;
                self.user_nonce = nonce;
            }
            Direction::ProviderToUser => {
                self.provider_transferred = transferred;
                self.provider_nonce = nonce;
            }
        }
    }
}

/// Outcome of a forced settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Paid out to the user.
    pub user_settle_amount: u64,
    /// `userDeposit - userSettleAmount`. Negative when the user walks away
    /// with more than they deposited.
    pub provider_regain: i128,
    /// Credited back to the provider's pool.
    pub returned_to_pool: u64,
}

/// Pure settlement arithmetic.
pub fn compute_settlement(
    user_deposit: u64,
    rebalance_in: u64,
    user_transferred: u64,
    provider_transferred: u64,
) -> LedgerResult<Settlement> {
    let channel_total = add(user_deposit, rebalance_in)?;
    let raw = user_deposit as i128 + provider_transferred as i128 - user_transferred as i128;
    let user_settle_amount = raw.clamp(0, channel_total as i128) as u64;
    Ok(Settlement {
        user_settle_amount,
        provider_regain: user_deposit as i128 - user_settle_amount as i128,
        returned_to_pool: channel_total - user_settle_amount,
    })
}

impl<E: EscrowInterface> Ledger<E> {
    /// Check a proof signed by the paying side of `direction`, including
    /// consignor ratification when a delegate signed it.
    #[allow(clippy::too_many_arguments)]
    fn verify_closing_proof(
        &self,
        channel: &Channel,
        direction: Direction,
        balance: u64,
        nonce: u64,
        additional_hash: &Hash32,
        signature: &Signature,
        consignor_signature: Option<&Signature>,
    ) -> LedgerResult<()> {
        let digest = transfer_digest(&self.domain, &channel.id, balance, nonce, additional_hash);
        match direction {
            Direction::ProviderToUser => {
                self.roles
                    .authorize_signature(Role::Provider, &digest, signature)
            }
            Direction::UserToProvider => {
                let candidates = self.delegates.signers_for(&channel.user);
                let signer = match identify_signer(&digest, signature, &candidates) {
                    Ok(signer) => signer,
                    Err(_) => {
                        return match identify_signer(
                            &digest,
                            signature,
                            &self.delegates.disabled_for(&channel.user),
                        ) {
                            Ok(revoked) => Err(LedgerError::UnauthorizedSigner {
                                signer: revoked,
                                reason: "delegate is disabled",
                            }),
                            Err(_) => Err(LedgerError::InvalidSignature),
                        }
                    }
                };
                if signer == channel.user {
                    return Ok(());
                }
                let ratified_now = consignor_signature.is_some_and(|sig| {
                    identify_signer(&digest, sig, &[self.roles.consignor(), channel.user]).is_ok()
                });
                let ratified_before = channel.user_side.proof.as_ref().is_some_and(|p| {
                    p.nonce == nonce && p.balance == balance && p.is_ratified()
                });
                if ratified_now || ratified_before {
                    Ok(())
                } else {
                    Err(LedgerError::UnauthorizedSigner {
                        signer,
                        reason: "delegate-signed proof lacks consignor ratification",
                    })
                }
            }
        }
    }

    /// Start a unilateral close. `caller` must be the channel's user or the
    /// provider.
    pub fn close_channel(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        request: CloseRequest,
    ) -> LedgerResult<()> {
        let channel = self.channel(channel_id)?;
        let initiator = self.roles.authorize(
            caller,
            &[Role::User, Role::Provider],
            Some(&channel.user),
            &self.delegates,
        )?;
        let settle_pending = self
            .proposals
            .cooperative_settle(channel_id)
            .is_some_and(|p| !p.is_confirmed);
        let closable = channel.status == ChannelStatus::Open
            || (channel.status == ChannelStatus::Closing && settle_pending);
        if !closable || self.closings.contains_key(channel_id) {
            return Err(LedgerError::ChannelNotOpen(short_id(channel_id)));
        }

        // The counterparty's payments, signed by the counterparty.
        let proof_direction = match initiator {
            Role::Provider => Direction::UserToProvider,
            _ => Direction::ProviderToUser,
        };
        let side = channel.side(proof_direction);
        let (mut counter_transferred, mut counter_nonce) = (side.transferred, side.nonce);
        if let Some(signature) = &request.counterparty_signature {
            self.verify_closing_proof(
                channel,
                proof_direction,
                request.counterparty_balance,
                request.counterparty_nonce,
                &request.counterparty_additional_hash,
                signature,
                None,
            )?;
            if request.counterparty_nonce > side.nonce {
                if request.counterparty_balance < side.transferred {
                    return Err(LedgerError::BalanceMismatch {
                        claimed: request.counterparty_balance,
                        expected: side.transferred,
                    });
                }
                counter_transferred = request.counterparty_balance;
                counter_nonce = request.counterparty_nonce;
            } else {
                debug!(channel = %short_id(channel_id), "submitted proof not newer than ledger's");
            }
        } else if request.counterparty_nonce != 0 || request.counterparty_balance != 0 {
            return Err(LedgerError::InvalidSignature);
        }

        // Optional rebalance-in claim: both co-signatures or nothing.
        let mut rebalance_in = channel.rebalance_in;
        let mut rebalance_nonce = channel.rebalance_nonce;
        let mut extra = 0;
        if request.rebalance_in_amount > 0 {
            let digest = rebalance_digest(
                &self.config.verifying_ledger,
                channel_id,
                request.rebalance_in_amount,
                request.rebalance_in_nonce,
            );
            let (Some(provider_sig), Some(auditor_sig)) =
                (&request.provider_signature, &request.auditor_signature)
            else {
                return Err(LedgerError::InvalidSignature);
            };
            self.roles
                .authorize_signature(Role::Provider, &digest, provider_sig)?;
            self.roles
                .authorize_signature(Role::Auditor, &digest, auditor_sig)?;
            if request.rebalance_in_amount > channel.rebalance_in {
                if request.rebalance_in_nonce <= channel.rebalance_nonce {
                    return Err(LedgerError::StaleNonce {
                        got: request.rebalance_in_nonce,
                        last: channel.rebalance_nonce,
                    });
                }
                extra = request.rebalance_in_amount - channel.rebalance_in;
                rebalance_in = request.rebalance_in_amount;
                rebalance_nonce = request.rebalance_in_nonce;
            }
        }
        let provider_balance = add(channel.provider_balance, extra)?;
        let mut network = self.network(&channel.asset)?.clone();
        network.debit_rebalance(extra)?;

        let own_direction = proof_direction.reverse();
        let own = channel.side(own_direction);
        let mut record = ClosingRecord {
            initiator,
            user_transferred: 0,
            user_nonce: 0,
            provider_transferred: 0,
            provider_nonce: 0,
            rebalance_in,
            closed_at: self.height,
            settle_block: self
                .height
                .checked_add(self.config.settle_window_blocks)
                .ok_or(LedgerError::AmountOverflow)?,
        };
        record.set_progress(own_direction, own.transferred, own.nonce);
        record.set_progress(proof_direction, counter_transferred, counter_nonce);

        // Commit.
        let dropped = self.proposals.discard_channel(channel_id);
        self.networks.insert(network.asset, network);
        let channel = self.channel_mut(channel_id)?;
        channel.provider_balance = provider_balance;
        channel.rebalance_in = rebalance_in;
        channel.rebalance_nonce = rebalance_nonce;
        channel.arrears = None;
        channel.status = ChannelStatus::Closing;
        info!(
            channel = %short_id(channel_id),
            %initiator,
            settle_block = record.settle_block,
            rebalance_in,
            discarded = dropped.len(),
            "channel force-closed"
        );
        self.closings.insert(*channel_id, record);
        Ok(())
    }

    /// During the challenge window, the non-initiating side submits a newer
    /// proof signed by the initiator.
    #[allow(clippy::too_many_arguments)]
    pub fn partner_update_proof(
        &mut self,
        caller: &Address,
        channel_id: &Hash32,
        balance: u64,
        nonce: u64,
        additional_hash: Hash32,
        signature: Signature,
        consignor_signature: Option<Signature>,
    ) -> LedgerResult<()> {
        let channel = self.channel(channel_id)?;
        let record = self
            .closings
            .get(channel_id)
            .ok_or_else(|| LedgerError::NoPendingProposal(format!("force close on {}", short_id(channel_id))))?;
        if self.height > record.settle_block {
            return Err(LedgerError::ChallengeWindowClosed {
                settle_block: record.settle_block,
                height: self.height,
            });
        }
        let partner = match record.initiator {
            Role::Provider => Role::User,
            _ => Role::Provider,
        };
        self.roles
            .authorize(caller, &[partner], Some(&channel.user), &self.delegates)?;

        let direction = record.initiator_direction();
        let (recorded_transferred, recorded_nonce) = record.progress(direction);
        if nonce <= recorded_nonce {
            return Err(LedgerError::StaleNonce {
                got: nonce,
                last: recorded_nonce,
            });
        }
        self.verify_closing_proof(
            channel,
            direction,
            balance,
            nonce,
            &additional_hash,
            &signature,
            consignor_signature.as_ref(),
        )?;
        if balance < recorded_transferred {
            return Err(LedgerError::BalanceMismatch {
                claimed: balance,
                expected: recorded_transferred,
            });
        }

        if let Some(record) = self.closings.get_mut(channel_id) {
            record.set_progress(direction, balance, nonce);
        }
        info!(channel = %short_id(channel_id), %direction, nonce, balance, "closing proof updated by partner");
        Ok(())
    }

    /// Finish a force close after the challenge window.
    pub fn settle_channel(&mut self, channel_id: &Hash32) -> LedgerResult<Settlement> {
        let channel = self.channel(channel_id)?;
        let record = self
            .closings
            .get(channel_id)
            .ok_or_else(|| LedgerError::NoPendingProposal(format!("force close on {}", short_id(channel_id))))?;
        if self.height <= record.settle_block {
            return Err(LedgerError::ChallengeWindowOpen {
                settle_block: record.settle_block,
                height: self.height,
            });
        }
        let settlement = compute_settlement(
            channel.net_deposit()?,
            record.rebalance_in,
            record.user_transferred,
            record.provider_transferred,
        )?;
        let (asset, user) = (channel.asset, channel.user);
        let mut network = self.network(&asset)?.clone();
        network.credit_regain(settlement.returned_to_pool)?;
        network.record_user_withdraw(settlement.user_settle_amount)?;

        self.networks.insert(asset, network);
        self.channel_mut(channel_id)?.mark_settled();
        self.closings.remove(channel_id);
        self.request_payout(&asset, &user, settlement.user_settle_amount);

        info!(
            channel = %short_id(channel_id),
            user_amount = settlement.user_settle_amount,
            provider_regain = settlement.provider_regain,
            returned = settlement.returned_to_pool,
            "channel settled after dispute"
        );
        Ok(settlement)
    }
}
