//! Integration tests for co-signed proposals: user and provider
//! withdrawals, cooperative settlement and rebalancing.

mod common;

use common::{Harness, ASSET, LEDGER};
use hubpay_contracts::proposal::{
    cooperative_settle_digest, provider_withdraw_digest, rebalance_digest, user_withdraw_digest,
};
use hubpay_contracts::{ArrearsStatus, ChannelStatus, LedgerError};
use hubpay_protocol::crypto::Keypair;

fn withdraw(h: &mut Harness, amount: u64, lcb: u64) -> Result<bool, LedgerError> {
    let (user, provider, auditor, id) = (h.user_addr(), h.provider_addr(), h.auditor_addr(), h.channel);
    h.ledger.user_propose_withdraw(&user, &id, amount, user, lcb)?;
    let digest = user_withdraw_digest(&LEDGER, &id, amount, lcb);
    h.ledger
        .confirm_user_withdraw(&provider, &id, h.provider.sign(&digest))?;
    h.ledger
        .confirm_user_withdraw(&auditor, &id, h.auditor.sign(&digest))
}

// ---------------------------------------------------------------------------
// User withdraw
// ---------------------------------------------------------------------------

#[test]
fn withdraw_cannot_exceed_balance() {
    let mut h = Harness::with_channel(12, 0);
    let (user, id) = (h.user_addr(), h.channel);
    assert_eq!(
        h.ledger.user_propose_withdraw(&user, &id, 15, user, 100),
        Err(LedgerError::InsufficientBalance {
            needed: 15,
            available: 12
        })
    );
    assert!(h.ledger.proposals().user_withdraw(&id).is_none());
}

#[test]
fn withdraw_needs_both_cosigners() {
    let mut h = Harness::with_channel(12, 0);
    let (user, provider, auditor, id) = (h.user_addr(), h.provider_addr(), h.auditor_addr(), h.channel);
    h.ledger
        .user_propose_withdraw(&user, &id, 10, user, 50)
        .unwrap();

    // The channel is frozen for transfers while the withdrawal is pending.
    assert!(matches!(
        h.user_pays(1, 1, 1),
        Err(LedgerError::ChannelNotOpen(_))
    ));

    let digest = user_withdraw_digest(&LEDGER, &id, 10, 50);
    assert_eq!(
        h.ledger
            .confirm_user_withdraw(&provider, &id, h.provider.sign(&digest)),
        Ok(false)
    );
    assert_eq!(h.ledger.channel(&id).unwrap().user_balance, 12);
    assert_eq!(
        h.ledger
            .confirm_user_withdraw(&auditor, &id, h.auditor.sign(&digest)),
        Ok(true)
    );

    let ch = h.ledger.channel(&id).unwrap();
    assert_eq!(ch.user_balance, 2);
    assert_eq!(ch.user_withdraw, 10);
    assert_eq!(h.ledger.escrow().paid_to(&ASSET, &user), 10);
    assert_eq!(h.ledger.network(&ASSET).unwrap().user_total_withdraw, 10);

    h.user_pays(1, 1, 1).unwrap();
    h.ledger.reconcile(&ASSET).unwrap();
}

#[test]
fn withdraw_signature_must_match_caller_role() {
    let mut h = Harness::with_channel(12, 0);
    let (user, provider, id) = (h.user_addr(), h.provider_addr(), h.channel);
    h.ledger
        .user_propose_withdraw(&user, &id, 10, user, 50)
        .unwrap();
    let digest = user_withdraw_digest(&LEDGER, &id, 10, 50);
    assert_eq!(
        h.ledger
            .confirm_user_withdraw(&provider, &id, h.auditor.sign(&digest)),
        Err(LedgerError::InvalidSignature)
    );
    // The user cannot co-sign their own withdrawal.
    assert!(matches!(
        h.ledger
            .confirm_user_withdraw(&user, &id, h.user.sign(&digest)),
        Err(LedgerError::UnauthorizedSigner { .. })
    ));
}

#[test]
fn withdraw_to_another_receiver() {
    let mut h = Harness::with_channel(100, 0);
    let (user, provider, auditor, id) = (h.user_addr(), h.provider_addr(), h.auditor_addr(), h.channel);
    let receiver = Keypair::from_seed(&[9u8; 32]).address();
    h.ledger
        .user_propose_withdraw(&user, &id, 40, receiver, 50)
        .unwrap();
    let digest = user_withdraw_digest(&LEDGER, &id, 40, 50);
    h.ledger
        .confirm_user_withdraw(&provider, &id, h.provider.sign(&digest))
        .unwrap();
    h.ledger
        .confirm_user_withdraw(&auditor, &id, h.auditor.sign(&digest))
        .unwrap();
    assert_eq!(h.ledger.escrow().paid_to(&ASSET, &receiver), 40);
    assert_eq!(h.ledger.escrow().paid_to(&ASSET, &user), 0);
}

#[test]
fn expired_withdraw_is_unlocked() {
    let mut h = Harness::with_channel(100, 0);
    let (user, auditor, id) = (h.user_addr(), h.auditor_addr(), h.channel);
    h.ledger
        .user_propose_withdraw(&user, &id, 40, user, 10)
        .unwrap();
    h.ledger.advance_to(11).unwrap();
    let digest = user_withdraw_digest(&LEDGER, &id, 40, 10);
    assert_eq!(
        h.ledger
            .confirm_user_withdraw(&auditor, &id, h.auditor.sign(&digest)),
        Err(LedgerError::ProposalExpired {
            last_commit_block: 10,
            height: 11
        })
    );
    h.ledger.unlock_user_withdraw(&id).unwrap();
    assert!(h.ledger.proposals().user_withdraw(&id).is_none());
    assert_eq!(h.ledger.channel(&id).unwrap().user_balance, 100);
    h.user_pays(1, 1, 1).unwrap();
}

#[test]
fn proposal_past_its_commit_block_is_refused() {
    let mut h = Harness::with_channel(100, 0);
    h.ledger.advance_to(30).unwrap();
    let (user, id) = (h.user_addr(), h.channel);
    assert!(matches!(
        h.ledger.user_propose_withdraw(&user, &id, 40, user, 29),
        Err(LedgerError::ProposalExpired { .. })
    ));
}

// ---------------------------------------------------------------------------
// Cooperative settle
// ---------------------------------------------------------------------------

#[test]
fn settle_after_partial_withdraw_cannot_claim_original_deposit() {
    let mut h = Harness::with_channel(10, 0);
    assert_eq!(withdraw(&mut h, 5, 50), Ok(true));
    let (user, id) = (h.user_addr(), h.channel);
    assert_eq!(
        h.ledger.propose_cooperative_settle(&user, &id, 10, 50),
        Err(LedgerError::InsufficientBalance {
            needed: 10,
            available: 5
        })
    );
    h.ledger
        .propose_cooperative_settle(&user, &id, 5, 50)
        .unwrap();
}

#[test]
fn no_transfers_once_settle_is_proposed() {
    let mut h = Harness::with_channel(1_000, 1_000);
    h.rebalance(100, 1).unwrap();
    let (user, id) = (h.user_addr(), h.channel);
    h.ledger
        .propose_cooperative_settle(&user, &id, 1_000, 10)
        .unwrap();
    assert!(matches!(h.user_pays(10, 1, 10), Err(LedgerError::ChannelNotOpen(_))));
    assert!(matches!(
        h.provider_pays(10, 1, 10),
        Err(LedgerError::ChannelNotOpen(_))
    ));
}

#[test]
fn settle_timeout_restores_open_channel() {
    let mut h = Harness::with_channel(1_000, 0);
    h.user_pays(300, 1, 300).unwrap();
    let before = h.ledger.channel(&h.channel).unwrap().clone();
    let (user, provider, auditor, id) = (h.user_addr(), h.provider_addr(), h.auditor_addr(), h.channel);

    h.ledger
        .propose_cooperative_settle(&user, &id, 700, 10)
        .unwrap();
    let digest = cooperative_settle_digest(&LEDGER, &id, 700, 10);
    h.ledger
        .confirm_cooperative_settle(&provider, &id, h.provider.sign(&digest))
        .unwrap();

    h.ledger.advance_to(10).unwrap();
    assert!(matches!(
        h.ledger.unlock_cooperative_settle(&id),
        Err(LedgerError::ProposalNotExpired { .. })
    ));
    h.ledger.advance_to(11).unwrap();
    assert!(matches!(
        h.ledger
            .confirm_cooperative_settle(&auditor, &id, h.auditor.sign(&digest)),
        Err(LedgerError::ProposalExpired { .. })
    ));
    h.ledger.unlock_cooperative_settle(&id).unwrap();

    let after = h.ledger.channel(&id).unwrap();
    assert_eq!(after.status, ChannelStatus::Open);
    assert_eq!(after, &before);
    h.user_pays(400, 2, 100).unwrap();
}

#[test]
fn settle_credits_provider_share_to_pool() {
    let mut h = Harness::with_channel(1_000, 500);
    h.user_pays(300, 1, 300).unwrap();
    let (user, provider, auditor, id) = (h.user_addr(), h.provider_addr(), h.auditor_addr(), h.channel);
    h.ledger
        .propose_cooperative_settle(&user, &id, 700, 10)
        .unwrap();
    let digest = cooperative_settle_digest(&LEDGER, &id, 700, 10);
    h.ledger
        .confirm_cooperative_settle(&auditor, &id, h.auditor.sign(&digest))
        .unwrap();
    assert!(h
        .ledger
        .confirm_cooperative_settle(&provider, &id, h.provider.sign(&digest))
        .unwrap());

    let ch = h.ledger.channel(&id).unwrap();
    assert_eq!(ch.status, ChannelStatus::Settled);
    assert_eq!(ch.total().unwrap(), 0);
    let net = h.ledger.network(&ASSET).unwrap();
    assert_eq!(net.provider_balance, 800);
    assert_eq!(net.total_regained, 300);
    assert_eq!(h.ledger.escrow().paid_to(&ASSET, &user), 700);
    h.ledger.reconcile(&ASSET).unwrap();

    // A settled channel may be opened again, under a fresh id.
    let reopened = h.ledger.open_channel(&auditor, &user, &ASSET, 50).unwrap();
    assert_ne!(reopened, id);
    assert_eq!(h.ledger.channel_id_for(&user, &ASSET), reopened);
    assert_eq!(h.ledger.channel_status(&reopened), ChannelStatus::Open);
    assert_eq!(h.ledger.channel(&reopened).unwrap().epoch, 1);
    assert_eq!(h.ledger.channel_status(&id), ChannelStatus::Settled);
    assert!(matches!(
        h.ledger.open_channel(&auditor, &user, &ASSET, 50),
        Err(LedgerError::ChannelAlreadyExists(_))
    ));
    h.ledger.reconcile(&ASSET).unwrap();
}

#[test]
fn one_pending_proposal_per_channel() {
    let mut h = Harness::with_channel(1_000, 1_000);
    let (user, id) = (h.user_addr(), h.channel);
    h.ledger
        .user_propose_withdraw(&user, &id, 10, user, 50)
        .unwrap();
    assert!(matches!(
        h.ledger.propose_cooperative_settle(&user, &id, 990, 50),
        Err(LedgerError::ProposalAlreadyPending(_))
    ));
    assert!(matches!(
        h.propose_rebalance(100, 1),
        Err(LedgerError::ProposalAlreadyPending(_))
    ));
}

// ---------------------------------------------------------------------------
// Provider withdraw
// ---------------------------------------------------------------------------

#[test]
fn provider_withdraw_limited_by_pool() {
    let mut h = Harness::with_channel(100, 50);
    let (provider, auditor) = (h.provider_addr(), h.auditor_addr());
    assert_eq!(
        h.ledger.provider_propose_withdraw(&provider, &ASSET, 60, 10),
        Err(LedgerError::InsufficientBalance {
            needed: 60,
            available: 50
        })
    );
    // Channel funds are not the provider's to withdraw.
    assert!(matches!(
        h.ledger.provider_propose_withdraw(&auditor, &ASSET, 10, 10),
        Err(LedgerError::UnauthorizedSigner { .. })
    ));

    h.ledger
        .provider_propose_withdraw(&provider, &ASSET, 30, 10)
        .unwrap();
    assert!(matches!(
        h.ledger.provider_propose_withdraw(&provider, &ASSET, 10, 10),
        Err(LedgerError::ProposalAlreadyPending(_))
    ));
    let digest = provider_withdraw_digest(&LEDGER, &ASSET, 30, 10);
    assert!(matches!(
        h.ledger
            .confirm_provider_withdraw(&provider, &ASSET, h.provider.sign(&digest)),
        Err(LedgerError::UnauthorizedSigner { .. })
    ));
    h.ledger
        .confirm_provider_withdraw(&auditor, &ASSET, h.auditor.sign(&digest))
        .unwrap();
    assert_eq!(h.ledger.network(&ASSET).unwrap().provider_balance, 20);
    assert_eq!(h.ledger.escrow().paid_to(&ASSET, &provider), 30);
    h.ledger.reconcile(&ASSET).unwrap();
}

#[test]
fn provider_withdraw_times_out() {
    let mut h = Harness::with_channel(100, 50);
    let provider = h.provider_addr();
    h.ledger
        .provider_propose_withdraw(&provider, &ASSET, 30, 5)
        .unwrap();
    assert!(matches!(
        h.ledger.unlock_provider_withdraw(&ASSET),
        Err(LedgerError::ProposalNotExpired { .. })
    ));
    h.ledger.advance_to(6).unwrap();
    h.ledger.unlock_provider_withdraw(&ASSET).unwrap();
    assert_eq!(h.ledger.network(&ASSET).unwrap().provider_balance, 50);
    assert!(matches!(
        h.ledger.unlock_provider_withdraw(&ASSET),
        Err(LedgerError::NoPendingProposal(_))
    ));
}

// ---------------------------------------------------------------------------
// Rebalance
// ---------------------------------------------------------------------------

#[test]
fn rebalance_cannot_exceed_pool() {
    let mut h = Harness::with_channel(100, 10);
    assert_eq!(
        h.propose_rebalance(20, 1),
        Err(LedgerError::InsufficientBalance {
            needed: 20,
            available: 10
        })
    );
    assert!(h.ledger.proposals().pending_rebalance_for(&h.channel).is_none());
}

#[test]
fn rebalance_amounts_are_cumulative() {
    let mut h = Harness::with_channel(100, 1_000);
    assert_eq!(h.rebalance(300, 1), Ok(ArrearsStatus::Empty));
    assert_eq!(h.rebalance(500, 2), Ok(ArrearsStatus::Empty));
    let ch = h.ledger.channel(&h.channel).unwrap();
    assert_eq!(ch.rebalance_in, 500);
    assert_eq!(ch.provider_balance, 500);
    assert_eq!(h.ledger.network(&ASSET).unwrap().provider_balance, 500);

    // Only the latest confirmed rebalance is kept per channel.
    let (first, _, _) = h.rebalance_sigs(300, 1);
    let (latest, _, _) = h.rebalance_sigs(500, 2);
    assert!(h.ledger.proposals().rebalance(&first).is_none());
    assert!(h.ledger.proposals().rebalance(&latest).unwrap().is_confirmed);

    assert!(matches!(
        h.propose_rebalance(600, 2),
        Err(LedgerError::StaleNonce { got: 2, last: 2 })
    ));
    assert!(matches!(
        h.propose_rebalance(400, 3),
        Err(LedgerError::InvalidArgument(_))
    ));
    h.ledger.reconcile(&ASSET).unwrap();
}

#[test]
fn rebalance_confirmation_is_bound_to_its_digest() {
    let mut h = Harness::with_channel(100, 1_000);
    let auditor = h.auditor_addr();
    let digest = h.propose_rebalance(300, 1).unwrap();
    assert_eq!(
        h.ledger.proposals().rebalance(&digest).unwrap().channel_id,
        h.channel
    );

    // A signature over some other digest does not confirm this one.
    let other = rebalance_digest(&LEDGER, &h.channel, 400, 1);
    assert_eq!(
        h.ledger
            .confirm_rebalance(&auditor, &digest, h.auditor.sign(&other)),
        Err(LedgerError::InvalidSignature)
    );
    assert!(matches!(
        h.ledger
            .confirm_rebalance(&auditor, &other, h.auditor.sign(&other)),
        Err(LedgerError::NoPendingProposal(_))
    ));
    h.confirm_rebalance(&digest).unwrap();
    assert!(matches!(
        h.confirm_rebalance(&digest),
        Err(LedgerError::NoPendingProposal(_))
    ));
}

#[test]
fn rebalance_proposal_needs_provider_signature() {
    let mut h = Harness::with_channel(100, 1_000);
    let (provider, id) = (h.provider_addr(), h.channel);
    let digest = rebalance_digest(&LEDGER, &id, 300, 1);
    assert_eq!(
        h.ledger
            .propose_rebalance(&provider, &id, 300, 1, h.auditor.sign(&digest)),
        Err(LedgerError::InvalidSignature)
    );
}
