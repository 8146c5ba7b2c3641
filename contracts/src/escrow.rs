//! # Escrow Interface
//!
//! The escrow holds the real funds. The ledger only talks to it through
//! [`EscrowInterface`]: it announces deposits it has seen and asks for
//! payouts once its own books are committed. Payouts are confirmed later,
//! on the escrow's schedule, which is why `request_payout` returns an id
//! rather than a receipt.
//!
//! [`InMemoryEscrow`] is a complete implementation for tests and embedded
//! hosts. It books custody per asset and keeps a payout queue.

use std::collections::BTreeMap;

use hubpay_protocol::crypto::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by an escrow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error("insufficient custody for {asset}: requested {requested}, held {held}")]
    InsufficientCustody {
        asset: Address,
        requested: u64,
        held: u64,
    },

    #[error("payout {0} not found")]
    UnknownPayout(u64),

    #[error("payout {0} already confirmed")]
    AlreadyConfirmed(u64),

    #[error("custody overflow")]
    Overflow,
}

/// Acknowledgement of a deposit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAck {
    pub asset: Address,
    pub amount: u64,
    /// Custody of `asset` after the deposit.
    pub custody: u64,
}

/// The narrow surface the ledger needs from whatever holds the funds.
pub trait EscrowInterface {
    /// Queue a payout. Returns the payout id; confirmation comes later.
    fn request_payout(
        &mut self,
        asset: &Address,
        recipient: &Address,
        amount: u64,
    ) -> Result<u64, EscrowError>;

    /// Record funds that arrived in custody.
    fn notify_deposit(&mut self, asset: &Address, amount: u64) -> Result<DepositAck, EscrowError>;

    /// Funds held for `asset`, net of payouts already requested.
    fn custodied(&self, asset: &Address) -> u64;
}

// ---------------------------------------------------------------------------
// InMemoryEscrow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    Pending,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: u64,
    pub asset: Address,
    pub recipient: Address,
    pub amount: u64,
    pub status: PayoutStatus,
}

/// An escrow that lives in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEscrow {
    custody: BTreeMap<Address, u64>,
    payouts: Vec<Payout>,
}

impl InMemoryEscrow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a payout as executed on the anchor.
    pub fn confirm_payout(&mut self, id: u64) -> Result<(), EscrowError> {
        let payout = self
            .payouts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(EscrowError::UnknownPayout(id))?;
        if payout.status == PayoutStatus::Confirmed {
            return Err(EscrowError::AlreadyConfirmed(id));
        }
        payout.status = PayoutStatus::Confirmed;
        Ok(())
    }

    pub fn payouts(&self) -> &[Payout] {
        &self.payouts
    }

    pub fn pending_payouts(&self) -> impl Iterator<Item = &Payout> {
        self.payouts
            .iter()
            .filter(|p| p.status == PayoutStatus::Pending)
    }

    /// Sum of all payouts ever requested for `recipient` in `asset`.
    pub fn paid_to(&self, asset: &Address, recipient: &Address) -> u64 {
        self.payouts
            .iter()
            .filter(|p| p.asset == *asset && p.recipient == *recipient)
            .map(|p| p.amount)
            .sum()
    }
}

impl EscrowInterface for InMemoryEscrow {
    fn request_payout(
        &mut self,
        asset: &Address,
        recipient: &Address,
        amount: u64,
    ) -> Result<u64, EscrowError> {
        let held = self.custody.get(asset).copied().unwrap_or(0);
        let remaining = held
            .checked_sub(amount)
            .ok_or(EscrowError::InsufficientCustody {
                asset: *asset,
                requested: amount,
                held,
            })?;
        self.custody.insert(*asset, remaining);
        let id = self.payouts.len() as u64 + 1;
        self.payouts.push(Payout {
            id,
            asset: *asset,
            recipient: *recipient,
            amount,
            status: PayoutStatus::Pending,
        });
        Ok(id)
    }

    fn notify_deposit(&mut self, asset: &Address, amount: u64) -> Result<DepositAck, EscrowError> {
        let held = self.custody.entry(*asset).or_insert(0);
        *held = held.checked_add(amount).ok_or(EscrowError::Overflow)?;
        Ok(DepositAck {
            asset: *asset,
            amount,
            custody: *held,
        })
    }

    fn custodied(&self, asset: &Address) -> u64 {
        self.custody.get(asset).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> Address {
        Address::from_bytes([5u8; 32])
    }

    #[test]
    fn deposits_and_payouts_track_custody() {
        let mut escrow = InMemoryEscrow::new();
        let ack = escrow.notify_deposit(&asset(), 100).unwrap();
        assert_eq!(ack.custody, 100);

        let id = escrow
            .request_payout(&asset(), &Address::from_bytes([1u8; 32]), 40)
            .unwrap();
        assert_eq!(escrow.custodied(&asset()), 60);
        assert_eq!(escrow.pending_payouts().count(), 1);

        escrow.confirm_payout(id).unwrap();
        assert_eq!(escrow.pending_payouts().count(), 0);
        assert_eq!(escrow.confirm_payout(id), Err(EscrowError::AlreadyConfirmed(id)));
    }

    #[test]
    fn payout_beyond_custody_is_refused() {
        let mut escrow = InMemoryEscrow::new();
        escrow.notify_deposit(&asset(), 10).unwrap();
        assert!(matches!(
            escrow.request_payout(&asset(), &Address::ZERO, 11),
            Err(EscrowError::InsufficientCustody { .. })
        ));
        assert_eq!(escrow.custodied(&asset()), 10);
    }

    #[test]
    fn unknown_payout_cannot_be_confirmed() {
        let mut escrow = InMemoryEscrow::new();
        assert_eq!(escrow.confirm_payout(7), Err(EscrowError::UnknownPayout(7)));
    }
}
