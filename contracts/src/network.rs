//! # Payment Networks
//!
//! One [`PaymentNetwork`] per asset: the provider's pooled liquidity plus
//! the aggregate totals the auditor reconciles against the escrow.
//!
//! ## The pool identity
//!
//! Every movement of the pooled `provider_balance` goes through one of the
//! methods below, and each of them bumps a matching running total. That is
//! what makes [`PaymentNetwork::audit`] possible:
//!
//! ```text
//! provider_balance = provider_deposit + total_regained
//!                  - provider_withdraw - total_rebalanced_in - accrued_fee
//! ```

use hubpay_protocol::config::{FEE_RATE_DENOMINATOR, MAX_FEE_RATE};
use hubpay_protocol::crypto::Address;
use serde::{Deserialize, Serialize};

use crate::error::{add, sub, LedgerError, LedgerResult};

/// Pooled provider liquidity and totals for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNetwork {
    pub asset: Address,
    /// Cumulative provider deposits.
    pub provider_deposit: u64,
    /// Cumulative confirmed provider withdrawals.
    pub provider_withdraw: u64,
    /// Pooled liquidity not committed to any channel.
    pub provider_balance: u64,
    pub user_total_deposit: u64,
    pub user_total_withdraw: u64,
    /// Provider-side amounts returned to the pool by cooperative settlement.
    pub provider_total_settled: u64,
    /// Fee rate in parts of `FEE_RATE_DENOMINATOR`.
    pub fee_rate: u64,
    /// Fees realized by fee proofs.
    pub accrued_fee: u64,
    /// Fees charged on transfers, realized or not.
    pub implied_fee: u64,
    /// Nonce of the last accepted fee proof.
    pub fee_nonce: u64,
    /// Pool liquidity moved into channels by rebalancing.
    pub total_rebalanced_in: u64,
    /// Channel liquidity returned to the pool by any settlement.
    pub total_regained: u64,
}

impl PaymentNetwork {
    pub fn new(asset: Address) -> Self {
        Self {
            asset,
            ..Default::default()
        }
    }

    pub fn credit_provider_deposit(&mut self, amount: u64) -> LedgerResult<()> {
        let deposit = add(self.provider_deposit, amount)?;
        let balance = add(self.provider_balance, amount)?;
        self.provider_deposit = deposit;
        self.provider_balance = balance;
        Ok(())
    }

    pub fn debit_provider_withdraw(&mut self, amount: u64) -> LedgerResult<()> {
        let balance = sub(self.provider_balance, amount)?;
        let withdraw = add(self.provider_withdraw, amount)?;
        self.provider_balance = balance;
        self.provider_withdraw = withdraw;
        Ok(())
    }

    /// Move `amount` out of the pool into a channel.
    pub fn debit_rebalance(&mut self, amount: u64) -> LedgerResult<()> {
        let balance = sub(self.provider_balance, amount)?;
        let total = add(self.total_rebalanced_in, amount)?;
        self.provider_balance = balance;
        self.total_rebalanced_in = total;
        Ok(())
    }

    /// Return channel liquidity to the pool.
    pub fn credit_regain(&mut self, amount: u64) -> LedgerResult<()> {
        let balance = add(self.provider_balance, amount)?;
        let total = add(self.total_regained, amount)?;
        self.provider_balance = balance;
        self.total_regained = total;
        Ok(())
    }

    pub fn record_user_deposit(&mut self, amount: u64) -> LedgerResult<()> {
        self.user_total_deposit = add(self.user_total_deposit, amount)?;
        Ok(())
    }

    pub fn record_user_withdraw(&mut self, amount: u64) -> LedgerResult<()> {
        self.user_total_withdraw = add(self.user_total_withdraw, amount)?;
        Ok(())
    }

    pub fn record_cooperative_settle(&mut self, provider_share: u64) -> LedgerResult<()> {
        self.provider_total_settled = add(self.provider_total_settled, provider_share)?;
        Ok(())
    }

    // -- Fees ---------------------------------------------------------------

    pub fn set_fee_rate(&mut self, rate: u64) -> LedgerResult<()> {
        if rate > MAX_FEE_RATE {
            return Err(LedgerError::InvalidArgument("fee rate above maximum"));
        }
        self.fee_rate = rate;
        Ok(())
    }

    /// Fee owed on a transfer of `amount` at the current rate.
    pub fn fee_for(&self, amount: u64) -> LedgerResult<u64> {
        let fee = (amount as u128) * (self.fee_rate as u128) / (FEE_RATE_DENOMINATOR as u128);
        u64::try_from(fee).map_err(|_| LedgerError::AmountOverflow)
    }

    /// Record the fee for a transfer of `amount`; returns the fee.
    pub fn charge_fee(&mut self, amount: u64) -> LedgerResult<u64> {
        let fee = self.fee_for(amount)?;
        self.implied_fee = add(self.implied_fee, fee)?;
        Ok(fee)
    }

    /// Check a fee proof and return the amount it would realize.
    pub fn fee_delta(&self, cumulative: u64, nonce: u64) -> LedgerResult<u64> {
        if nonce <= self.fee_nonce {
            return Err(LedgerError::StaleNonce {
                got: nonce,
                last: self.fee_nonce,
            });
        }
        if cumulative > self.implied_fee {
            return Err(LedgerError::InvalidArgument("fee exceeds fees charged"));
        }
        let delta = cumulative
            .checked_sub(self.accrued_fee)
            .ok_or(LedgerError::InvalidArgument("cumulative fee went backwards"))?;
        if delta > self.provider_balance {
            return Err(LedgerError::InsufficientBalance {
                needed: delta,
                available: self.provider_balance,
            });
        }
        Ok(delta)
    }

    /// Realize fees up to `cumulative`. Returns the newly realized delta.
    pub fn realize_fee(&mut self, cumulative: u64, nonce: u64) -> LedgerResult<u64> {
        let delta = self.fee_delta(cumulative, nonce)?;
        self.provider_balance -= delta;
        self.accrued_fee = cumulative;
        self.fee_nonce = nonce;
        Ok(delta)
    }

    // -- Audit --------------------------------------------------------------

    /// What `provider_balance` should be according to the running totals.
    pub fn expected_provider_balance(&self) -> Option<u64> {
        self.provider_deposit
            .checked_add(self.total_regained)?
            .checked_sub(self.provider_withdraw)?
            .checked_sub(self.total_rebalanced_in)?
            .checked_sub(self.accrued_fee)
    }

    /// Check the pool identity.
    pub fn audit(&self) -> LedgerResult<()> {
        match self.expected_provider_balance() {
            Some(expected) if expected == self.provider_balance => Ok(()),
            expected => Err(LedgerError::ReconciliationMismatch {
                asset: self.asset,
                ledger: self.provider_balance,
                escrow: expected.unwrap_or(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(amount: u64) -> PaymentNetwork {
        let mut net = PaymentNetwork::new(Address::from_bytes([3u8; 32]));
        net.credit_provider_deposit(amount).unwrap();
        net
    }

    #[test]
    fn pool_identity_holds_across_flows() {
        let mut net = funded(10_000);
        net.debit_rebalance(1_000).unwrap();
        net.debit_provider_withdraw(200).unwrap();
        net.set_fee_rate(100).unwrap();
        net.charge_fee(500).unwrap();
        net.realize_fee(5, 1).unwrap();
        assert_eq!(net.provider_balance, 8_795);
        net.credit_regain(1_400).unwrap();
        assert_eq!(net.provider_balance, 10_195);
        net.audit().unwrap();
    }

    #[test]
    fn default_network_is_empty() {
        let net = PaymentNetwork::default();
        assert_eq!(net.asset, Address::ZERO);
        assert_eq!(net, PaymentNetwork::new(Address::ZERO));
        net.audit().unwrap();
    }

    #[test]
    fn withdraw_beyond_pool_rejected_without_mutation() {
        let mut net = funded(10);
        let before = net.clone();
        assert!(matches!(
            net.debit_provider_withdraw(11),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(net, before);
    }

    #[test]
    fn fee_rounds_down() {
        let mut net = funded(0);
        net.set_fee_rate(100).unwrap();
        assert_eq!(net.fee_for(99).unwrap(), 0);
        assert_eq!(net.fee_for(500).unwrap(), 5);
    }

    #[test]
    fn fee_rate_is_bounded() {
        let mut net = funded(0);
        assert!(net.set_fee_rate(MAX_FEE_RATE + 1).is_err());
    }

    #[test]
    fn fee_proof_nonce_must_increase() {
        let mut net = funded(100);
        net.set_fee_rate(1_000).unwrap();
        net.charge_fee(100).unwrap();
        net.realize_fee(10, 1).unwrap();
        assert_eq!(
            net.realize_fee(10, 1),
            Err(LedgerError::StaleNonce { got: 1, last: 1 })
        );
        assert_eq!(net.accrued_fee, 10);
    }

    #[test]
    fn fee_cannot_exceed_what_was_charged() {
        let mut net = funded(100);
        assert!(matches!(
            net.realize_fee(1, 1),
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn audit_detects_tampering() {
        let mut net = funded(100);
        net.provider_balance = 99;
        assert!(matches!(
            net.audit(),
            Err(LedgerError::ReconciliationMismatch { .. })
        ));
    }
}
