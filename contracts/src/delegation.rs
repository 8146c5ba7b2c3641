//! # Delegation Registry
//!
//! Users may let other keys ("delegates", sometimes called puppets) sign
//! transfers for them, e.g. a hot key on a phone while the main key stays
//! in cold storage. The list per user is short and bounded, so checking
//! "may this key sign for that user" is a small linear scan.
//!
//! Delegates are never deleted, only disabled. A disabled delegate still
//! occupies a slot, which keeps its history auditable.

use std::collections::BTreeMap;

use hubpay_protocol::crypto::Address;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// One registered delegate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegate {
    pub address: Address,
    pub enabled: bool,
}

/// Per-user delegate lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationRegistry {
    capacity: usize,
    entries: BTreeMap<Address, Vec<Delegate>>,
}

impl DelegationRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: BTreeMap::new(),
        }
    }

    /// Register `delegate` for `user`, or re-enable it if it was disabled.
    pub fn add_delegate(&mut self, user: &Address, delegate: Address) -> LedgerResult<()> {
        if delegate == *user {
            return Err(LedgerError::InvalidArgument("a user cannot delegate to itself"));
        }
        let list = self.entries.entry(*user).or_default();
        if let Some(existing) = list.iter_mut().find(|d| d.address == delegate) {
            existing.enabled = true;
            return Ok(());
        }
        if list.len() >= self.capacity {
            return Err(LedgerError::DelegateLimitReached(*user));
        }
        list.push(Delegate {
            address: delegate,
            enabled: true,
        });
        Ok(())
    }

    pub fn disable_delegate(&mut self, user: &Address, delegate: &Address) -> LedgerResult<()> {
        self.set_enabled(user, delegate, false)
    }

    pub fn enable_delegate(&mut self, user: &Address, delegate: &Address) -> LedgerResult<()> {
        self.set_enabled(user, delegate, true)
    }

    fn set_enabled(&mut self, user: &Address, delegate: &Address, enabled: bool) -> LedgerResult<()> {
        let entry = self
            .entries
            .get_mut(user)
            .and_then(|list| list.iter_mut().find(|d| d.address == *delegate))
            .ok_or(LedgerError::DelegateNotFound {
                user: *user,
                delegate: *delegate,
            })?;
        entry.enabled = enabled;
        Ok(())
    }

    /// `true` if `signer` is `user` or one of its enabled delegates.
    pub fn is_authorized_signer(&self, user: &Address, signer: &Address) -> bool {
        signer == user || self.is_delegate(user, signer)
    }

    /// `true` if `signer` is an enabled delegate of `user`.
    pub fn is_delegate(&self, user: &Address, signer: &Address) -> bool {
        self.delegates_of(user)
            .iter()
            .any(|d| d.enabled && d.address == *signer)
    }

    /// `true` if `signer` was registered for `user` but is disabled.
    pub fn is_disabled_delegate(&self, user: &Address, signer: &Address) -> bool {
        self.delegates_of(user)
            .iter()
            .any(|d| !d.enabled && d.address == *signer)
    }

    pub fn delegates_of(&self, user: &Address) -> &[Delegate] {
        self.entries.get(user).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every key that may sign for `user`: the user first, then enabled
    /// delegates in registration order.
    pub fn signers_for(&self, user: &Address) -> Vec<Address> {
        std::iter::once(*user)
            .chain(
                self.delegates_of(user)
                    .iter()
                    .filter(|d| d.enabled)
                    .map(|d| d.address),
            )
            .collect()
    }

    /// Disabled delegates of `user`. Used to tell a revoked key apart from
    /// a plain forgery.
    pub fn disabled_for(&self, user: &Address) -> Vec<Address> {
        self.delegates_of(user)
            .iter()
            .filter(|d| !d.enabled)
            .map(|d| d.address)
            .collect()
    }

    // -- Persistence --------------------------------------------------------

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Address, &Vec<Delegate>)> {
        self.entries.iter()
    }

    pub(crate) fn insert_entry(&mut self, user: Address, list: Vec<Delegate>) {
        self.entries.insert(user, list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    #[test]
    fn user_always_signs_for_itself() {
        let reg = DelegationRegistry::new(2);
        assert!(reg.is_authorized_signer(&addr(1), &addr(1)));
        assert!(!reg.is_authorized_signer(&addr(1), &addr(2)));
    }

    #[test]
    fn add_disable_enable_cycle() {
        let mut reg = DelegationRegistry::new(2);
        reg.add_delegate(&addr(1), addr(2)).unwrap();
        assert!(reg.is_authorized_signer(&addr(1), &addr(2)));

        reg.disable_delegate(&addr(1), &addr(2)).unwrap();
        assert!(!reg.is_authorized_signer(&addr(1), &addr(2)));
        assert!(reg.is_disabled_delegate(&addr(1), &addr(2)));

        reg.enable_delegate(&addr(1), &addr(2)).unwrap();
        assert!(reg.is_delegate(&addr(1), &addr(2)));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = DelegationRegistry::new(2);
        reg.add_delegate(&addr(1), addr(2)).unwrap();
        reg.add_delegate(&addr(1), addr(3)).unwrap();
        assert_eq!(
            reg.add_delegate(&addr(1), addr(4)),
            Err(LedgerError::DelegateLimitReached(addr(1)))
        );
        // Re-adding an existing delegate does not consume a slot.
        reg.disable_delegate(&addr(1), &addr(3)).unwrap();
        reg.add_delegate(&addr(1), addr(3)).unwrap();
        assert_eq!(reg.delegates_of(&addr(1)).len(), 2);
    }

    #[test]
    fn unknown_delegate_cannot_be_disabled() {
        let mut reg = DelegationRegistry::new(2);
        assert!(matches!(
            reg.disable_delegate(&addr(1), &addr(9)),
            Err(LedgerError::DelegateNotFound { .. })
        ));
    }

    #[test]
    fn signers_lists_user_then_enabled_delegates() {
        let mut reg = DelegationRegistry::new(3);
        reg.add_delegate(&addr(1), addr(2)).unwrap();
        reg.add_delegate(&addr(1), addr(3)).unwrap();
        reg.disable_delegate(&addr(1), &addr(2)).unwrap();
        assert_eq!(reg.signers_for(&addr(1)), vec![addr(1), addr(3)]);
        assert_eq!(reg.disabled_for(&addr(1)), vec![addr(2)]);
    }

    #[test]
    fn self_delegation_rejected() {
        let mut reg = DelegationRegistry::new(2);
        assert!(reg.add_delegate(&addr(1), addr(1)).is_err());
    }
}
