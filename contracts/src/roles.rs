//! # Roles
//!
//! Who is allowed to do what. Every mutating entry point asks the same
//! question ("does this address, or this signature, act as role R here?")
//! through [`RoleBook`], instead of comparing addresses inline.
//!
//! | Role        | Holder                               | Typical powers                         |
//! |-------------|--------------------------------------|----------------------------------------|
//! | `Provider`  | fixed, from config                   | pays users, proposes rebalances        |
//! | `Auditor`   | fixed, from config                   | relays deposits, co-signs everything   |
//! | `Consignor` | fixed, from config                   | ratifies delegate-signed proofs        |
//! | `User`      | the channel's user                   | pays the provider, proposes settlement |
//! | `Delegate`  | an enabled delegate of that user     | signs transfers for the user           |

use hubpay_protocol::config::LedgerConfig;
use hubpay_protocol::crypto::{Address, Hash32, Signature};
use serde::{Deserialize, Serialize};

use crate::delegation::DelegationRegistry;
use crate::error::{LedgerError, LedgerResult};

/// A party's role in one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Provider,
    Auditor,
    Consignor,
    User,
    Delegate,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Provider => write!(f, "provider"),
            Role::Auditor => write!(f, "auditor"),
            Role::Consignor => write!(f, "consignor"),
            Role::User => write!(f, "user"),
            Role::Delegate => write!(f, "delegate"),
        }
    }
}

/// Role-tagged authorization for a single ledger instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBook {
    provider: Address,
    auditor: Address,
    consignor: Address,
}

impl RoleBook {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            provider: config.provider,
            auditor: config.auditor,
            consignor: config.consignor,
        }
    }

    pub fn provider(&self) -> Address {
        self.provider
    }

    pub fn auditor(&self) -> Address {
        self.auditor
    }

    pub fn consignor(&self) -> Address {
        self.consignor
    }

    /// The fixed holder of `role`, if it has one. `User` and `Delegate` are
    /// per channel and have none.
    pub fn holder(&self, role: Role) -> Option<Address> {
        match role {
            Role::Provider => Some(self.provider),
            Role::Auditor => Some(self.auditor),
            Role::Consignor => Some(self.consignor),
            Role::User | Role::Delegate => None,
        }
    }

    /// The role `caller` holds with respect to a channel whose user is `user`.
    ///
    /// Fixed roles win over per-channel ones, so a provider that is also
    /// registered as somebody's delegate is still the provider.
    pub fn role_of(
        &self,
        caller: &Address,
        user: Option<&Address>,
        delegates: &DelegationRegistry,
    ) -> Option<Role> {
        if *caller == self.provider {
            return Some(Role::Provider);
        }
        if *caller == self.auditor {
            return Some(Role::Auditor);
        }
        if let Some(user) = user {
            if caller == user {
                return Some(Role::User);
            }
            if delegates.is_delegate(user, caller) {
                return Some(Role::Delegate);
            }
        }
        if *caller == self.consignor {
            return Some(Role::Consignor);
        }
        None
    }

    /// Require that `caller` holds one of `allowed`.
    pub fn authorize(
        &self,
        caller: &Address,
        allowed: &[Role],
        user: Option<&Address>,
        delegates: &DelegationRegistry,
    ) -> LedgerResult<Role> {
        match self.role_of(caller, user, delegates) {
            Some(role) if allowed.contains(&role) => Ok(role),
            _ => Err(LedgerError::UnauthorizedSigner {
                signer: *caller,
                reason: "caller lacks the required role",
            }),
        }
    }

    /// Require that `signature` over `digest` comes from the fixed holder
    /// of `role`.
    pub fn authorize_signature(
        &self,
        role: Role,
        digest: &Hash32,
        signature: &Signature,
    ) -> LedgerResult<()> {
        let holder = self.holder(role).ok_or(LedgerError::InvalidArgument(
            "role has no fixed holder",
        ))?;
        if holder.verify(digest, signature) {
            Ok(())
        } else {
            Err(LedgerError::InvalidSignature)
        }
    }
}
