// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # HubPay Channel Ledger
//!
//! An off-chain payment-channel ledger run by a hub (the *provider*) under
//! a neutral co-signer (the *auditor*), with real custody held by an
//! external escrow.
//!
//! - **Transfers**: signed, nonce-ordered balance proofs move value inside
//!   a channel. Users may sign through delegates; a consignor can ratify
//!   delegate-signed proofs after the fact.
//! - **Proposals**: withdrawals, cooperative settlement and rebalancing
//!   need co-signatures and expire at a block height.
//! - **Disputes**: either side can force-close a channel and settle it
//!   after a challenge window, without the other side's help.
//! - **Escrow**: the only way ledger decisions reach actual funds.
//!
//! ## Design Principles
//!
//! 1. All monetary operations check for overflow. Wrapping arithmetic and
//!    money do not mix.
//! 2. Validate everything, then mutate. A rejected call changes nothing.
//! 3. State transitions are explicit: enum variants, not boolean flags.
//! 4. Signature verification gates every privileged operation, through one
//!    role check ([`roles::RoleBook`]).
//! 5. Every persisted type is serializable (serde) for storage.

pub mod channel;
pub mod delegation;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod ledger;
pub mod network;
pub mod proposal;
pub mod roles;
pub mod transfer;

pub use channel::{channel_id, AssetMover, BalanceProof, Channel, ChannelStatus, Direction};
pub use dispute::{CloseRequest, Settlement};
pub use error::{LedgerError, LedgerResult};
pub use escrow::{EscrowInterface, InMemoryEscrow};
pub use ledger::{Ledger, SharedLedger};
pub use network::PaymentNetwork;
pub use roles::Role;
pub use transfer::{ArrearsStatus, TransferOutcome};
