// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # HubPay Protocol Primitives
//!
//! The building blocks the channel ledger stands on. Nothing in here knows
//! what a channel is; it only knows how to name parties, hash messages,
//! check signatures, and put records on disk.
//!
//! - **crypto**: Ed25519 keys and signatures, Keccak-256 digests, and the
//!   typed-message (domain-separated) digest used for transfers.
//! - **config**: Protocol constants and the ledger's deployment parameters.
//! - **storage**: sled-backed record store for ledger snapshots.
//! - **logging**: `tracing` subscriber bootstrap for hosts and tests.
//!
//! ## Design Philosophy
//!
//! 1. Digests are bound to a ledger instance and a message kind. A signature
//!    for one thing never verifies as a signature for another.
//! 2. Verification fails closed and returns `false`, never panics.
//! 3. If it touches money, it has tests.

pub mod config;
pub mod crypto;
pub mod logging;
pub mod storage;
