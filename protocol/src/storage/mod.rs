//! # Storage Module
//!
//! Persistence for ledger snapshots. One sled tree per record kind,
//! bincode values, atomic per-tree replacement.
//!
//! JSON is for APIs and debugging; bincode is for storage.

pub mod db;

pub use db::{DbError, DbResult, LedgerDb, Table};
