//! Persistence Layer for ledger recovery
//!
//! Snapshot plus append-only logs, reloaded on restart.

pub mod store;

pub use store::{JsonFileStore, LedgerSnapshot, LedgerStore};
