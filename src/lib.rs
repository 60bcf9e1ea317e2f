//! Wallet ledger reconciliation.
//!
//! Keeps a local SQLite store of wallet transactions consistent with the remote ledgers that
//! are authoritative for them. Two ledger kinds are supported: sequential ledgers, where each
//! transaction carries one transfer under a monotonically increasing version, and block
//! ledgers, where transactions are addressed by block and index and carry log-indexed token
//! transfer events.
//!
//! A [`ReconciliationEngine`](sync::ReconciliationEngine) runs one pass per fetch: it publishes
//! the local view, queries every address concurrently, merges the results, publishes the merged
//! view and persists what changed.

pub mod chain;
pub mod config;
pub mod ledger;
pub mod sync;
pub mod utils;
