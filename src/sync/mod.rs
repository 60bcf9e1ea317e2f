//! Ledger Reconciliation Module
//!
//! This module keeps the local transaction store consistent with the authoritative remote ledgers.
//! It is composed of several submodules, each responsible for a specific aspect of a reconciliation pass:
//!
//! - `orchestrator`: The `ReconciliationEngine`, which runs a pass and publishes its results.
//! - `query`: Chain query adapters that turn remote client primitives into ledger transactions.
//! - `repositories`: The local store and account address resolution, backed by SQLite.
//! - `pass_tracker`: Tracks the lifecycle and statistics of a pass.
//! - `types`: Error types and the streams handed to callers.
//!
//! The engine loads the local view, fans out one remote query per address, merges the results
//! through the chain's `LedgerStrategy`, and persists the new and corrected transactions.

/// Main coordinator for reconciliation passes
pub mod orchestrator;
/// Lifecycle and statistics of a pass
pub mod pass_tracker;
/// Remote query adapters per ledger kind
pub mod query;
/// Local store and address resolution
pub mod repositories;
/// Errors and result streams
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use orchestrator::*;
pub use pass_tracker::{PassOutcome, PassProgress, PassState, PassStats};
pub use query::{BlockQuery, ChainQuery, SequentialQuery};
pub use repositories::{AddressResolver, LedgerStore, SqliteLedgerStore};
pub use types::*;
