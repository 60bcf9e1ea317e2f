//! Ledger transaction model.
//!
//! This module defines the transaction shapes of the two supported ledger kinds, the identity
//! that keys them across the store, and the per-ledger merge strategies the reconciliation
//! engine is parameterised over.

/// Merge rules per ledger kind
pub mod strategy;
/// Transaction, identity and annotation types
pub mod types;

pub use strategy::{BlockStrategy, Comparison, InvariantViolation, LedgerStrategy, SequentialStrategy};
pub use types::*;
