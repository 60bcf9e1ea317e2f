//! Remote ledger integration module
//!
//! This module provides the clients and types for querying the authoritative remote ledgers.
//! Each ledger kind has a client trait (the query primitives the adapters rely on) and an HTTP
//! implementation of it. Stale responses from lagging nodes are retried with a bounded backoff.

/// Address validation per ledger kind
pub mod address;
/// Explorer client for block ledgers
pub mod block;
/// Bounded retry of stale responses
pub mod retry;
/// JSON-RPC client for sequential ledgers
pub mod sequential;
/// Type definitions for remote ledger data
pub mod types;

pub use address::LedgerAddress;
pub use block::{BlockLedgerClient, ExplorerBlockClient};
pub use retry::retry_stale;
pub use sequential::{JsonRpcSequentialClient, SequentialLedgerClient};
pub use types::*;
