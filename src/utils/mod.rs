//!
//! Utility module for the ledger sync binary.
//!
//! Re-exports formatting helpers used when logging reconciled transactions.
/// Utility functions for formatting and display
pub mod format;

pub use format::{format_token_amount, token_decimals};
