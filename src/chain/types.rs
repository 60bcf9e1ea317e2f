//! Types returned by the remote ledger clients

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Event stream keys of an account on a sequential ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCursors {
    pub address: String,
    /// Key of the stream recording payments sent by the account.
    pub sent_events_key: String,
    /// Key of the stream recording payments received by the account.
    pub received_events_key: String,
}

/// One entry of an account event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub key: String,
    pub sequence_number: u64,
    /// Ledger version of the transaction that emitted the event.
    pub transaction_version: u64,
}

/// VM outcome of a sequential-ledger transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatus {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Payment script of a user transaction. Non-payment scripts leave the fields empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptView {
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub currency: String,
}

/// Signed part of a sequential-ledger transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTransactionView {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub max_gas_amount: u64,
    #[serde(default)]
    pub gas_unit_price: u64,
    #[serde(default)]
    pub gas_currency: String,
    #[serde(default)]
    pub timestamp_usecs: u64,
    #[serde(default)]
    pub script: ScriptView,
}

/// Full detail of one sequential-ledger transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialTransactionView {
    pub version: u64,
    pub hash: String,
    pub gas_used: u64,
    pub vm_status: VmStatus,
    pub transaction: UserTransactionView,
}

/// One row of a block ledger's token transfer index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransferRow {
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub hash: String,
    pub transaction_index: i64,
    pub log_index: i64,
    pub from: String,
    pub to: String,
    /// Token contract; used as the transfer currency.
    pub contract_address: String,
    pub value: BigUint,
    pub gas: u64,
    pub gas_price: BigUint,
    pub gas_used: u64,
}

/// Transaction-level metadata of a block-ledger transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionInfo {
    pub status: String,
    pub gateway_fee: Option<BigUint>,
    pub gateway_fee_recipient: String,
    pub fee_currency: String,
}

/// Error types for remote ledger queries
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("stale response: ledger version {seen} is behind {latest}")]
    StaleResponse { seen: u64, latest: u64 },

    #[error("remote kept returning stale responses after {attempts} attempts")]
    StaleRetriesExhausted { attempts: u32 },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("No data returned")]
    NoData,

    #[error("parse error: {0}")]
    Parse(String),
}

impl ChainError {
    pub fn is_stale(&self) -> bool {
        matches!(self, ChainError::StaleResponse { .. })
    }
}
