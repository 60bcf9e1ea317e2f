//! Types for the ledger transaction model shared by both chain kinds

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one configured ledger, e.g. `diem` or `celo`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction model of a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    /// One monotonically increasing version per transaction, one transfer each.
    Sequential,
    /// Transactions addressed by (block, index), carrying log-indexed transfer events.
    Block,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Sequential => "sequential",
            LedgerKind::Block => "block",
        }
    }
}

/// Primary key of a transaction across the whole store.
///
/// `version` is the ledger version for sequential ledgers and the block number for
/// block ledgers. `index` is always 0 for sequential ledgers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionIdentity {
    pub chain: ChainId,
    pub version: u64,
    pub index: i64,
}

impl TransactionIdentity {
    pub fn new(chain: ChainId, version: u64, index: i64) -> Self {
        Self {
            chain,
            version,
            index,
        }
    }

    /// Identity of a sequential-ledger transaction.
    pub fn sequential(chain: ChainId, version: u64) -> Self {
        Self::new(chain, version, SEQUENTIAL_INDEX)
    }
}

impl fmt::Display for TransactionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.chain, self.version, self.index)
    }
}

/// Index assigned to every sequential-ledger transaction.
pub const SEQUENTIAL_INDEX: i64 = 0;

/// Gas accounting of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gas {
    pub price: BigUint,
    pub used: u64,
    pub max: u64,
}

/// The single value movement carried by a sequential-ledger transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub currency: String,
    pub from: String,
    pub to: String,
    pub amount: BigUint,
}

/// One token transfer log of a block-ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub log_index: i64,
    pub currency: String,
    pub from: String,
    pub to: String,
    pub amount: BigUint,
}

/// Message a sender attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRemark {
    pub message: String,
    pub is_refund: bool,
}

/// Note an account attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRemark {
    pub account_id: i64,
    pub message: String,
}

/// Collaborator-supplied attributes. Remote fetches never fill these in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    pub sender: Option<SenderRemark>,
    pub account: Option<AccountRemark>,
}

/// Transaction on a sequential ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequentialTransaction {
    pub identity: TransactionIdentity,
    pub gas: Gas,
    pub gas_currency: String,
    pub status: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub public_key: String,
    pub transfer: Transfer,
    #[serde(default)]
    pub annotations: Annotations,
}

/// Transaction on a block ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub identity: TransactionIdentity,
    pub gas: Gas,
    pub status: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub gateway_fee: Option<BigUint>,
    pub gateway_recipient: String,
    pub gateway_currency: String,
    pub transfer_events: BTreeMap<i64, TransferEvent>,
    #[serde(default)]
    pub annotations: Annotations,
}

impl BlockTransaction {
    /// Insert an event keyed by its log index. Negative indexes reported by some
    /// explorers are stored under 0.
    pub fn insert_event(&mut self, mut event: TransferEvent) {
        if event.log_index < 0 {
            event.log_index = 0;
        }
        self.transfer_events.insert(event.log_index, event);
    }

    /// Re-key events that were placed under a negative log index directly.
    pub fn normalize_log_indexes(&mut self) {
        if self.transfer_events.keys().next().is_some_and(|k| *k < 0) {
            let events = std::mem::take(&mut self.transfer_events);
            for event in events.into_values() {
                self.insert_event(event);
            }
        }
    }
}

/// A ledger transaction, tagged by chain kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LedgerTransaction {
    Sequential(SequentialTransaction),
    Block(BlockTransaction),
}

impl LedgerTransaction {
    pub fn identity(&self) -> &TransactionIdentity {
        match self {
            LedgerTransaction::Sequential(tx) => &tx.identity,
            LedgerTransaction::Block(tx) => &tx.identity,
        }
    }

    pub fn kind(&self) -> LedgerKind {
        match self {
            LedgerTransaction::Sequential(_) => LedgerKind::Sequential,
            LedgerTransaction::Block(_) => LedgerKind::Block,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            LedgerTransaction::Sequential(tx) => &tx.hash,
            LedgerTransaction::Block(tx) => &tx.hash,
        }
    }

    pub fn annotations(&self) -> &Annotations {
        match self {
            LedgerTransaction::Sequential(tx) => &tx.annotations,
            LedgerTransaction::Block(tx) => &tx.annotations,
        }
    }

    pub fn annotations_mut(&mut self) -> &mut Annotations {
        match self {
            LedgerTransaction::Sequential(tx) => &mut tx.annotations,
            LedgerTransaction::Block(tx) => &mut tx.annotations,
        }
    }
}

impl From<SequentialTransaction> for LedgerTransaction {
    fn from(tx: SequentialTransaction) -> Self {
        LedgerTransaction::Sequential(tx)
    }
}

impl From<BlockTransaction> for LedgerTransaction {
    fn from(tx: BlockTransaction) -> Self {
        LedgerTransaction::Block(tx)
    }
}

/// Transactions keyed by identity, iterated in (chain, version, index) order.
pub type TransactionMap = BTreeMap<TransactionIdentity, LedgerTransaction>;
