//! Per-ledger merge rules used by the reconciliation engine.
//!
//! The engine is written once against [`LedgerStrategy`]. Each chain kind supplies how to
//! validate and key a transaction, how two partial views of the same transaction combine,
//! and how a remote copy compares with the local one.

use crate::ledger::types::{ChainId, LedgerKind, LedgerTransaction, SEQUENTIAL_INDEX, TransactionIdentity};

/// A transaction that cannot belong to the chain an engine serves.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction {identity} violates merge invariant: {reason}")]
pub struct InvariantViolation {
	pub identity: TransactionIdentity,
	pub reason: String,
}

/// Result of comparing a remote transaction with the local copy of the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
	/// Same hash and nothing new to record.
	Unchanged,
	/// Different hash: the local copy is stale.
	Changed,
	/// Same hash, but the remote copy carries transfer events the local copy lacks.
	Extended,
}

/// Merge rules for one ledger.
pub trait LedgerStrategy: Send + Sync {
	/// Chain every transaction handled by this strategy must belong to.
	fn chain(&self) -> &ChainId;

	/// Transaction model of the chain.
	fn kind(&self) -> LedgerKind;

	/// Validate `tx` against this ledger and return its identity.
	fn identity_of(&self, tx: &LedgerTransaction) -> Result<TransactionIdentity, InvariantViolation> {
		ensure_member(self.chain(), self.kind(), tx)
	}

	/// Carry the transfer events of `base` into `incoming`. Events already present in
	/// `incoming` win.
	fn merge_events(&self, base: &LedgerTransaction, incoming: &mut LedgerTransaction);

	/// Compare a freshly fetched transaction with the stored one.
	fn compare(&self, local: &LedgerTransaction, remote: &LedgerTransaction) -> Comparison;
}

/// Strategy for ledgers with one transfer per versioned transaction.
#[derive(Debug, Clone)]
pub struct SequentialStrategy {
	chain: ChainId,
}

impl SequentialStrategy {
	pub fn new(chain: ChainId) -> Self {
		Self { chain }
	}
}

impl LedgerStrategy for SequentialStrategy {
	fn chain(&self) -> &ChainId {
		&self.chain
	}

	fn kind(&self) -> LedgerKind {
		LedgerKind::Sequential
	}

	fn identity_of(&self, tx: &LedgerTransaction) -> Result<TransactionIdentity, InvariantViolation> {
		let identity = ensure_member(&self.chain, LedgerKind::Sequential, tx)?;
		if identity.index != SEQUENTIAL_INDEX {
			return Err(InvariantViolation {
				reason: format!("sequential transaction with index {}", identity.index),
				identity,
			});
		}
		Ok(identity)
	}

	fn merge_events(&self, _base: &LedgerTransaction, _incoming: &mut LedgerTransaction) {}

	fn compare(&self, local: &LedgerTransaction, remote: &LedgerTransaction) -> Comparison {
		if local.hash() == remote.hash() {
			Comparison::Unchanged
		} else {
			Comparison::Changed
		}
	}
}

/// Strategy for ledgers whose transactions carry log-indexed transfer events.
#[derive(Debug, Clone)]
pub struct BlockStrategy {
	chain: ChainId,
}

impl BlockStrategy {
	pub fn new(chain: ChainId) -> Self {
		Self { chain }
	}
}

impl LedgerStrategy for BlockStrategy {
	fn chain(&self) -> &ChainId {
		&self.chain
	}

	fn kind(&self) -> LedgerKind {
		LedgerKind::Block
	}

	fn merge_events(&self, base: &LedgerTransaction, incoming: &mut LedgerTransaction) {
		if let (LedgerTransaction::Block(base), LedgerTransaction::Block(incoming)) = (base, incoming) {
			for (log_index, event) in &base.transfer_events {
				incoming
					.transfer_events
					.entry(*log_index)
					.or_insert_with(|| event.clone());
			}
		}
	}

	fn compare(&self, local: &LedgerTransaction, remote: &LedgerTransaction) -> Comparison {
		if local.hash() != remote.hash() {
			return Comparison::Changed;
		}
		match (local, remote) {
			(LedgerTransaction::Block(local), LedgerTransaction::Block(remote))
				if remote
					.transfer_events
					.keys()
					.any(|k| !local.transfer_events.contains_key(k)) =>
			{
				Comparison::Extended
			}
			_ => Comparison::Unchanged,
		}
	}
}

/// Check that `tx` belongs to `chain` and is of the `kind` variant.
fn ensure_member(
	chain: &ChainId,
	kind: LedgerKind,
	tx: &LedgerTransaction,
) -> Result<TransactionIdentity, InvariantViolation> {
	let identity = tx.identity();
	if identity.chain != *chain {
		return Err(InvariantViolation {
			identity: identity.clone(),
			reason: format!("expected chain {}, found {}", chain, identity.chain),
		});
	}
	if tx.kind() != kind {
		return Err(InvariantViolation {
			identity: identity.clone(),
			reason: format!("expected {} transaction, found {}", kind.as_str(), tx.kind().as_str()),
		});
	}
	Ok(identity.clone())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sync::test_support::{block_tx, sequential_tx};

	#[test]
	fn test_block_merge_unions_events() {
		let strategy = BlockStrategy::new(ChainId::new("celo"));
		let base = block_tx("celo", 40, 1, "0xabc", &[0, 2]);
		let mut incoming = block_tx("celo", 40, 1, "0xabc", &[1, 3]);
		strategy.merge_events(&base, &mut incoming);

		let LedgerTransaction::Block(merged) = incoming else {
			panic!("expected block transaction");
		};
		assert_eq!(merged.transfer_events.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
	}

	#[test]
	fn test_block_merge_incoming_wins() {
		let strategy = BlockStrategy::new(ChainId::new("celo"));
		let mut base = block_tx("celo", 40, 1, "0xabc", &[0]);
		if let LedgerTransaction::Block(tx) = &mut base {
			tx.transfer_events.get_mut(&0).unwrap().currency = "stale".to_string();
		}
		let mut incoming = block_tx("celo", 40, 1, "0xabc", &[0]);
		strategy.merge_events(&base, &mut incoming);

		let LedgerTransaction::Block(merged) = incoming else {
			panic!("expected block transaction");
		};
		assert_eq!(merged.transfer_events[&0].currency, "cUSD");
	}

	#[test]
	fn test_compare() {
		let sequential = SequentialStrategy::new(ChainId::new("diem"));
		assert_eq!(
			sequential.compare(&sequential_tx("diem", 10, "H1"), &sequential_tx("diem", 10, "H1")),
			Comparison::Unchanged
		);
		assert_eq!(
			sequential.compare(&sequential_tx("diem", 10, "H1"), &sequential_tx("diem", 10, "H2")),
			Comparison::Changed
		);

		let block = BlockStrategy::new(ChainId::new("celo"));
		let local = block_tx("celo", 5, 0, "0x1", &[0, 1]);
		assert_eq!(block.compare(&local, &block_tx("celo", 5, 0, "0x1", &[1])), Comparison::Unchanged);
		assert_eq!(block.compare(&local, &block_tx("celo", 5, 0, "0x1", &[2])), Comparison::Extended);
		assert_eq!(block.compare(&local, &block_tx("celo", 5, 0, "0x2", &[0])), Comparison::Changed);
	}

	#[test]
	fn test_identity_rejects_foreign_transactions() {
		let sequential = SequentialStrategy::new(ChainId::new("diem"));
		assert!(sequential.identity_of(&sequential_tx("diem", 3, "H")).is_ok());

		let wrong_chain = sequential.identity_of(&sequential_tx("other", 3, "H")).unwrap_err();
		assert!(wrong_chain.reason.contains("expected chain diem"));

		let wrong_kind = sequential.identity_of(&block_tx("diem", 3, 0, "H", &[0])).unwrap_err();
		assert!(wrong_kind.reason.contains("expected sequential transaction"));

		let mut indexed = sequential_tx("diem", 3, "H");
		if let LedgerTransaction::Sequential(tx) = &mut indexed {
			tx.identity.index = 4;
		}
		let wrong_index = sequential.identity_of(&indexed).unwrap_err();
		assert!(wrong_index.reason.contains("index 4"));
	}
}
