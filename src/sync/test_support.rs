//! Builders and stub collaborators shared by the unit tests.

use crate::chain::ChainError;
use crate::ledger::*;
use crate::sync::repositories::{LedgerStore, SqliteLedgerStore};
use crate::sync::types::StoreError;
use crate::sync::query::ChainQuery;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const SEQUENTIAL_SENDER: &str = "f72589b71ff4f8d139674a3f7369c69b";
pub const SEQUENTIAL_RECEIVER: &str = "000000000000000000000000000000dd";
pub const BLOCK_SENDER: &str = "0x1111111111111111111111111111111111111111";
pub const BLOCK_RECEIVER: &str = "0x2222222222222222222222222222222222222222";

fn timestamp() -> DateTime<Utc> {
	DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap()
}

pub fn sequential_tx(chain: &str, version: u64, hash: &str) -> LedgerTransaction {
	LedgerTransaction::Sequential(SequentialTransaction {
		identity: TransactionIdentity::sequential(ChainId::new(chain), version),
		gas: Gas {
			price: BigUint::from(1u32),
			used: 100,
			max: 1000,
		},
		gas_currency: "XUS".to_string(),
		status: "executed".to_string(),
		hash: hash.to_string(),
		timestamp: timestamp(),
		public_key: "ab01".to_string(),
		transfer: Transfer {
			currency: "XUS".to_string(),
			from: SEQUENTIAL_SENDER.to_string(),
			to: SEQUENTIAL_RECEIVER.to_string(),
			amount: BigUint::from(5_000_000u64),
		},
		annotations: Annotations::default(),
	})
}

pub fn block_tx(chain: &str, version: u64, index: i64, hash: &str, log_indexes: &[i64]) -> LedgerTransaction {
	let mut tx = BlockTransaction {
		identity: TransactionIdentity::new(ChainId::new(chain), version, index),
		gas: Gas {
			price: BigUint::from(500_000_000u32),
			used: 51_000,
			max: 210_000,
		},
		status: "success".to_string(),
		hash: hash.to_string(),
		timestamp: timestamp(),
		gateway_fee: None,
		gateway_recipient: String::new(),
		gateway_currency: "cUSD".to_string(),
		transfer_events: BTreeMap::new(),
		annotations: Annotations::default(),
	};
	for log_index in log_indexes {
		tx.insert_event(TransferEvent {
			log_index: *log_index,
			currency: "cUSD".to_string(),
			from: BLOCK_SENDER.to_string(),
			to: BLOCK_RECEIVER.to_string(),
			amount: BigUint::from(1_000u64 + log_index.unsigned_abs()),
		});
	}
	LedgerTransaction::Block(tx)
}

pub fn map_of(transactions: Vec<LedgerTransaction>) -> TransactionMap {
	transactions
		.into_iter()
		.map(|tx| (tx.identity().clone(), tx))
		.collect()
}

/// Canned answer of [`StubQuery`] for one address.
#[derive(Clone)]
pub enum StubResponse {
	Found(TransactionMap),
	Delayed(Duration, TransactionMap),
	Fail(String),
	FailAfter(Duration, String),
	/// Never completes; the flag is set when the query future is dropped.
	Hang(Arc<AtomicBool>),
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
	fn drop(&mut self) {
		self.0.store(true, Ordering::SeqCst);
	}
}

/// Chain query answering from a fixed table.
#[derive(Default)]
pub struct StubQuery {
	responses: HashMap<String, StubResponse>,
	pub calls: AtomicUsize,
}

impl StubQuery {
	pub fn with(mut self, address: &str, response: StubResponse) -> Self {
		self.responses.insert(address.to_string(), response);
		self
	}
}

#[async_trait::async_trait]
impl ChainQuery for StubQuery {
	async fn fetch_since(&self, address: &str, start: u64) -> Result<TransactionMap, ChainError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		let keep = |map: &TransactionMap| -> TransactionMap {
			map.iter()
				.filter(|(identity, _)| identity.version >= start)
				.map(|(identity, tx)| (identity.clone(), tx.clone()))
				.collect()
		};
		match self.responses.get(address).cloned() {
			None => Ok(TransactionMap::new()),
			Some(StubResponse::Found(map)) => Ok(keep(&map)),
			Some(StubResponse::Delayed(delay, map)) => {
				tokio::time::sleep(delay).await;
				Ok(keep(&map))
			}
			Some(StubResponse::Fail(message)) => Err(ChainError::Api(message)),
			Some(StubResponse::FailAfter(delay, message)) => {
				tokio::time::sleep(delay).await;
				Err(ChainError::Api(message))
			}
			Some(StubResponse::Hang(dropped)) => {
				let _flag = DropFlag(dropped);
				std::future::pending::<()>().await;
				Ok(TransactionMap::new())
			}
		}
	}
}

/// SQLite store whose reads or writes can be made to fail.
pub struct FlakyStore {
	pub inner: SqliteLedgerStore,
	pub fail_snapshot: AtomicBool,
	pub fail_writes: AtomicBool,
}

impl FlakyStore {
	pub fn new(inner: SqliteLedgerStore) -> Self {
		Self {
			inner,
			fail_snapshot: AtomicBool::new(false),
			fail_writes: AtomicBool::new(false),
		}
	}

	fn check(flag: &AtomicBool) -> Result<(), StoreError> {
		if flag.load(Ordering::SeqCst) {
			return Err(StoreError::Background("injected failure".to_string()));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl LedgerStore for FlakyStore {
	async fn snapshot(
		&self,
		chain: &ChainId,
		addresses: &[String],
		start: u64,
		viewer: Option<i64>,
	) -> Result<TransactionMap, StoreError> {
		Self::check(&self.fail_snapshot)?;
		self.inner.snapshot(chain, addresses, start, viewer).await
	}

	async fn store_new(&self, transactions: Vec<LedgerTransaction>) -> Result<(), StoreError> {
		Self::check(&self.fail_writes)?;
		self.inner.store_new(transactions).await
	}

	async fn replace_changed(&self, transactions: Vec<LedgerTransaction>) -> Result<(), StoreError> {
		Self::check(&self.fail_writes)?;
		self.inner.replace_changed(transactions).await
	}

	async fn transaction(
		&self,
		identity: &TransactionIdentity,
		viewer: Option<i64>,
	) -> Result<Option<LedgerTransaction>, StoreError> {
		self.inner.transaction(identity, viewer).await
	}
}
