//!
//! Chain query adapters.
//!
//! A [`ChainQuery`] answers one question for one address: which transactions touching it exist
//! on the remote ledger from a start position on. Each ledger kind has an adapter that turns the
//! client's query primitives into the shared transaction model. The adapters only read; nothing
//! here touches the local store.

use crate::chain::{
	BlockLedgerClient, ChainError, LedgerAddress, SequentialLedgerClient, SequentialTransactionView,
	TokenTransferRow, TransactionInfo, retry_stale,
};
use crate::config::ReconcileConfig;
use crate::ledger::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt, stream};
use itertools::Itertools;
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Remote lookup of the transactions touching one address.
#[async_trait]
pub trait ChainQuery: Send + Sync {
	/// All transactions on the remote ledger that touch `address` and are positioned at or after
	/// `start` (a version on sequential ledgers, a block number on block ledgers).
	///
	/// Implementations are cancelled by dropping the returned future.
	async fn fetch_since(&self, address: &str, start: u64) -> Result<TransactionMap, ChainError>;
}

/// Adapter for sequential ledgers.
///
/// Reads both event streams of the account, keeps the versions at or after `start`, and
/// fetches each distinct version's detail once.
pub struct SequentialQuery {
	client: Arc<dyn SequentialLedgerClient>,
	chain: ChainId,
	config: ReconcileConfig,
}

impl SequentialQuery {
	pub fn new(client: Arc<dyn SequentialLedgerClient>, chain: ChainId, config: ReconcileConfig) -> Self {
		Self {
			client,
			chain,
			config,
		}
	}

	/// Every transaction version referenced by event stream `key`.
	async fn stream_versions(&self, key: &str) -> Result<Vec<u64>, ChainError> {
		let limit = u64::from(self.config.page_size.max(1));
		let mut versions = Vec::new();
		let mut next = 0u64;

		loop {
			let page = retry_stale(&self.config.retry, "get_events", || {
				self.client.events(key, next, limit)
			})
			.await?;
			let fetched = page.len() as u64;
			versions.extend(page.into_iter().map(|event| event.transaction_version));
			if fetched < limit {
				break;
			}
			next += fetched;
		}

		Ok(versions)
	}

	async fn fetch_version(&self, version: u64) -> Result<LedgerTransaction, ChainError> {
		let view = retry_stale(&self.config.retry, "get_transactions", || {
			self.client.transaction(version)
		})
		.await?
		.ok_or(ChainError::NoData)?;

		Ok(self.to_transaction(view))
	}

	fn to_transaction(&self, view: SequentialTransactionView) -> LedgerTransaction {
		let signed = view.transaction;
		let timestamp = i64::try_from(signed.timestamp_usecs)
			.ok()
			.and_then(DateTime::<Utc>::from_timestamp_micros)
			.unwrap_or_default();

		LedgerTransaction::Sequential(SequentialTransaction {
			identity: TransactionIdentity::sequential(self.chain.clone(), view.version),
			gas: Gas {
				price: BigUint::from(signed.gas_unit_price),
				used: view.gas_used,
				max: signed.max_gas_amount,
			},
			gas_currency: signed.gas_currency,
			status: view.vm_status.kind,
			hash: view.hash,
			timestamp,
			public_key: signed.public_key,
			transfer: Transfer {
				currency: signed.script.currency,
				from: signed.sender,
				to: signed.script.receiver,
				amount: BigUint::from(signed.script.amount),
			},
			annotations: Annotations::default(),
		})
	}
}

#[async_trait]
impl ChainQuery for SequentialQuery {
	async fn fetch_since(&self, address: &str, start: u64) -> Result<TransactionMap, ChainError> {
		let address = LedgerAddress::decode(LedgerKind::Sequential, address)?.canonical();

		let Some(cursors) = retry_stale(&self.config.retry, "get_account", || {
			self.client.account(&address)
		})
		.await?
		else {
			debug!("Account {} does not exist on {}", address, self.chain);
			return Ok(TransactionMap::new());
		};

		let sent = self.stream_versions(&cursors.sent_events_key).await?;
		let received = self.stream_versions(&cursors.received_events_key).await?;
		let versions: Vec<u64> = sent
			.into_iter()
			.chain(received)
			.filter(|version| *version >= start)
			.sorted()
			.dedup()
			.collect();
		debug!(
			"Fetching {} transactions of {} on {} from version {}",
			versions.len(),
			address,
			self.chain,
			start
		);

		stream::iter(versions)
			.map(|version| self.fetch_version(version))
			.buffer_unordered(self.config.fetch_concurrency.max(1))
			.map_ok(|tx| (tx.identity().clone(), tx))
			.try_collect()
			.await
	}
}

/// Adapter for block ledgers.
///
/// Pages through the explorer's transfer-log index, looks up each distinct transaction hash
/// once, and folds every row into its transaction's event map.
pub struct BlockQuery {
	client: Arc<dyn BlockLedgerClient>,
	chain: ChainId,
	config: ReconcileConfig,
}

impl BlockQuery {
	pub fn new(client: Arc<dyn BlockLedgerClient>, chain: ChainId, config: ReconcileConfig) -> Self {
		Self {
			client,
			chain,
			config,
		}
	}

	async fn transfer_rows(&self, address: &str, start: u64) -> Result<Vec<TokenTransferRow>, ChainError> {
		let page_size = self.config.page_size.max(1);
		let mut rows = Vec::new();
		let mut page = 1u32;

		loop {
			let batch = retry_stale(&self.config.retry, "tokentx", || {
				self.client.token_transfers(address, start, page, page_size)
			})
			.await?;
			let fetched = batch.len();
			rows.extend(batch.into_iter().filter(|row| row.block_number >= start));
			if fetched < page_size as usize {
				break;
			}
			page += 1;
		}

		Ok(rows)
	}

	async fn transaction_infos(&self, hashes: Vec<String>) -> Result<HashMap<String, TransactionInfo>, ChainError> {
		stream::iter(hashes)
			.map(|hash| async move {
				let info = retry_stale(&self.config.retry, "gettxinfo", || {
					self.client.transaction_info(&hash)
				})
				.await?;
				Ok::<_, ChainError>((hash, info))
			})
			.buffer_unordered(self.config.fetch_concurrency.max(1))
			.try_collect()
			.await
	}

	fn new_transaction(&self, identity: TransactionIdentity, row: &TokenTransferRow, info: &TransactionInfo) -> BlockTransaction {
		BlockTransaction {
			identity,
			gas: Gas {
				price: row.gas_price.clone(),
				used: row.gas_used,
				max: row.gas,
			},
			status: info.status.clone(),
			hash: row.hash.clone(),
			timestamp: DateTime::<Utc>::from_timestamp(row.timestamp, 0).unwrap_or_default(),
			gateway_fee: info.gateway_fee.clone(),
			gateway_recipient: info.gateway_fee_recipient.clone(),
			gateway_currency: info.fee_currency.clone(),
			transfer_events: Default::default(),
			annotations: Annotations::default(),
		}
	}
}

#[async_trait]
impl ChainQuery for BlockQuery {
	async fn fetch_since(&self, address: &str, start: u64) -> Result<TransactionMap, ChainError> {
		let address = LedgerAddress::decode(LedgerKind::Block, address)?.canonical();

		let rows = self.transfer_rows(&address, start).await?;
		let hashes: Vec<String> = rows.iter().map(|row| row.hash.clone()).unique().collect();
		debug!(
			"Fetched {} transfer rows in {} transactions of {} on {}",
			rows.len(),
			hashes.len(),
			address,
			self.chain
		);
		let infos = self.transaction_infos(hashes).await?;

		let mut transactions = TransactionMap::new();
		for row in rows {
			let info = infos.get(&row.hash).ok_or(ChainError::NoData)?;
			let identity = TransactionIdentity::new(self.chain.clone(), row.block_number, row.transaction_index);
			let entry = transactions
				.entry(identity.clone())
				.or_insert_with(|| LedgerTransaction::Block(self.new_transaction(identity, &row, info)));

			if let LedgerTransaction::Block(tx) = entry {
				tx.insert_event(TransferEvent {
					log_index: row.log_index,
					currency: row.contract_address,
					from: row.from,
					to: row.to,
					amount: row.value,
				});
			}
		}

		Ok(transactions)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::{AccountCursors, LedgerEvent, ScriptView, UserTransactionView, VmStatus};
	use crate::config::RetryConfig;
	use std::sync::Mutex;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::time::Duration;

	const ALICE: &str = "f72589b71ff4f8d139674a3f7369c69b";
	const WALLET: &str = "0x1111111111111111111111111111111111111111";

	fn test_config(page_size: u32) -> ReconcileConfig {
		ReconcileConfig {
			fetch_concurrency: 2,
			page_size,
			http_timeout: Duration::from_secs(1),
			retry: RetryConfig {
				max_attempts: 3,
				initial_interval: Duration::from_millis(1),
				max_interval: Duration::from_millis(2),
				multiplier: 1.5,
			},
		}
	}

	struct StubSequentialClient {
		sent: Vec<u64>,
		received: Vec<u64>,
		stale_account_calls: AtomicU32,
		fetched_versions: Mutex<Vec<u64>>,
	}

	impl StubSequentialClient {
		fn new(sent: Vec<u64>, received: Vec<u64>) -> Self {
			Self {
				sent,
				received,
				stale_account_calls: AtomicU32::new(0),
				fetched_versions: Mutex::new(Vec::new()),
			}
		}
	}

	#[async_trait]
	impl SequentialLedgerClient for StubSequentialClient {
		async fn account(&self, address: &str) -> Result<Option<AccountCursors>, ChainError> {
			if self.stale_account_calls.load(Ordering::SeqCst) > 0 {
				self.stale_account_calls.fetch_sub(1, Ordering::SeqCst);
				return Err(ChainError::StaleResponse { seen: 1, latest: 2 });
			}
			Ok(Some(AccountCursors {
				address: address.to_string(),
				sent_events_key: "sent".to_string(),
				received_events_key: "received".to_string(),
			}))
		}

		async fn events(&self, key: &str, start: u64, limit: u64) -> Result<Vec<LedgerEvent>, ChainError> {
			let versions = if key == "sent" { &self.sent } else { &self.received };
			Ok(versions
				.iter()
				.enumerate()
				.skip(start as usize)
				.take(limit as usize)
				.map(|(seq, version)| LedgerEvent {
					key: key.to_string(),
					sequence_number: seq as u64,
					transaction_version: *version,
				})
				.collect())
		}

		async fn transaction(&self, version: u64) -> Result<Option<SequentialTransactionView>, ChainError> {
			self.fetched_versions.lock().unwrap().push(version);
			Ok(Some(SequentialTransactionView {
				version,
				hash: format!("hash-{}", version),
				gas_used: 100,
				vm_status: VmStatus {
					kind: "executed".to_string(),
				},
				transaction: UserTransactionView {
					sender: ALICE.to_string(),
					gas_unit_price: 1,
					max_gas_amount: 1000,
					gas_currency: "XUS".to_string(),
					timestamp_usecs: 1_600_000_000_000_000,
					script: ScriptView {
						receiver: "000000000000000000000000000000dd".to_string(),
						amount: 5_000_000,
						currency: "XUS".to_string(),
					},
					..UserTransactionView::default()
				},
			}))
		}
	}

	#[tokio::test]
	async fn test_sequential_filters_and_deduplicates_versions() {
		let client = Arc::new(StubSequentialClient::new(vec![3, 5, 9], vec![5, 12, 1]));
		let query = SequentialQuery::new(client.clone(), ChainId::new("diem"), test_config(2));

		let transactions = query.fetch_since(ALICE, 5).await.unwrap();

		assert_eq!(
			transactions.keys().map(|id| id.version).collect::<Vec<_>>(),
			vec![5, 9, 12]
		);
		let mut fetched = client.fetched_versions.lock().unwrap().clone();
		fetched.sort();
		assert_eq!(fetched, vec![5, 9, 12]);

		let LedgerTransaction::Sequential(tx) = &transactions[&TransactionIdentity::sequential(ChainId::new("diem"), 9)]
		else {
			panic!("expected a sequential transaction");
		};
		assert_eq!(tx.hash, "hash-9");
		assert_eq!(tx.transfer.amount, BigUint::from(5_000_000u64));
		assert_eq!(tx.timestamp.timestamp(), 1_600_000_000);
		assert_eq!(tx.identity.index, SEQUENTIAL_INDEX);
	}

	#[tokio::test]
	async fn test_sequential_retries_stale_account_lookup() {
		let client = Arc::new(StubSequentialClient::new(vec![7], vec![]));
		client.stale_account_calls.store(2, Ordering::SeqCst);
		let query = SequentialQuery::new(client.clone(), ChainId::new("diem"), test_config(10));

		let transactions = query.fetch_since(ALICE, 0).await.unwrap();
		assert_eq!(transactions.len(), 1);
	}

	#[tokio::test]
	async fn test_sequential_rejects_invalid_address() {
		let client = Arc::new(StubSequentialClient::new(vec![], vec![]));
		let query = SequentialQuery::new(client, ChainId::new("diem"), test_config(10));

		let err = query.fetch_since("not-an-address", 0).await.unwrap_err();
		assert!(matches!(err, ChainError::InvalidAddress(_)));
	}

	struct StubBlockClient {
		rows: Vec<TokenTransferRow>,
		info_calls: Mutex<HashMap<String, u32>>,
	}

	fn row(block: u64, tx_index: i64, log_index: i64, hash: &str, value: u32) -> TokenTransferRow {
		TokenTransferRow {
			block_number: block,
			timestamp: 1_600_000_000,
			hash: hash.to_string(),
			transaction_index: tx_index,
			log_index,
			from: WALLET.to_string(),
			to: "0x2222222222222222222222222222222222222222".to_string(),
			contract_address: "0x765de816845861e75a25fca122bb6898b8b1282a".to_string(),
			value: BigUint::from(value),
			gas: 210_000,
			gas_price: BigUint::from(500_000_000u32),
			gas_used: 51_000,
		}
	}

	#[async_trait]
	impl BlockLedgerClient for StubBlockClient {
		async fn token_transfers(
			&self,
			_address: &str,
			start_block: u64,
			page: u32,
			page_size: u32,
		) -> Result<Vec<TokenTransferRow>, ChainError> {
			Ok(self
				.rows
				.iter()
				.filter(|row| row.block_number >= start_block)
				.skip(((page - 1) * page_size) as usize)
				.take(page_size as usize)
				.cloned()
				.collect())
		}

		async fn transaction_info(&self, hash: &str) -> Result<TransactionInfo, ChainError> {
			*self.info_calls.lock().unwrap().entry(hash.to_string()).or_default() += 1;
			Ok(TransactionInfo {
				status: "success".to_string(),
				gateway_fee: Some(BigUint::from(3u32)),
				gateway_fee_recipient: "0x3333333333333333333333333333333333333333".to_string(),
				fee_currency: "cUSD".to_string(),
			})
		}
	}

	#[tokio::test]
	async fn test_block_rows_fold_into_transactions() {
		let client = Arc::new(StubBlockClient {
			rows: vec![
				row(9, 0, 0, "0xold", 1),
				row(10, 0, 0, "0xaa", 10),
				row(10, 0, 2, "0xaa", 20),
				row(11, 1, -1, "0xbb", 30),
				row(11, 1, 4, "0xbb", 40),
			],
			info_calls: Mutex::new(HashMap::new()),
		});
		// A page size of 2 splits both transactions across page boundaries.
		let query = BlockQuery::new(client.clone(), ChainId::new("celo"), test_config(2));

		let transactions = query.fetch_since(WALLET, 10).await.unwrap();

		assert_eq!(transactions.len(), 2);
		let LedgerTransaction::Block(first) = &transactions[&TransactionIdentity::new(ChainId::new("celo"), 10, 0)] else {
			panic!("expected a block transaction");
		};
		assert_eq!(first.transfer_events.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
		assert_eq!(first.gateway_fee, Some(BigUint::from(3u32)));
		assert_eq!(first.gateway_currency, "cUSD");
		assert_eq!(first.gas.used, 51_000);

		let LedgerTransaction::Block(second) = &transactions[&TransactionIdentity::new(ChainId::new("celo"), 11, 1)] else {
			panic!("expected a block transaction");
		};
		assert_eq!(second.transfer_events.keys().copied().collect::<Vec<_>>(), vec![0, 4]);

		let calls = client.info_calls.lock().unwrap();
		assert_eq!(calls.len(), 2);
		assert!(calls.values().all(|count| *count == 1));
		assert!(!calls.contains_key("0xold"));
	}

	#[tokio::test]
	async fn test_block_requires_prefixed_address() {
		let client = Arc::new(StubBlockClient {
			rows: vec![],
			info_calls: Mutex::new(HashMap::new()),
		});
		let query = BlockQuery::new(client, ChainId::new("celo"), test_config(10));

		let err = query
			.fetch_since("1111111111111111111111111111111111111111", 0)
			.await
			.unwrap_err();
		assert!(matches!(err, ChainError::InvalidAddress(_)));
	}
}
