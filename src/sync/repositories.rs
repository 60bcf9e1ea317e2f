//! Local ledger store.
//!
//! [`LedgerStore`] is what the reconciliation engine needs from persistence: a snapshot of the
//! transactions touching a set of addresses, insert-if-absent for new transactions, and an
//! atomic replace for corrected ones. [`AddressResolver`] maps an account to its wallet
//! addresses on a chain.
//!
//! [`SqliteLedgerStore`] implements both over one SQLite connection. Blocking database work runs
//! on the blocking thread pool.

use crate::ledger::*;
use crate::sync::types::StoreError;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SELECT_COMMON: &str = "SELECT t.version, t.tx_index, t.gas_price, t.gas_used, t.gas_max, t.status, t.hash,
        t.timestamp_us, r.message, r.is_refund, a.account_id, a.message";

const JOIN_REMARKS: &str = "LEFT JOIN sender_remark r
        ON r.chain = t.chain AND r.version = t.version AND r.tx_index = t.tx_index
    LEFT JOIN account_remark a
        ON a.chain = t.chain AND a.version = t.version AND a.tx_index = t.tx_index AND a.account_id = ?";

/// Repository for reconciled transactions
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
	/// Transactions of `chain` positioned at or after `start` in which any of `addresses`
	/// sends or receives. Account remarks are included only for `viewer`.
	async fn snapshot(
		&self,
		chain: &ChainId,
		addresses: &[String],
		start: u64,
		viewer: Option<i64>,
	) -> Result<TransactionMap, StoreError>;

	/// Insert transactions whose identity is not stored yet. Existing identities are left
	/// untouched, so the call is idempotent.
	async fn store_new(&self, transactions: Vec<LedgerTransaction>) -> Result<(), StoreError>;

	/// Replace stored transactions with corrected copies. All of the batch is replaced or none
	/// of it. Remarks attached to the identities survive.
	async fn replace_changed(&self, transactions: Vec<LedgerTransaction>) -> Result<(), StoreError>;

	/// Point lookup by identity.
	async fn transaction(
		&self,
		identity: &TransactionIdentity,
		viewer: Option<i64>,
	) -> Result<Option<LedgerTransaction>, StoreError>;
}

/// Repository for account-to-address links
#[async_trait::async_trait]
pub trait AddressResolver: Send + Sync {
	async fn addresses_for_account(&self, account_id: i64, chain: &ChainId) -> Result<Vec<String>, StoreError>;
}

/// SQLite-backed implementation of LedgerStore and AddressResolver
#[derive(Clone)]
pub struct SqliteLedgerStore {
	conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
	/// Opens or creates a store at `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
		let path = path.as_ref();
		info!("Opening ledger store at {}", path.display());
		Self::initialize(Connection::open(path)?)
	}

	/// Creates an in-memory store.
	pub fn in_memory() -> Result<Self, StoreError> {
		Self::initialize(Connection::open_in_memory()?)
	}

	fn initialize(conn: Connection) -> Result<Self, StoreError> {
		conn.execute_batch(SCHEMA_SQL)?;
		Ok(Self {
			conn: Arc::new(Mutex::new(conn)),
		})
	}

	async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		T: Send + 'static,
		F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
	{
		let conn = Arc::clone(&self.conn);
		tokio::task::spawn_blocking(move || {
			let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
			f(&mut *guard)
		})
		.await
		.map_err(|e| StoreError::Background(e.to_string()))?
	}

	/// Link `address` on `chain` to `account_id`.
	pub async fn link_wallet(&self, account_id: i64, chain: &ChainId, address: &str) -> Result<(), StoreError> {
		let chain = chain.clone();
		let address = address.to_string();
		self.with_connection(move |conn| {
			conn.execute(
				"INSERT INTO account_wallet (account_id, chain, address) VALUES (?1, ?2, ?3)
				 ON CONFLICT (account_id, chain, address) DO NOTHING",
				params![account_id, chain.as_str(), address],
			)?;
			Ok(())
		})
		.await
	}

	/// Attach or overwrite the sender's remark on a transaction.
	pub async fn set_sender_remark(&self, identity: &TransactionIdentity, remark: SenderRemark) -> Result<(), StoreError> {
		let identity = identity.clone();
		self.with_connection(move |conn| {
			conn.execute(
				"INSERT INTO sender_remark (chain, version, tx_index, message, is_refund) VALUES (?1, ?2, ?3, ?4, ?5)
				 ON CONFLICT (chain, version, tx_index) DO UPDATE SET message = excluded.message, is_refund = excluded.is_refund",
				params![
					identity.chain.as_str(),
					to_sql_int("version", identity.version)?,
					identity.index,
					remark.message,
					remark.is_refund
				],
			)?;
			Ok(())
		})
		.await
	}

	/// Attach or overwrite an account's note on a transaction.
	pub async fn set_account_remark(&self, identity: &TransactionIdentity, remark: AccountRemark) -> Result<(), StoreError> {
		let identity = identity.clone();
		self.with_connection(move |conn| {
			conn.execute(
				"INSERT INTO account_remark (chain, version, tx_index, account_id, message) VALUES (?1, ?2, ?3, ?4, ?5)
				 ON CONFLICT (chain, version, tx_index, account_id) DO UPDATE SET message = excluded.message",
				params![
					identity.chain.as_str(),
					to_sql_int("version", identity.version)?,
					identity.index,
					remark.account_id,
					remark.message
				],
			)?;
			Ok(())
		})
		.await
	}
}

#[async_trait::async_trait]
impl LedgerStore for SqliteLedgerStore {
	async fn snapshot(
		&self,
		chain: &ChainId,
		addresses: &[String],
		start: u64,
		viewer: Option<i64>,
	) -> Result<TransactionMap, StoreError> {
		if addresses.is_empty() {
			return Ok(TransactionMap::new());
		}
		let chain = chain.clone();
		let addresses = addresses.to_vec();

		self.with_connection(move |conn| {
			let tx = conn.transaction()?;
			let start = i64::try_from(start).unwrap_or(i64::MAX);
			let selection = Selection::Involving {
				addresses: &addresses,
				start,
			};
			let mut transactions = load_sequential(&tx, &chain, &selection, viewer)?;
			transactions.extend(load_block(&tx, &chain, &selection, viewer)?);
			tx.commit()?;
			debug!(
				"Loaded {} local transactions of {} addresses on {}",
				transactions.len(),
				addresses.len(),
				chain
			);
			Ok(transactions)
		})
		.await
	}

	async fn store_new(&self, transactions: Vec<LedgerTransaction>) -> Result<(), StoreError> {
		if transactions.is_empty() {
			return Ok(());
		}
		self.with_connection(move |conn| {
			let tx = conn.transaction()?;
			let inserted = insert_transactions(&tx, &transactions)?;
			tx.commit()?;
			debug!("Stored {} of {} new transactions", inserted, transactions.len());
			Ok(())
		})
		.await
	}

	async fn replace_changed(&self, transactions: Vec<LedgerTransaction>) -> Result<(), StoreError> {
		if transactions.is_empty() {
			return Ok(());
		}
		self.with_connection(move |conn| {
			let tx = conn.transaction()?;
			for transaction in &transactions {
				let identity = transaction.identity();
				// Kind-specific rows and transfer events cascade.
				tx.execute(
					"DELETE FROM ledger_transaction WHERE chain = ?1 AND version = ?2 AND tx_index = ?3",
					params![
						identity.chain.as_str(),
						to_sql_int("version", identity.version)?,
						identity.index
					],
				)?;
			}
			insert_transactions(&tx, &transactions)?;
			tx.commit()?;
			debug!("Replaced {} changed transactions", transactions.len());
			Ok(())
		})
		.await
	}

	async fn transaction(
		&self,
		identity: &TransactionIdentity,
		viewer: Option<i64>,
	) -> Result<Option<LedgerTransaction>, StoreError> {
		let identity = identity.clone();
		self.with_connection(move |conn| {
			let selection = Selection::Identity {
				version: to_sql_int("version", identity.version)?,
				index: identity.index,
			};
			let mut found = load_sequential(conn, &identity.chain, &selection, viewer)?;
			found.extend(load_block(conn, &identity.chain, &selection, viewer)?);
			Ok(found.remove(&identity))
		})
		.await
	}
}

#[async_trait::async_trait]
impl AddressResolver for SqliteLedgerStore {
	async fn addresses_for_account(&self, account_id: i64, chain: &ChainId) -> Result<Vec<String>, StoreError> {
		let chain = chain.clone();
		self.with_connection(move |conn| {
			let mut stmt = conn.prepare(
				"SELECT address FROM account_wallet WHERE account_id = ?1 AND chain = ?2 ORDER BY address",
			)?;
			let addresses = stmt
				.query_map(params![account_id, chain.as_str()], |row| row.get(0))?
				.collect::<Result<Vec<String>, _>>()?;
			Ok(addresses)
		})
		.await
	}
}

/// Which transactions a load returns.
enum Selection<'a> {
	Involving { addresses: &'a [String], start: i64 },
	Identity { version: i64, index: i64 },
}

impl Selection<'_> {
	/// WHERE clause over alias `t` plus the parameters it binds, in order. `involving` is an
	/// SQL condition with two `{}` slots for the sender and receiver placeholder lists.
	fn filter(&self, involving: &str) -> (String, Vec<Value>) {
		match self {
			Selection::Involving { addresses, start } => {
				let placeholders = vec!["?"; addresses.len()].join(", ");
				let condition = involving.replacen("{}", &placeholders, 2);
				let mut values = vec![Value::Integer(*start)];
				for _ in 0..2 {
					values.extend(addresses.iter().map(|a| Value::Text(a.clone())));
				}
				(format!("t.version >= ? AND {}", condition), values)
			}
			Selection::Identity { version, index } => (
				"t.version = ? AND t.tx_index = ?".to_string(),
				vec![Value::Integer(*version), Value::Integer(*index)],
			),
		}
	}
}

fn bind(viewer: Option<i64>, chain: &ChainId, filter: Vec<Value>) -> Vec<Value> {
	let mut values = vec![
		viewer.map(Value::Integer).unwrap_or(Value::Null),
		Value::Text(chain.as_str().to_string()),
	];
	values.extend(filter);
	values
}

fn load_sequential(
	conn: &Connection,
	chain: &ChainId,
	selection: &Selection<'_>,
	viewer: Option<i64>,
) -> Result<TransactionMap, StoreError> {
	let (filter, values) = selection.filter("(s.sender IN ({}) OR s.receiver IN ({}))");
	let sql = format!(
		"{SELECT_COMMON}, s.public_key, s.gas_currency, s.currency, s.amount, s.sender, s.receiver
    FROM ledger_transaction t
    JOIN sequential_transfer s ON s.chain = t.chain AND s.version = t.version AND s.tx_index = t.tx_index
    {JOIN_REMARKS}
    WHERE t.chain = ? AND {filter}
    ORDER BY t.version, t.tx_index"
	);

	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt
		.query_map(params_from_iter(bind(viewer, chain, values)), SequentialRow::read)?
		.collect::<Result<Vec<_>, _>>()?;

	let mut transactions = TransactionMap::new();
	for row in rows {
		let tx = row.into_transaction(chain)?;
		transactions.insert(tx.identity().clone(), tx);
	}
	Ok(transactions)
}

fn load_block(
	conn: &Connection,
	chain: &ChainId,
	selection: &Selection<'_>,
	viewer: Option<i64>,
) -> Result<TransactionMap, StoreError> {
	// A matching transaction is loaded with all of its events, not only the matching ones.
	let (filter, values) = selection.filter(
		"EXISTS (SELECT 1 FROM block_transfer m
            WHERE m.chain = t.chain AND m.version = t.version AND m.tx_index = t.tx_index
              AND (m.sender IN ({}) OR m.receiver IN ({})))",
	);
	let sql = format!(
		"{SELECT_COMMON}, b.gateway_currency, b.gateway_fee, b.gateway_recipient,
        e.log_index, e.currency, e.amount, e.sender, e.receiver
    FROM ledger_transaction t
    JOIN block_transaction b ON b.chain = t.chain AND b.version = t.version AND b.tx_index = t.tx_index
    LEFT JOIN block_transfer e ON e.chain = t.chain AND e.version = t.version AND e.tx_index = t.tx_index
    {JOIN_REMARKS}
    WHERE t.chain = ? AND {filter}
    ORDER BY t.version, t.tx_index, e.log_index"
	);

	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt
		.query_map(params_from_iter(bind(viewer, chain, values)), BlockRow::read)?
		.collect::<Result<Vec<_>, _>>()?;

	let mut transactions = TransactionMap::new();
	for row in rows {
		let identity = row.common.identity(chain)?;
		if !transactions.contains_key(&identity) {
			transactions.insert(identity.clone(), LedgerTransaction::Block(row.to_transaction(identity.clone())?));
		}
		if let (Some(LedgerTransaction::Block(tx)), Some(event)) = (transactions.get_mut(&identity), row.event) {
			tx.insert_event(event.into_event()?);
		}
	}
	Ok(transactions)
}

fn insert_transactions(conn: &Connection, transactions: &[LedgerTransaction]) -> Result<usize, StoreError> {
	let mut inserted = 0;
	for transaction in transactions {
		let identity = transaction.identity();
		let version = to_sql_int("version", identity.version)?;
		let (gas, status, hash, timestamp) = match transaction {
			LedgerTransaction::Sequential(tx) => (&tx.gas, &tx.status, &tx.hash, tx.timestamp),
			LedgerTransaction::Block(tx) => (&tx.gas, &tx.status, &tx.hash, tx.timestamp),
		};

		let added = conn.execute(
			"INSERT INTO ledger_transaction
                (chain, version, tx_index, kind, gas_price, gas_used, gas_max, status, hash, timestamp_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (chain, version, tx_index) DO NOTHING",
			params![
				identity.chain.as_str(),
				version,
				identity.index,
				transaction.kind().as_str(),
				gas.price.to_string(),
				to_sql_int("gas_used", gas.used)?,
				to_sql_int("gas_max", gas.max)?,
				status,
				hash,
				timestamp.timestamp_micros()
			],
		)?;
		if added == 0 {
			continue;
		}
		inserted += 1;

		match transaction {
			LedgerTransaction::Sequential(tx) => {
				conn.execute(
					"INSERT INTO sequential_transfer
                        (chain, version, tx_index, public_key, gas_currency, currency, amount, sender, receiver)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
					params![
						identity.chain.as_str(),
						version,
						identity.index,
						tx.public_key,
						tx.gas_currency,
						tx.transfer.currency,
						tx.transfer.amount.to_string(),
						tx.transfer.from,
						tx.transfer.to
					],
				)?;
			}
			LedgerTransaction::Block(tx) => {
				conn.execute(
					"INSERT INTO block_transaction (chain, version, tx_index, gateway_currency, gateway_fee, gateway_recipient)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
					params![
						identity.chain.as_str(),
						version,
						identity.index,
						tx.gateway_currency,
						tx.gateway_fee.as_ref().map(|fee| fee.to_string()),
						tx.gateway_recipient
					],
				)?;
				let mut stmt = conn.prepare_cached(
					"INSERT INTO block_transfer (chain, version, tx_index, log_index, currency, amount, sender, receiver)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
				)?;
				for event in tx.transfer_events.values() {
					stmt.execute(params![
						identity.chain.as_str(),
						version,
						identity.index,
						event.log_index,
						event.currency,
						event.amount.to_string(),
						event.from,
						event.to
					])?;
				}
			}
		}
	}
	Ok(inserted)
}

fn to_sql_int(field: &str, value: u64) -> Result<i64, StoreError> {
	i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} {} does not fit in a database integer", field, value)))
}

fn from_sql_int(field: &str, value: i64) -> Result<u64, StoreError> {
	u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", field, value)))
}

fn parse_amount(field: &str, value: &str) -> Result<BigUint, StoreError> {
	value
		.parse()
		.map_err(|_| StoreError::Corrupt(format!("{} is not an amount: {:?}", field, value)))
}

/// Columns shared by both transaction kinds.
struct CommonRow {
	version: i64,
	index: i64,
	gas_price: String,
	gas_used: i64,
	gas_max: i64,
	status: String,
	hash: String,
	timestamp_us: i64,
	sender_message: Option<String>,
	is_refund: Option<bool>,
	account_id: Option<i64>,
	account_message: Option<String>,
}

impl CommonRow {
	fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(Self {
			version: row.get(0)?,
			index: row.get(1)?,
			gas_price: row.get(2)?,
			gas_used: row.get(3)?,
			gas_max: row.get(4)?,
			status: row.get(5)?,
			hash: row.get(6)?,
			timestamp_us: row.get(7)?,
			sender_message: row.get(8)?,
			is_refund: row.get(9)?,
			account_id: row.get(10)?,
			account_message: row.get(11)?,
		})
	}

	fn identity(&self, chain: &ChainId) -> Result<TransactionIdentity, StoreError> {
		Ok(TransactionIdentity::new(chain.clone(), from_sql_int("version", self.version)?, self.index))
	}

	fn gas(&self) -> Result<Gas, StoreError> {
		Ok(Gas {
			price: parse_amount("gas_price", &self.gas_price)?,
			used: from_sql_int("gas_used", self.gas_used)?,
			max: from_sql_int("gas_max", self.gas_max)?,
		})
	}

	fn timestamp(&self) -> Result<DateTime<Utc>, StoreError> {
		DateTime::<Utc>::from_timestamp_micros(self.timestamp_us)
			.ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", self.timestamp_us)))
	}

	fn annotations(&self) -> Annotations {
		Annotations {
			sender: self.sender_message.clone().map(|message| SenderRemark {
				message,
				is_refund: self.is_refund.unwrap_or(false),
			}),
			account: match (self.account_id, &self.account_message) {
				(Some(account_id), Some(message)) => Some(AccountRemark {
					account_id,
					message: message.clone(),
				}),
				_ => None,
			},
		}
	}
}

struct SequentialRow {
	common: CommonRow,
	public_key: String,
	gas_currency: String,
	currency: String,
	amount: String,
	sender: String,
	receiver: String,
}

impl SequentialRow {
	fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(Self {
			common: CommonRow::read(row)?,
			public_key: row.get(12)?,
			gas_currency: row.get(13)?,
			currency: row.get(14)?,
			amount: row.get(15)?,
			sender: row.get(16)?,
			receiver: row.get(17)?,
		})
	}

	fn into_transaction(self, chain: &ChainId) -> Result<LedgerTransaction, StoreError> {
		Ok(LedgerTransaction::Sequential(SequentialTransaction {
			identity: self.common.identity(chain)?,
			gas: self.common.gas()?,
			timestamp: self.common.timestamp()?,
			annotations: self.common.annotations(),
			gas_currency: self.gas_currency,
			status: self.common.status,
			hash: self.common.hash,
			public_key: self.public_key,
			transfer: Transfer {
				currency: self.currency,
				amount: parse_amount("amount", &self.amount)?,
				from: self.sender,
				to: self.receiver,
			},
		}))
	}
}

struct EventRow {
	log_index: i64,
	currency: String,
	amount: String,
	sender: String,
	receiver: String,
}

impl EventRow {
	fn into_event(self) -> Result<TransferEvent, StoreError> {
		Ok(TransferEvent {
			log_index: self.log_index,
			amount: parse_amount("amount", &self.amount)?,
			currency: self.currency,
			from: self.sender,
			to: self.receiver,
		})
	}
}

struct BlockRow {
	common: CommonRow,
	gateway_currency: String,
	gateway_fee: Option<String>,
	gateway_recipient: String,
	event: Option<EventRow>,
}

impl BlockRow {
	fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
		let event = match row.get::<_, Option<i64>>(15)? {
			Some(log_index) => Some(EventRow {
				log_index,
				currency: row.get(16)?,
				amount: row.get(17)?,
				sender: row.get(18)?,
				receiver: row.get(19)?,
			}),
			None => None,
		};
		Ok(Self {
			common: CommonRow::read(row)?,
			gateway_currency: row.get(12)?,
			gateway_fee: row.get(13)?,
			gateway_recipient: row.get(14)?,
			event,
		})
	}

	fn to_transaction(&self, identity: TransactionIdentity) -> Result<BlockTransaction, StoreError> {
		Ok(BlockTransaction {
			identity,
			gas: self.common.gas()?,
			status: self.common.status.clone(),
			hash: self.common.hash.clone(),
			timestamp: self.common.timestamp()?,
			gateway_fee: self
				.gateway_fee
				.as_deref()
				.map(|fee| parse_amount("gateway_fee", fee))
				.transpose()?,
			gateway_recipient: self.gateway_recipient.clone(),
			gateway_currency: self.gateway_currency.clone(),
			transfer_events: Default::default(),
			annotations: self.common.annotations(),
		})
	}
}
