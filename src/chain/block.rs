//!
//! Explorer API client for block ledgers.
//!
//! Block ledgers address a transaction by (block number, transaction index). Token movements
//! are read from the explorer's transfer-log index, which returns one row per transfer log,
//! so a transaction moving several tokens shows up as several rows. Transaction-level
//! metadata (outcome, gas currency, gateway fee) comes from a separate per-hash lookup.

use super::types::*;
use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Remote query primitives of a block ledger.
#[async_trait]
pub trait BlockLedgerClient: Send + Sync {
	/// One page of token transfer rows touching `address`, ascending, from `start_block` on.
	/// Pages are numbered from 1.
	async fn token_transfers(
		&self,
		address: &str,
		start_block: u64,
		page: u32,
		page_size: u32,
	) -> Result<Vec<TokenTransferRow>, ChainError>;

	/// Transaction-level metadata of the transaction with `hash`.
	async fn transaction_info(&self, hash: &str) -> Result<TransactionInfo, ChainError>;
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
	status: String,
	#[serde(default)]
	message: String,
	#[serde(default)]
	result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTokenTransfer {
	block_number: String,
	time_stamp: String,
	hash: String,
	#[serde(default)]
	transaction_index: String,
	#[serde(default)]
	log_index: String,
	from: String,
	to: String,
	contract_address: String,
	value: String,
	#[serde(default)]
	gas: String,
	#[serde(default)]
	gas_price: String,
	#[serde(default)]
	gas_used: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransactionInfo {
	#[serde(default)]
	success: Option<bool>,
	#[serde(default)]
	revert_reason: Option<String>,
	#[serde(default)]
	fee_currency: Option<String>,
	#[serde(default)]
	gateway_fee: Option<String>,
	#[serde(default)]
	gateway_fee_recipient: Option<String>,
}

/// Block ledger client for an Etherscan-style explorer API.
#[derive(Clone)]
pub struct ExplorerBlockClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL of the explorer API, e.g. `https://explorer.celo.org/api`.
	api_url: String,
}

impl ExplorerBlockClient {
	/// Create a new explorer client.
	///
	/// # Arguments
	/// * `api_url` - The explorer API endpoint.
	/// * `timeout` - Timeout applied to every request.
	pub fn new(api_url: String, timeout: Duration) -> Result<Self, ChainError> {
		let http_client = Client::builder().timeout(timeout).build()?;
		Ok(Self {
			http_client,
			api_url,
		})
	}

	/// Execute an explorer query.
	///
	/// # Returns
	/// The `result` member, `None` when the explorer reports an empty result set.
	async fn query(&self, params: &[(&str, String)]) -> Result<Option<serde_json::Value>, ChainError> {
		debug!("Querying explorer {} with {:?}", self.api_url, params);

		let response = self
			.http_client
			.get(&self.api_url)
			.query(params)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(ChainError::Api(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let body: ExplorerResponse = response.json().await?;
		unwrap_envelope(body)
	}
}

fn unwrap_envelope(body: ExplorerResponse) -> Result<Option<serde_json::Value>, ChainError> {
	if body.status == "1" {
		return Ok(Some(body.result));
	}
	// Empty result sets come back as status 0 with a "No ... found" message.
	if body.message.starts_with("No ") {
		return Ok(None);
	}
	Err(ChainError::Api(format!("{}: {}", body.message, body.result)))
}

fn parse_u64(field: &str, value: &str) -> Result<u64, ChainError> {
	if value.is_empty() {
		return Ok(0);
	}
	value
		.parse()
		.map_err(|_| ChainError::Parse(format!("{} is not an unsigned integer: {:?}", field, value)))
}

fn parse_i64(field: &str, value: &str) -> Result<i64, ChainError> {
	if value.is_empty() {
		return Ok(0);
	}
	value
		.parse()
		.map_err(|_| ChainError::Parse(format!("{} is not an integer: {:?}", field, value)))
}

fn parse_big(field: &str, value: &str) -> Result<BigUint, ChainError> {
	if value.is_empty() {
		return Ok(BigUint::default());
	}
	value
		.parse()
		.map_err(|_| ChainError::Parse(format!("{} is not an amount: {:?}", field, value)))
}

impl TryFrom<RawTokenTransfer> for TokenTransferRow {
	type Error = ChainError;

	fn try_from(raw: RawTokenTransfer) -> Result<Self, Self::Error> {
		Ok(TokenTransferRow {
			block_number: parse_u64("blockNumber", &raw.block_number)?,
			timestamp: parse_i64("timeStamp", &raw.time_stamp)?,
			transaction_index: parse_i64("transactionIndex", &raw.transaction_index)?,
			log_index: parse_i64("logIndex", &raw.log_index)?,
			value: parse_big("value", &raw.value)?,
			gas: parse_u64("gas", &raw.gas)?,
			gas_price: parse_big("gasPrice", &raw.gas_price)?,
			gas_used: parse_u64("gasUsed", &raw.gas_used)?,
			hash: raw.hash,
			from: raw.from,
			to: raw.to,
			contract_address: raw.contract_address,
		})
	}
}

impl TryFrom<RawTransactionInfo> for TransactionInfo {
	type Error = ChainError;

	fn try_from(raw: RawTransactionInfo) -> Result<Self, Self::Error> {
		let status = match (raw.success, raw.revert_reason) {
			(Some(false), Some(reason)) if !reason.is_empty() => reason,
			(Some(false), _) => "failed".to_string(),
			_ => "success".to_string(),
		};
		let gateway_fee = match raw.gateway_fee.as_deref() {
			None | Some("") => None,
			Some(fee) => Some(parse_big("gatewayFee", fee)?),
		};

		Ok(TransactionInfo {
			status,
			gateway_fee,
			gateway_fee_recipient: raw.gateway_fee_recipient.unwrap_or_default(),
			fee_currency: raw.fee_currency.unwrap_or_default(),
		})
	}
}

#[async_trait]
impl BlockLedgerClient for ExplorerBlockClient {
	async fn token_transfers(
		&self,
		address: &str,
		start_block: u64,
		page: u32,
		page_size: u32,
	) -> Result<Vec<TokenTransferRow>, ChainError> {
		let params = [
			("module", "account".to_string()),
			("action", "tokentx".to_string()),
			("address", address.to_string()),
			("startblock", start_block.to_string()),
			("sort", "asc".to_string()),
			("page", page.to_string()),
			("offset", page_size.to_string()),
		];

		let Some(result) = self.query(&params).await? else {
			return Ok(Vec::new());
		};
		let raw: Vec<RawTokenTransfer> = serde_json::from_value(result)?;
		raw.into_iter().map(TokenTransferRow::try_from).collect()
	}

	async fn transaction_info(&self, hash: &str) -> Result<TransactionInfo, ChainError> {
		let params = [
			("module", "transaction".to_string()),
			("action", "gettxinfo".to_string()),
			("txhash", hash.to_string()),
		];

		let result = self.query(&params).await?.ok_or(ChainError::NoData)?;
		let raw: RawTransactionInfo = serde_json::from_value(result)?;
		TransactionInfo::try_from(raw)
	}
}
