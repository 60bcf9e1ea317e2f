//!
//! JSON-RPC client for sequential ledgers.
//!
//! A sequential ledger numbers every transaction with a single monotonically increasing version.
//! Accounts expose two event streams (sent and received payments) whose entries point at the
//! versions of the transactions that touched the account.
//!
//! Nodes sit behind a load balancer and can lag behind each other. Every response carries the
//! ledger version the node was at; a response older than one already seen is reported as
//! [`ChainError::StaleResponse`] so callers can retry against a fresher node.

use super::types::*;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Remote query primitives of a sequential ledger.
#[async_trait]
pub trait SequentialLedgerClient: Send + Sync {
	/// Event stream keys of `address`, or `None` when the account does not exist.
	async fn account(&self, address: &str) -> Result<Option<AccountCursors>, ChainError>;

	/// Up to `limit` events of stream `key`, starting at sequence number `start`.
	async fn events(&self, key: &str, start: u64, limit: u64) -> Result<Vec<LedgerEvent>, ChainError>;

	/// The transaction at `version`, or `None` when the ledger has not reached it.
	async fn transaction(&self, version: u64) -> Result<Option<SequentialTransactionView>, ChainError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
	code: i64,
	message: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound = "T: DeserializeOwned")]
struct RpcResponse<T> {
	#[serde(default)]
	result: Option<T>,
	#[serde(default)]
	error: Option<RpcErrorBody>,
	#[serde(default, rename = "diem_ledger_version")]
	ledger_version: Option<u64>,
}

/// Sequential ledger client speaking JSON-RPC 2.0 over HTTP.
pub struct JsonRpcSequentialClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// The JSON-RPC endpoint.
	rpc_url: String,
	/// Highest ledger version reported by any response so far.
	latest_version: AtomicU64,
	request_id: AtomicU64,
}

impl JsonRpcSequentialClient {
	/// Create a new client.
	///
	/// # Arguments
	/// * `rpc_url` - The JSON-RPC endpoint of the ledger.
	/// * `timeout` - Timeout applied to every request.
	pub fn new(rpc_url: String, timeout: Duration) -> Result<Self, ChainError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			latest_version: AtomicU64::new(0),
			request_id: AtomicU64::new(1),
		})
	}

	/// Execute a JSON-RPC call.
	///
	/// # Returns
	/// The `result` member of the response, `None` when it is null, or a `ChainError` when
	/// the request fails, the node reports an error, or the node is behind.
	async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<Option<T>, ChainError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": self.request_id.fetch_add(1, Ordering::Relaxed),
			"method": method,
			"params": params,
		});

		debug!("Calling {} on {}", method, self.rpc_url);

		let response = self
			.http_client
			.post(&self.rpc_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(ChainError::Api(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let body: RpcResponse<T> = response.json().await?;
		Self::check_response(&self.latest_version, body)
	}

	fn check_response<T>(
		latest_version: &AtomicU64,
		body: RpcResponse<T>,
	) -> Result<Option<T>, ChainError> {
		if let Some(error) = body.error {
			return Err(ChainError::Rpc {
				code: error.code,
				message: error.message,
			});
		}

		if let Some(seen) = body.ledger_version {
			let latest = latest_version.fetch_max(seen, Ordering::SeqCst);
			if seen < latest {
				return Err(ChainError::StaleResponse { seen, latest });
			}
		}

		Ok(body.result)
	}
}

#[async_trait]
impl SequentialLedgerClient for JsonRpcSequentialClient {
	async fn account(&self, address: &str) -> Result<Option<AccountCursors>, ChainError> {
		self.call("get_account", json!([address])).await
	}

	async fn events(&self, key: &str, start: u64, limit: u64) -> Result<Vec<LedgerEvent>, ChainError> {
		Ok(self
			.call("get_events", json!([key, start, limit]))
			.await?
			.unwrap_or_default())
	}

	async fn transaction(&self, version: u64) -> Result<Option<SequentialTransactionView>, ChainError> {
		let transactions: Vec<SequentialTransactionView> = self
			.call("get_transactions", json!([version, 1, false]))
			.await?
			.unwrap_or_default();

		Ok(transactions.into_iter().find(|tx| tx.version == version))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(body: serde_json::Value) -> RpcResponse<AccountCursors> {
		serde_json::from_value(body).expect("valid envelope")
	}

	#[test]
	fn test_stale_response_detected() {
		let latest = AtomicU64::new(0);
		let fresh = parse(json!({
			"jsonrpc": "2.0",
			"id": 1,
			"result": {
				"address": "f72589b71ff4f8d139674a3f7369c69b",
				"sent_events_key": "0300",
				"received_events_key": "0200"
			},
			"diem_ledger_version": 120
		}));
		let account = JsonRpcSequentialClient::check_response(&latest, fresh)
			.unwrap()
			.expect("account present");
		assert_eq!(account.sent_events_key, "0300");

		let behind = parse(json!({"jsonrpc": "2.0", "id": 2, "result": null, "diem_ledger_version": 90}));
		let err = JsonRpcSequentialClient::check_response(&latest, behind).unwrap_err();
		assert!(matches!(err, ChainError::StaleResponse { seen: 90, latest: 120 }));
	}

	#[test]
	fn test_rpc_error_surfaces() {
		let latest = AtomicU64::new(0);
		let body = parse(json!({
			"jsonrpc": "2.0",
			"id": 3,
			"error": {"code": -32602, "message": "invalid params"}
		}));
		let err = JsonRpcSequentialClient::check_response(&latest, body).unwrap_err();
		assert!(matches!(err, ChainError::Rpc { code: -32602, .. }));
	}

	#[test]
	fn test_missing_account_is_none() {
		let latest = AtomicU64::new(0);
		let body = parse(json!({"jsonrpc": "2.0", "id": 4, "result": null, "diem_ledger_version": 5}));
		assert!(JsonRpcSequentialClient::check_response(&latest, body).unwrap().is_none());
		assert_eq!(latest.load(Ordering::SeqCst), 5);
	}
}
