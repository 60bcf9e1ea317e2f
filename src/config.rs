//!
//! Configuration for reconciliation passes and the binary that drives them.
//!
//! Library callers build a [`ReconcileConfig`] directly (every field has a default). The binary
//! reads [`AppConfig`] from the environment.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy for transient "stale response" conditions from a remote node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
	/// Total attempts, the first one included.
	pub max_attempts: u32,
	/// Delay before the second attempt.
	pub initial_interval: Duration,
	/// Upper bound on the delay between attempts.
	pub max_interval: Duration,
	/// Growth factor applied to the delay after each attempt.
	pub multiplier: f64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_interval: Duration::from_millis(100),
			max_interval: Duration::from_secs(2),
			multiplier: 2.0,
		}
	}
}

impl RetryConfig {
	/// Backoff schedule for this policy. Attempts, not elapsed time, bound the retries.
	pub fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial_interval)
			.with_max_interval(self.max_interval)
			.with_multiplier(self.multiplier)
			.with_max_elapsed_time(None)
			.build()
	}
}

/// Tuning for the chain query adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
	/// Concurrent detail requests issued by one adapter call.
	pub fetch_concurrency: usize,
	/// Rows requested per page from a paginated transfer-log index.
	pub page_size: u32,
	/// Timeout applied to every HTTP request.
	pub http_timeout: Duration,
	pub retry: RetryConfig,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		Self {
			fetch_concurrency: 8,
			page_size: 1000,
			http_timeout: Duration::from_secs(30),
			retry: RetryConfig::default(),
		}
	}
}

/// Remote endpoint of one configured chain.
#[derive(Debug, Clone)]
pub struct ChainEndpoint {
	pub chain_id: String,
	pub url: String,
}

/// Settings of the `wallet-ledger-sync` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
	pub db_path: PathBuf,
	pub sequential: Option<ChainEndpoint>,
	pub block: Option<ChainEndpoint>,
	pub start_offset: u64,
	pub reconcile: ReconcileConfig,
}

impl AppConfig {
	/// Read the configuration from environment variables.
	///
	/// A chain is enabled when its URL variable is set. Unparseable numbers fall back to the
	/// defaults.
	pub fn from_env() -> Self {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Build the configuration from any key lookup; `from_env` passes the process environment.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
		let mut reconcile = ReconcileConfig::default();
		if let Some(n) = lookup("FETCH_CONCURRENCY").and_then(|v| v.parse().ok()) {
			reconcile.fetch_concurrency = n;
		}
		if let Some(n) = lookup("STALE_RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
			reconcile.retry.max_attempts = n;
		}

		let endpoint = |id_key: &str, default_id: &str, url_key: &str| {
			lookup(url_key).map(|url| ChainEndpoint {
				chain_id: lookup(id_key).unwrap_or_else(|| default_id.to_string()),
				url,
			})
		};

		Self {
			db_path: lookup("LEDGER_DB_PATH")
				.map(PathBuf::from)
				.unwrap_or_else(|| PathBuf::from("ledger.sqlite3")),
			sequential: endpoint("SEQUENTIAL_CHAIN_ID", "diem", "SEQUENTIAL_RPC_URL"),
			block: endpoint("BLOCK_CHAIN_ID", "celo", "BLOCK_EXPLORER_URL"),
			start_offset: lookup("START_OFFSET")
				.and_then(|v| v.parse().ok())
				.unwrap_or(0),
			reconcile,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn test_from_lookup() {
		let vars: HashMap<&str, &str> = HashMap::from([
			("LEDGER_DB_PATH", "/tmp/ledger.db"),
			("SEQUENTIAL_RPC_URL", "http://localhost:8080"),
			("FETCH_CONCURRENCY", "3"),
			("STALE_RETRY_ATTEMPTS", "not-a-number"),
			("START_OFFSET", "42"),
		]);
		let config = AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

		assert_eq!(config.db_path, PathBuf::from("/tmp/ledger.db"));
		let sequential = config.sequential.expect("sequential chain enabled");
		assert_eq!(sequential.chain_id, "diem");
		assert_eq!(sequential.url, "http://localhost:8080");
		assert!(config.block.is_none());
		assert_eq!(config.start_offset, 42);
		assert_eq!(config.reconcile.fetch_concurrency, 3);
		assert_eq!(config.reconcile.retry.max_attempts, RetryConfig::default().max_attempts);
	}

	#[test]
	fn test_backoff_has_no_elapsed_limit() {
		let backoff = RetryConfig::default().backoff();
		assert!(backoff.max_elapsed_time.is_none());
		assert_eq!(backoff.initial_interval, Duration::from_millis(100));
	}
}
