//!
//! Bounded retry for stale responses from load-balanced ledger nodes.
//!
//! A node that lags behind the rest of the cluster answers with data older than what the
//! client has already seen. Asking again usually lands on a fresher node, so these responses
//! are retried with exponential backoff up to a fixed number of attempts.

use crate::chain::types::ChainError;
use crate::config::RetryConfig;
use backoff::future::retry;
use std::future::Future;
use tracing::warn;

/// Run `operation`, retrying it while it fails with [`ChainError::StaleResponse`].
///
/// Every other error is returned as soon as it occurs. Once `policy.max_attempts` attempts
/// have all been stale, the call fails with [`ChainError::StaleRetriesExhausted`].
pub async fn retry_stale<T, F, Fut>(
	policy: &RetryConfig,
	what: &str,
	mut operation: F,
) -> Result<T, ChainError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, ChainError>>,
{
	let max_attempts = policy.max_attempts.max(1);
	let mut attempts = 0u32;

	retry(policy.backoff(), || {
		attempts += 1;
		let attempt = attempts;
		let call = operation();
		async move {
			match call.await {
				Ok(value) => Ok(value),
				Err(e) if e.is_stale() => {
					if attempt >= max_attempts {
						return Err(backoff::Error::permanent(ChainError::StaleRetriesExhausted {
							attempts: attempt,
						}));
					}
					warn!("{} got a stale response on attempt {}: {}", what, attempt, e);
					Err(backoff::Error::transient(e))
				}
				Err(e) => Err(backoff::Error::permanent(e)),
			}
		}
	})
	.await
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::time::Duration;

	fn fast_policy(max_attempts: u32) -> RetryConfig {
		RetryConfig {
			max_attempts,
			initial_interval: Duration::from_millis(1),
			max_interval: Duration::from_millis(2),
			multiplier: 1.5,
		}
	}

	fn stale() -> ChainError {
		ChainError::StaleResponse { seen: 1, latest: 2 }
	}

	#[tokio::test]
	async fn test_recovers_after_stale_responses() {
		let counter = AtomicU32::new(0);
		let calls = &counter;
		let result = retry_stale(&fast_policy(5), "get_account", move || async move {
			if calls.fetch_add(1, Ordering::SeqCst) < 2 {
				Err(stale())
			} else {
				Ok(7u64)
			}
		})
		.await;

		assert_eq!(result.unwrap(), 7);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_gives_up_after_max_attempts() {
		let counter = AtomicU32::new(0);
		let calls = &counter;
		let result: Result<(), _> = retry_stale(&fast_policy(3), "get_account", move || async move {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(stale())
		})
		.await;

		assert!(matches!(
			result,
			Err(ChainError::StaleRetriesExhausted { attempts: 3 })
		));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_other_errors_are_not_retried() {
		let counter = AtomicU32::new(0);
		let calls = &counter;
		let result: Result<(), _> = retry_stale(&fast_policy(5), "get_events", move || async move {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(ChainError::NoData)
		})
		.await;

		assert!(matches!(result, Err(ChainError::NoData)));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
