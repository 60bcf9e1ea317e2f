//! Errors raised by the store and by reconciliation passes, and the streams a pass hands
//! back to its caller.

use crate::chain::ChainError;
use crate::ledger::{InvariantViolation, TransactionMap};
use crate::sync::pass_tracker::PassProgress;

use tokio::sync::{mpsc, watch};

/// Error types for the local ledger store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] rusqlite::Error),

	#[error("corrupt row: {0}")]
	Corrupt(String),

	#[error("background task failed: {0}")]
	Background(String),

	#[error("database mutex poisoned")]
	Poisoned,
}

/// Error types for reconciliation passes
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
	#[error("remote query for {address} failed: {source}")]
	Remote {
		address: String,
		#[source]
		source: ChainError,
	},

	#[error("loading local snapshot failed: {0}")]
	Snapshot(#[source] StoreError),

	#[error("persisting reconciled transactions failed: {0}")]
	Persistence(#[source] StoreError),

	#[error("resolving account addresses failed: {0}")]
	Resolver(#[source] StoreError),

	#[error("no address resolver configured for account-scoped fetch")]
	MissingResolver,

	#[error(transparent)]
	MergeInvariant(#[from] InvariantViolation),

	#[error("reconciliation cancelled")]
	Cancelled,

	#[error("fetch task failed: {0}")]
	TaskFailed(String),
}

/// A view of the caller's transactions published during a pass.
#[derive(Debug, Clone)]
pub enum ReconcileUpdate {
	/// What the local store held when the pass started.
	Local(TransactionMap),
	/// The local view with every remote addition and correction applied.
	Merged(TransactionMap),
}

impl ReconcileUpdate {
	pub fn transactions(&self) -> &TransactionMap {
		match self {
			ReconcileUpdate::Local(map) | ReconcileUpdate::Merged(map) => map,
		}
	}

	pub fn is_merged(&self) -> bool {
		matches!(self, ReconcileUpdate::Merged(_))
	}
}

/// Receiving ends of one reconciliation pass.
///
/// `results` yields the local view and then, if every remote query succeeded, the merged
/// view. `errors` yields at most one error and closes empty once the pass has persisted its
/// changes. An error that arrives after a merged view means the view may not be durably
/// saved yet; it does not mean the view is wrong.
pub struct FetchStreams {
	pub results: mpsc::Receiver<ReconcileUpdate>,
	pub errors: mpsc::Receiver<ReconcileError>,
	pub progress: watch::Receiver<PassProgress>,
}
