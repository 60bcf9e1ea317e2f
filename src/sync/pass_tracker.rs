//! Progress tracking for reconciliation passes.
//!
//! This module provides the `PassTracker`, which moves a pass through its lifecycle and counts
//! what the merge decided for each remote transaction. Every change is published on a watch
//! channel so callers can observe a pass without consuming its result stream.
//!
//! A pass moves `Idle → LocalLoaded → Fetching → Merged → Persisting → Done(Success)`. Any
//! state before `Done` may instead move straight to `Done(Failed)`.

use crate::ledger::TransactionIdentity;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Terminal outcome of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Success,
    Failed,
}

/// Lifecycle state of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    LocalLoaded,
    Fetching,
    Merged,
    Persisting,
    Done(PassOutcome),
}

impl PassState {
    pub fn is_done(&self) -> bool {
        matches!(self, PassState::Done(_))
    }

    /// Whether a pass in this state may move to `next`.
    pub fn can_advance_to(&self, next: PassState) -> bool {
        match (self, next) {
            (PassState::Done(_), _) => false,
            (_, PassState::Done(PassOutcome::Failed)) => true,
            (PassState::Idle, PassState::LocalLoaded)
            | (PassState::LocalLoaded, PassState::Fetching)
            | (PassState::Fetching, PassState::Merged)
            | (PassState::Merged, PassState::Persisting)
            | (PassState::Persisting, PassState::Done(PassOutcome::Success)) => true,
            _ => false,
        }
    }
}

/// Counts and identities recorded during a pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub addresses: usize,
    pub local_transactions: usize,
    pub remote_transactions: usize,
    /// Identities absent locally, handed to `store_new`.
    pub stored: Vec<TransactionIdentity>,
    /// Identities whose local copy was corrected or extended, handed to `replace_changed`.
    pub replaced: Vec<TransactionIdentity>,
    pub unchanged: usize,
    pub elapsed: Duration,
}

impl PassStats {
    /// Get a human-readable summary of the pass statistics
    pub fn summary(&self) -> String {
        format!(
            "{} addresses: {} local, {} remote, {} new, {} replaced, {} unchanged in {:?}",
            self.addresses,
            self.local_transactions,
            self.remote_transactions,
            self.stored.len(),
            self.replaced.len(),
            self.unchanged,
            self.elapsed
        )
    }
}

/// Snapshot published on every state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassProgress {
    pub state: PassState,
    pub stats: PassStats,
}

/// Service for tracking one reconciliation pass
#[derive(Debug)]
pub struct PassTracker {
    progress: watch::Sender<PassProgress>,
    stats: PassStats,
    state: PassState,
    started: Instant,
}

impl PassTracker {
    /// Create a tracker for a pass over `addresses` addresses, along with the receiver that
    /// observes it.
    pub fn new(addresses: usize) -> (Self, watch::Receiver<PassProgress>) {
        let stats = PassStats {
            addresses,
            ..PassStats::default()
        };
        let (progress, receiver) = watch::channel(PassProgress {
            state: PassState::Idle,
            stats: stats.clone(),
        });
        let tracker = Self {
            progress,
            stats,
            state: PassState::Idle,
            started: Instant::now(),
        };
        (tracker, receiver)
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    /// Move to `next` and publish it. Transitions out of order are ignored.
    pub fn advance(&mut self, next: PassState) {
        if !self.state.can_advance_to(next) {
            warn!("Ignoring pass transition {:?} -> {:?}", self.state, next);
            return;
        }
        debug!("Pass transition {:?} -> {:?}", self.state, next);
        self.state = next;
        if next.is_done() {
            self.stats.elapsed = self.started.elapsed();
        }
        self.progress.send_replace(PassProgress {
            state: next,
            stats: self.stats.clone(),
        });
    }

    pub fn fail(&mut self) {
        self.advance(PassState::Done(PassOutcome::Failed));
    }

    pub fn succeed(&mut self) {
        self.advance(PassState::Done(PassOutcome::Success));
        info!("Reconciliation pass finished: {}", self.stats.summary());
    }

    pub fn record_local(&mut self, count: usize) {
        self.stats.local_transactions = count;
    }

    pub fn record_remote(&mut self, count: usize) {
        self.stats.remote_transactions = count;
    }

    pub fn record_stored(&mut self, identity: TransactionIdentity) {
        self.stats.stored.push(identity);
    }

    pub fn record_replaced(&mut self, identity: TransactionIdentity) {
        self.stats.replaced.push(identity);
    }

    pub fn record_unchanged(&mut self) {
        self.stats.unchanged += 1;
    }
}
