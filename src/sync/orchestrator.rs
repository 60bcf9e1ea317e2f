//! Reconciliation engine and the pass it runs for each fetch.
//!
//! This module defines the `ReconciliationEngine`, which keeps the local store of one chain
//! consistent with the remote ledger for a set of addresses. A pass:
//!
//! - loads the local snapshot and publishes it immediately
//! - queries the remote ledger for every address concurrently
//! - folds each address's result into one remote view as it completes
//! - classifies every remote transaction as new, corrected, extended or unchanged
//! - publishes the merged view and persists the new and corrected transactions
//!
//! The engine is written once against [`LedgerStrategy`]; the chain kind only decides how
//! transactions are validated, combined and compared. Remote results are merged by the pass
//! task alone, so no lock guards the remote view.

use crate::chain::LedgerAddress;
use crate::ledger::{ChainId, Comparison, LedgerStrategy, LedgerTransaction, TransactionMap};
use crate::sync::{
    pass_tracker::{PassState, PassTracker},
    query::ChainQuery,
    repositories::{AddressResolver, LedgerStore},
    types::{FetchStreams, ReconcileError, ReconcileUpdate},
};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Local view, then merged view.
const RESULT_CAPACITY: usize = 2;
/// A pass reports at most one error.
const ERROR_CAPACITY: usize = 1;

/// Reconciles the local store of one chain against its remote ledger.
///
/// Cloning is cheap; clones share the strategy, query and store.
#[derive(Clone)]
pub struct ReconciliationEngine {
    strategy: Arc<dyn LedgerStrategy>,
    query: Arc<dyn ChainQuery>,
    store: Arc<dyn LedgerStore>,
    resolver: Option<Arc<dyn AddressResolver>>,
}

impl ReconciliationEngine {
    pub fn new(
        strategy: Arc<dyn LedgerStrategy>,
        query: Arc<dyn ChainQuery>,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            strategy,
            query,
            store,
            resolver: None,
        }
    }

    /// Enable [`fetch_for_account`](Self::fetch_for_account).
    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn chain(&self) -> &ChainId {
        self.strategy.chain()
    }

    /// Start a pass over `addresses` from position `start` and return its streams.
    ///
    /// Returns once the local snapshot is loaded and published; the remote queries, merge and
    /// persistence continue in the background. Cancelling `cancel` stops the remote queries
    /// and the pass then reports [`ReconcileError::Cancelled`].
    pub async fn fetch(&self, cancel: CancellationToken, addresses: Vec<String>, start: u64) -> FetchStreams {
        self.start_pass(cancel, addresses, start, None).await
    }

    /// Resolve the wallet addresses of `account_id` on this chain and start a pass over them.
    ///
    /// Account remarks in the published views are those of `account_id`. Returns the resolved
    /// addresses alongside the streams. A resolver failure is returned directly and no pass
    /// is started.
    pub async fn fetch_for_account(
        &self,
        cancel: CancellationToken,
        account_id: i64,
        start: u64,
    ) -> Result<(FetchStreams, Vec<String>), ReconcileError> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or(ReconcileError::MissingResolver)?;
        let addresses = resolver
            .addresses_for_account(account_id, self.chain())
            .await
            .map_err(ReconcileError::Resolver)?;
        info!(
            "Account {} has {} addresses on {}",
            account_id,
            addresses.len(),
            self.chain()
        );

        let streams = self
            .start_pass(cancel, addresses.clone(), start, Some(account_id))
            .await;
        Ok((streams, addresses))
    }

    async fn start_pass(
        &self,
        cancel: CancellationToken,
        addresses: Vec<String>,
        start: u64,
        viewer: Option<i64>,
    ) -> FetchStreams {
        let (results_tx, results) = mpsc::channel(RESULT_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(ERROR_CAPACITY);
        let (tracker, progress) = PassTracker::new(addresses.len());
        info!(
            "Reconciling {} addresses on {} from {}",
            addresses.len(),
            self.chain(),
            start
        );

        let mut pass = Pass {
            engine: self.clone(),
            cancel,
            addresses,
            start,
            viewer,
            tracker,
            results: Some(results_tx),
            errors: errors_tx,
        };
        match pass.load_local().await {
            Ok(local) => {
                tokio::spawn(pass.reconcile(local));
            }
            Err(e) => pass.abort(e).await,
        }

        FetchStreams {
            results,
            errors,
            progress,
        }
    }
}

/// Transactions the store must write once the merged view is published.
#[derive(Default)]
struct Delta {
    new: Vec<LedgerTransaction>,
    changed: Vec<LedgerTransaction>,
}

/// State of one running pass. Owned by the pass task.
struct Pass {
    engine: ReconciliationEngine,
    cancel: CancellationToken,
    addresses: Vec<String>,
    start: u64,
    viewer: Option<i64>,
    tracker: PassTracker,
    /// Dropped after the merged view is sent so callers see the stream end.
    results: Option<mpsc::Sender<ReconcileUpdate>>,
    errors: mpsc::Sender<ReconcileError>,
}

impl Pass {
    /// Rewrite every address into the canonical spelling stored locally and sent to the
    /// remote, so the snapshot and the queries select the same transactions.
    fn canonicalize_addresses(&mut self) -> Result<(), ReconcileError> {
        let kind = self.engine.strategy.kind();
        for address in self.addresses.iter_mut() {
            let decoded = LedgerAddress::decode(kind, address).map_err(|source| ReconcileError::Remote {
                address: address.clone(),
                source,
            })?;
            *address = decoded.canonical();
        }
        Ok(())
    }

    async fn load_local(&mut self) -> Result<TransactionMap, ReconcileError> {
        self.canonicalize_addresses()?;
        let local = self
            .engine
            .store
            .snapshot(self.engine.chain(), &self.addresses, self.start, self.viewer)
            .await
            .map_err(ReconcileError::Snapshot)?;
        self.tracker.record_local(local.len());
        self.tracker.advance(PassState::LocalLoaded);
        self.publish(ReconcileUpdate::Local(local.clone())).await;
        Ok(local)
    }

    async fn reconcile(mut self, local: TransactionMap) {
        if let Err(e) = self.merge_and_persist(local).await {
            self.abort(e).await;
        }
    }

    async fn merge_and_persist(&mut self, mut local: TransactionMap) -> Result<(), ReconcileError> {
        self.tracker.advance(PassState::Fetching);
        let remote = self.fetch_remote().await?;
        self.tracker.record_remote(remote.len());

        let delta = self.merge(&mut local, remote);
        self.tracker.advance(PassState::Merged);
        self.publish(ReconcileUpdate::Merged(local)).await;
        self.results = None;

        self.tracker.advance(PassState::Persisting);
        self.persist(delta).await?;
        self.tracker.succeed();
        Ok(())
    }

    async fn abort(&mut self, e: ReconcileError) {
        error!("Reconciliation on {} failed: {}", self.engine.chain(), e);
        self.tracker.fail();
        if self.errors.send(e).await.is_err() {
            debug!("Caller dropped the error stream");
        }
    }

    async fn publish(&self, update: ReconcileUpdate) {
        if let Some(results) = &self.results {
            if results.send(update).await.is_err() {
                debug!("Caller dropped the result stream");
            }
        }
    }

    /// Query every address concurrently and fold the results into one view.
    ///
    /// The first failure cancels the remaining queries and waits for them to stop.
    async fn fetch_remote(&self) -> Result<TransactionMap, ReconcileError> {
        let group = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        for address in self.addresses.iter().cloned() {
            let query = Arc::clone(&self.engine.query);
            let token = group.clone();
            let start = self.start;
            tasks.spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(ReconcileError::Cancelled),
                    result = query.fetch_since(&address, start) => {
                        result.map_err(|source| ReconcileError::Remote {
                            address: address.clone(),
                            source,
                        })
                    }
                }
            });
        }

        let mut remote = TransactionMap::new();
        let outcome = loop {
            let Some(joined) = tasks.join_next().await else {
                break Ok(());
            };
            let partial = match joined {
                Ok(Ok(partial)) => partial,
                Ok(Err(e)) => break Err(e),
                Err(e) => break Err(ReconcileError::TaskFailed(e.to_string())),
            };
            if let Err(e) = self.absorb(&mut remote, partial) {
                break Err(e);
            }
        };

        if let Err(e) = outcome {
            group.cancel();
            tasks.shutdown().await;
            return Err(e);
        }
        Ok(remote)
    }

    /// Fold one address's result into the remote view. A transaction seen from several
    /// addresses keeps the events of every sighting.
    fn absorb(
        &self,
        remote: &mut TransactionMap,
        partial: TransactionMap,
    ) -> Result<(), ReconcileError> {
        let strategy = &self.engine.strategy;
        for (_, mut tx) in partial {
            if let LedgerTransaction::Block(block) = &mut tx {
                block.normalize_log_indexes();
            }
            let identity = strategy.identity_of(&tx)?;
            if let Some(seen) = remote.get(&identity) {
                strategy.merge_events(seen, &mut tx);
            }
            remote.insert(identity, tx);
        }
        Ok(())
    }

    /// Apply `remote` to `local` and return what must be written.
    fn merge(&mut self, local: &mut TransactionMap, remote: TransactionMap) -> Delta {
        let strategy = &self.engine.strategy;
        let mut delta = Delta::default();

        for (identity, mut tx) in remote {
            match local.get(&identity) {
                None => {
                    self.tracker.record_stored(identity.clone());
                    delta.new.push(tx.clone());
                    local.insert(identity, tx);
                }
                Some(existing) => match strategy.compare(existing, &tx) {
                    Comparison::Unchanged => self.tracker.record_unchanged(),
                    comparison @ (Comparison::Changed | Comparison::Extended) => {
                        debug!("Local copy of {} is {:?}", identity, comparison);
                        strategy.merge_events(existing, &mut tx);
                        *tx.annotations_mut() = existing.annotations().clone();
                        self.tracker.record_replaced(identity.clone());
                        delta.changed.push(tx.clone());
                        local.insert(identity, tx);
                    }
                },
            }
        }

        delta
    }

    async fn persist(&self, delta: Delta) -> Result<(), ReconcileError> {
        let store = &self.engine.store;
        store
            .store_new(delta.new)
            .await
            .map_err(ReconcileError::Persistence)?;
        store
            .replace_changed(delta.changed)
            .await
            .map_err(ReconcileError::Persistence)
    }
}
