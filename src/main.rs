use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use wallet_ledger_sync::chain::{ExplorerBlockClient, JsonRpcSequentialClient, LedgerAddress};
use wallet_ledger_sync::config::AppConfig;
use wallet_ledger_sync::ledger::{
	BlockStrategy, ChainId, LedgerKind, LedgerTransaction, SequentialStrategy,
};
use wallet_ledger_sync::sync::{
	BlockQuery, FetchStreams, ReconcileUpdate, ReconciliationEngine, SequentialQuery,
	SqliteLedgerStore,
};
use wallet_ledger_sync::utils::{format_token_amount, token_decimals};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Ledger sync failed: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), BoxError> {
	let config = AppConfig::from_env();
	let addresses: Vec<String> = std::env::args().skip(1).collect();
	if addresses.is_empty() {
		warn!("No addresses given. Usage: wallet-ledger-sync <address>...");
		return Ok(());
	}

	let store = Arc::new(SqliteLedgerStore::open(&config.db_path)?);
	let mut engines = Vec::new();

	if let Some(endpoint) = &config.sequential {
		let chain = ChainId::new(&endpoint.chain_id);
		let client = JsonRpcSequentialClient::new(endpoint.url.clone(), config.reconcile.http_timeout)?;
		let query = SequentialQuery::new(Arc::new(client), chain.clone(), config.reconcile.clone());
		info!("Reconciling sequential ledger {} via {}", chain, endpoint.url);
		engines.push((
			LedgerKind::Sequential,
			ReconciliationEngine::new(
				Arc::new(SequentialStrategy::new(chain)),
				Arc::new(query),
				store.clone(),
			),
		));
	}

	if let Some(endpoint) = &config.block {
		let chain = ChainId::new(&endpoint.chain_id);
		let client = ExplorerBlockClient::new(endpoint.url.clone(), config.reconcile.http_timeout)?;
		let query = BlockQuery::new(Arc::new(client), chain.clone(), config.reconcile.clone());
		info!("Reconciling block ledger {} via {}", chain, endpoint.url);
		engines.push((
			LedgerKind::Block,
			ReconciliationEngine::new(
				Arc::new(BlockStrategy::new(chain)),
				Arc::new(query),
				store.clone(),
			),
		));
	}

	if engines.is_empty() {
		warn!("No chain configured. Set SEQUENTIAL_RPC_URL or BLOCK_EXPLORER_URL");
		return Ok(());
	}

	let cancel = CancellationToken::new();
	for (kind, engine) in &engines {
		// Each address goes to the chains whose address format it matches.
		let owned: Vec<String> = addresses
			.iter()
			.filter(|address| LedgerAddress::decode(*kind, address).is_ok())
			.cloned()
			.collect();
		if owned.is_empty() {
			continue;
		}

		let streams = engine
			.fetch(cancel.child_token(), owned, config.start_offset)
			.await;
		report(*kind, engine.chain(), streams).await;
	}

	Ok(())
}

async fn report(kind: LedgerKind, chain: &ChainId, streams: FetchStreams) {
	let FetchStreams {
		mut results,
		mut errors,
		progress,
	} = streams;

	while let Some(update) = results.recv().await {
		match update {
			ReconcileUpdate::Local(local) => {
				info!("{}: {} transactions stored locally", chain, local.len());
			}
			ReconcileUpdate::Merged(merged) => {
				info!("{}: {} transactions after reconciliation", chain, merged.len());
				for tx in merged.values() {
					info!("  {}", describe(kind, tx));
				}
			}
		}
	}

	while let Some(e) = errors.recv().await {
		error!("{}: {}", chain, e);
	}

	let progress = progress.borrow().clone();
	info!("{}: {:?} {}", chain, progress.state, progress.stats.summary());
}

fn describe(kind: LedgerKind, tx: &LedgerTransaction) -> String {
	let decimals = token_decimals(kind);
	match tx {
		LedgerTransaction::Sequential(tx) => format!(
			"{} {} {} from {} to {} [{}]",
			tx.identity,
			format_token_amount(&tx.transfer.amount, decimals),
			tx.transfer.currency,
			tx.transfer.from,
			tx.transfer.to,
			tx.status
		),
		LedgerTransaction::Block(tx) => {
			let events: Vec<String> = tx
				.transfer_events
				.values()
				.map(|e| {
					format!(
						"#{} {} {} from {} to {}",
						e.log_index,
						format_token_amount(&e.amount, decimals),
						e.currency,
						e.from,
						e.to
					)
				})
				.collect();
			format!("{} [{}] {}", tx.identity, tx.status, events.join("; "))
		}
	}
}
