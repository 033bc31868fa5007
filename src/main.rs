use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use perp_mirror::config::Config;
use perp_mirror::exchange::hyperliquid::MasterWebSocket;
use perp_mirror::exchange::{
    BinanceClient, FollowerExchange, FollowerUserStream, HyperliquidClient, MasterData,
};
use perp_mirror::persistence::{KvStore, SqliteStore};
use perp_mirror::risk::RiskGate;
use perp_mirror::state::{DeltaLedger, OrderMapper, OrphanFills, ProcessedJournal};
use perp_mirror::sync::{
    ExposureRebalancer, OrderExecutor, OrderValidator, PositionCalculator, Reconciler,
};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Perp Mirror v{}", env!("CARGO_PKG_VERSION"));

    // Configuration and credential problems are fatal before anything runs.
    let config = Config::load()?;
    config.validate()?;
    info!(
        mode = ?config.sizing.mode,
        followed_users = config.master.followed_users.len(),
        instruments = config.instruments.len(),
        "Configuration loaded"
    );

    let sqlite = SqliteStore::open(&config.store.path)?;
    sqlite.purge_expired()?;
    let store: Arc<dyn KvStore> = Arc::new(sqlite);

    let binance = Arc::new(BinanceClient::new(&config.binance)?);
    let master_client = Arc::new(HyperliquidClient::new(&config.master.api_url)?);

    // A signed no-op proves the key works before any subscription starts,
    // and one-way position mode is a hard invariant of the mirror account.
    binance
        .total_margin_balance()
        .await
        .context("Follower credential validation failed")?;
    binance
        .set_one_way_mode()
        .await
        .context("Failed to assert one-way position mode")?;

    let follower: Arc<dyn FollowerExchange> = binance.clone();
    let master: Arc<dyn MasterData> = master_client.clone();

    let mapper = Arc::new(OrderMapper::new(store.clone()));
    let ledger = Arc::new(DeltaLedger::new(store.clone()));
    let journal = Arc::new(ProcessedJournal::new(store.clone()));
    let orphans = Arc::new(OrphanFills::new(store.clone()));
    let calculator = Arc::new(PositionCalculator::new(
        &config,
        follower.clone(),
        master.clone(),
    ));
    let risk = Arc::new(RiskGate::new(&config));
    let rebalancer = Arc::new(ExposureRebalancer::new(
        &config,
        store.clone(),
        follower.clone(),
        master.clone(),
    ));
    let executor = Arc::new(OrderExecutor::new(
        &config,
        store.clone(),
        mapper.clone(),
        ledger.clone(),
        journal.clone(),
        orphans.clone(),
        calculator.clone(),
        risk,
        follower.clone(),
        rebalancer,
    ));
    let reconciler = Arc::new(Reconciler::new(
        &config,
        mapper.clone(),
        ledger.clone(),
        journal,
        orphans,
        calculator,
        executor.clone(),
        follower.clone(),
        master.clone(),
    ));
    let validator = Arc::new(OrderValidator::new(&config, mapper, follower));

    reconciler
        .init_ledger()
        .await
        .context("Failed to seed the delta ledger from the Master snapshot")?;

    let (event_tx, mut event_rx) = mpsc::channel(1024);
    let (connected_tx, mut connected_rx) = mpsc::channel(4);
    let (report_tx, mut report_rx) = mpsc::channel(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    // Master ingest: classified events into the executor queue.
    let master_ws = MasterWebSocket::new(
        config.master.ws_url.clone(),
        config.master.followed_users.clone(),
    );
    let ws_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        master_ws.run(event_tx, connected_tx, ws_shutdown).await;
    }));

    // Follower execution reports.
    let follower_stream = FollowerUserStream::new(config.binance.testnet, binance.clone());
    let stream_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        follower_stream.run(report_tx, stream_shutdown).await;
    }));

    // Executor loop: drains naturally once the ingest task stops.
    let event_executor = executor.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            event_executor.handle_event(event).await;
        }
    }));

    // Reconcile after every successful stream open; the snapshot pass
    // supersedes anything lost in a reconnect gap.
    let connect_reconciler = reconciler.clone();
    tasks.push(tokio::spawn(async move {
        while connected_rx.recv().await.is_some() {
            if let Err(e) = connect_reconciler.startup().await {
                warn!(error = %e, "Snapshot reconciliation failed");
            }
        }
    }));

    // Orphan-fill coordination from Follower execution reports.
    let report_reconciler = reconciler.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            if let Err(e) = report_reconciler.handle_execution_report(&report).await {
                warn!(error = %e, "Execution report handling failed");
            }
        }
    }));

    // Background mapping reaper.
    let validator_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        validator.run(validator_shutdown).await;
    }));

    info!("Perp Mirror initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
        warn!("Drain deadline exceeded, exiting with tasks in flight");
    }

    info!("Perp Mirror stopped");
    Ok(())
}
