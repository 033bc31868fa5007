//! Snapshot reconciliation and cross-stream fill coordination.
//!
//! Runs once after every stream (re)connect: fuses the Master's open-order
//! snapshot with the Follower's to recover lost mappings, replays orders
//! that were never mirrored, and prunes zombies left by crash windows. Also
//! consumes Follower execution reports, recording orphan fills when the
//! Follower moves ahead of the Master's own fill notification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::{Config, InstrumentConfig};
use crate::exchange::hyperliquid::{MasterOpenOrder, MasterOrderEvent, MasterOrderStatus};
use crate::exchange::{
    futures_symbol, ExecutionReport, FollowerExchange, MasterData, OpenOrder, OrderStatus,
};
use crate::state::{
    DeltaLedger, ExecutionOutcome, JournalRecord, OrderMapper, OrphanFill, OrphanFills,
    ProcessedJournal,
};
use crate::sync::calculator::PositionCalculator;
use crate::sync::executor::OrderExecutor;
use crate::utils::decimal::{prices_match, signed, snap_to_tick};

pub struct Reconciler {
    mapper: Arc<OrderMapper>,
    ledger: Arc<DeltaLedger>,
    journal: Arc<ProcessedJournal>,
    orphans: Arc<OrphanFills>,
    calculator: Arc<PositionCalculator>,
    executor: Arc<OrderExecutor>,
    follower: Arc<dyn FollowerExchange>,
    master: Arc<dyn MasterData>,
    instruments: HashMap<String, InstrumentConfig>,
    master_accounts: Vec<String>,
    price_match_tolerance: Decimal,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        mapper: Arc<OrderMapper>,
        ledger: Arc<DeltaLedger>,
        journal: Arc<ProcessedJournal>,
        orphans: Arc<OrphanFills>,
        calculator: Arc<PositionCalculator>,
        executor: Arc<OrderExecutor>,
        follower: Arc<dyn FollowerExchange>,
        master: Arc<dyn MasterData>,
    ) -> Self {
        Self {
            mapper,
            ledger,
            journal,
            orphans,
            calculator,
            executor,
            follower,
            master,
            instruments: config.instruments.clone(),
            master_accounts: config.master.followed_users.clone(),
            price_match_tolerance: config.engine.price_match_tolerance,
        }
    }

    /// Seed the delta ledger for instruments that carry no persisted entry:
    /// the Follower starts empty, so the delta equals the Master position.
    /// Restarts must not clobber accumulated state.
    pub async fn init_ledger(&self) -> Result<()> {
        for coin in self.instruments.keys() {
            if self.ledger.is_initialized(coin).await? {
                continue;
            }
            let mut position = Decimal::ZERO;
            for account in &self.master_accounts {
                position += self
                    .master
                    .clearinghouse_state(account)
                    .await?
                    .signed_position(coin);
            }
            self.ledger.init(coin, position).await?;
            info!(%coin, %position, "Seeded delta ledger from Master position");
        }
        Ok(())
    }

    /// Snapshot reconciliation. Idempotent: a second run over the same
    /// venue state changes nothing.
    pub async fn startup(&self) -> Result<()> {
        info!("Snapshot reconciliation: begin");

        let mut follower_orders: HashMap<String, Vec<OpenOrder>> = HashMap::new();
        for coin in self.instruments.keys() {
            let orders = self.follower.open_orders(&futures_symbol(coin)).await?;
            follower_orders.insert(coin.clone(), orders);
        }
        let follower_ids: HashSet<i64> = follower_orders
            .values()
            .flatten()
            .map(|o| o.order_id)
            .collect();

        let mut master_oids: HashSet<u64> = HashSet::new();
        for account in &self.master_accounts {
            for order in self.master.open_orders(account).await? {
                if !self.instruments.contains_key(&order.coin) {
                    continue;
                }
                master_oids.insert(order.oid);
                self.reconcile_master_order(account, &order, &follower_orders, &follower_ids)
                    .await?;
            }
        }

        // Mapped Follower orders whose Master side is gone are zombies from
        // a crash window; cancel them.
        for (coin, orders) in &follower_orders {
            let symbol = futures_symbol(coin);
            for order in orders {
                let Some(oid) = self.mapper.lookup_master(order.order_id).await? else {
                    continue;
                };
                if !master_oids.contains(&oid) {
                    info!(
                        oid,
                        follower_order_id = order.order_id,
                        "Canceling zombie follower order"
                    );
                    self.follower.cancel_order(&symbol, order.order_id).await?;
                    self.mapper.delete(oid).await?;
                }
            }
        }

        info!("Snapshot reconciliation: complete");
        Ok(())
    }

    async fn reconcile_master_order(
        &self,
        account: &str,
        order: &MasterOpenOrder,
        follower_orders: &HashMap<String, Vec<OpenOrder>>,
        follower_ids: &HashSet<i64>,
    ) -> Result<()> {
        if let Some(mapping) = self.mapper.lookup_follower(order.oid).await? {
            if follower_ids.contains(&mapping.follower_order_id) {
                debug!(oid = order.oid, "Mapping already in sync");
                return Ok(());
            }
            // The bound Follower order vanished; drop the stale binding and
            // fall through to recovery.
            self.mapper.delete(order.oid).await?;
        }

        let instrument = &self.instruments[&order.coin];
        let side = order.side.to_order_side();
        let target_price = snap_to_tick(order.limit_px, instrument.price_tick);

        if let Some(candidates) = follower_orders.get(&order.coin) {
            for candidate in candidates {
                if candidate.side != side
                    || !prices_match(candidate.price, target_price, self.price_match_tolerance)
                {
                    continue;
                }
                if self.mapper.lookup_master(candidate.order_id).await?.is_some() {
                    continue;
                }
                self.mapper
                    .save(order.oid, candidate.order_id, &order.coin)
                    .await?;
                self.journal
                    .record(
                        &order.oid.to_string(),
                        &JournalRecord::executed(
                            ExecutionOutcome::Recovered,
                            candidate.order_id,
                            signed(order.sz, side.is_buy()),
                            candidate.orig_qty,
                            target_price,
                        ),
                    )
                    .await?;
                info!(
                    oid = order.oid,
                    follower_order_id = candidate.order_id,
                    "Recovered mapping by price-side match"
                );
                return Ok(());
            }
        }

        // Never mirrored: execute as a fresh open.
        let event = MasterOrderEvent {
            oid: order.oid,
            coin: order.coin.clone(),
            side,
            price: order.limit_px,
            size: order.sz,
            status: MasterOrderStatus::Open,
            reduce_only: order.reduce_only,
            timestamp: order.timestamp,
            account: account.to_string(),
        };
        self.executor.handle_open(&event).await
    }

    /// Consume a Follower execution report.
    ///
    /// A fill on a mapped order means the Follower moved ahead of the
    /// Master's fill notification: record an orphan and pre-credit the
    /// expected Master-side fill so it is not double-counted when the
    /// Master's Filled event arrives. Terminal no-fill statuses release the
    /// mapping eagerly.
    pub async fn handle_execution_report(&self, report: &ExecutionReport) -> Result<()> {
        let Some(oid) = self.mapper.lookup_master(report.order_id).await? else {
            return Ok(());
        };

        match report.status {
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                if report.last_fill_qty <= Decimal::ZERO {
                    return Ok(());
                }
                let Some(mapping) = self.mapper.lookup_follower(oid).await? else {
                    return Ok(());
                };
                let equivalent = self
                    .calculator
                    .master_equivalent(&mapping.instrument, report.last_fill_qty)
                    .await?;
                let signed_equivalent = signed(equivalent, report.side.is_buy());
                self.orphans
                    .accumulate(
                        oid,
                        OrphanFill {
                            instrument: mapping.instrument.clone(),
                            side: report.side,
                            follower_size: report.last_fill_qty,
                            master_size_equivalent: signed_equivalent,
                            follower_order_id: report.order_id,
                            observed_at: Utc::now(),
                        },
                    )
                    .await?;
                self.ledger
                    .add(&mapping.instrument, -signed_equivalent)
                    .await?;
                info!(
                    oid,
                    follower_order_id = report.order_id,
                    fill = %report.last_fill_qty,
                    equivalent = %signed_equivalent,
                    "Recorded orphan fill"
                );
            }
            OrderStatus::Canceled
            | OrderStatus::Expired
            | OrderStatus::Rejected
            | OrderStatus::ExpiredInMatch => {
                self.mapper.delete(oid).await?;
                debug!(oid, status = ?report.status, "Released mapping on terminal report");
            }
            OrderStatus::New => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;
    use crate::exchange::mock::{master_open_order, MockFollower, MockMaster};
    use crate::exchange::OrderSide;
    use crate::persistence::{KvStore, MemoryStore};
    use crate::risk::RiskGate;
    use crate::sync::rebalancer::ExposureRebalancer;
    use rust_decimal_macros::dec;

    struct Harness {
        reconciler: Reconciler,
        follower: Arc<MockFollower>,
        master: Arc<MockMaster>,
        mapper: Arc<OrderMapper>,
        ledger: Arc<DeltaLedger>,
        journal: Arc<ProcessedJournal>,
        orphans: Arc<OrphanFills>,
    }

    fn harness() -> Harness {
        let config = test_config();
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let follower = Arc::new(MockFollower::new());
        let master = Arc::new(MockMaster::new());
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
            store,
            mapper.clone(),
            ledger.clone(),
            journal.clone(),
            orphans.clone(),
            calculator.clone(),
            risk,
            follower.clone(),
            rebalancer,
        ));
        let reconciler = Reconciler::new(
            &config,
            mapper.clone(),
            ledger.clone(),
            journal.clone(),
            orphans.clone(),
            calculator,
            executor,
            follower.clone(),
            master.clone(),
        );
        Harness {
            reconciler,
            follower,
            master,
            mapper,
            ledger,
            journal,
            orphans,
        }
    }

    #[tokio::test]
    async fn test_price_side_match_recovers_mapping() {
        let h = harness();
        h.master
            .set_open_orders(vec![master_open_order(
                1,
                "BTC",
                OrderSide::Buy,
                dec!(30000.0),
                dec!(0.02),
            )])
            .await;
        // The mirrored order survived the restart; the mapping did not.
        h.follower
            .add_open_order(1001, "BTCUSDT", OrderSide::Buy, dec!(30000.0), dec!(0.002), false)
            .await;

        h.reconciler.startup().await.unwrap();

        let mapping = h.mapper.lookup_follower(1).await.unwrap().unwrap();
        assert_eq!(mapping.follower_order_id, 1001);
        assert!(h.follower.placed_orders().await.is_empty());
        assert_eq!(
            h.journal.get("1").await.unwrap().unwrap().outcome,
            ExecutionOutcome::Recovered
        );
    }

    #[tokio::test]
    async fn test_synced_mapping_left_alone() {
        let h = harness();
        h.master
            .set_open_orders(vec![master_open_order(
                1,
                "BTC",
                OrderSide::Buy,
                dec!(30000.0),
                dec!(0.02),
            )])
            .await;
        h.follower
            .add_open_order(1001, "BTCUSDT", OrderSide::Buy, dec!(30000.0), dec!(0.002), false)
            .await;
        h.mapper.save(1, 1001, "BTC").await.unwrap();

        h.reconciler.startup().await.unwrap();

        assert!(h.follower.placed_orders().await.is_empty());
        assert!(h.follower.canceled_orders().await.is_empty());
        // No Recovered entry: the binding was never lost.
        assert!(h.journal.get("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_mapping_replayed_as_fresh_open() {
        let h = harness();
        h.master
            .set_open_orders(vec![master_open_order(
                2,
                "BTC",
                OrderSide::Buy,
                dec!(30000.0),
                dec!(0.02),
            )])
            .await;
        // Mapping points at an order the Follower no longer has.
        h.mapper.save(2, 555, "BTC").await.unwrap();

        h.reconciler.startup().await.unwrap();

        let placed = h.follower.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].quantity, dec!(0.002));
        let mapping = h.mapper.lookup_follower(2).await.unwrap().unwrap();
        assert_ne!(mapping.follower_order_id, 555);
    }

    #[tokio::test]
    async fn test_zombie_follower_order_canceled() {
        let h = harness();
        h.master.set_open_orders(vec![]).await;
        h.follower
            .add_open_order(777, "BTCUSDT", OrderSide::Buy, dec!(30000.0), dec!(0.002), false)
            .await;
        h.mapper.save(9, 777, "BTC").await.unwrap();

        h.reconciler.startup().await.unwrap();

        assert_eq!(h.follower.canceled_orders().await, vec![777]);
        assert!(h.mapper.lookup_follower(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_startup_is_idempotent() {
        let h = harness();
        h.master
            .set_open_orders(vec![master_open_order(
                3,
                "BTC",
                OrderSide::Sell,
                dec!(31000.0),
                dec!(0.02),
            )])
            .await;

        h.reconciler.startup().await.unwrap();
        h.reconciler.startup().await.unwrap();

        // One placement; the second pass sees a synced mapping.
        assert_eq!(h.follower.placed_orders().await.len(), 1);
        assert!(h.follower.canceled_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_execution_report_records_orphan() {
        let h = harness();
        h.mapper.save(1, 1001, "BTC").await.unwrap();

        let report = ExecutionReport {
            order_id: 1001,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            last_fill_qty: dec!(0.002),
            last_fill_price: dec!(30000.0),
            timestamp: 1,
        };
        h.reconciler.handle_execution_report(&report).await.unwrap();

        let orphan = h.orphans.get(1).await.unwrap().unwrap();
        assert_eq!(orphan.master_size_equivalent, dec!(0.02));
        assert_eq!(orphan.follower_size, dec!(0.002));
        // Expected Master fill pre-credited.
        assert_eq!(h.ledger.get("BTC").await.unwrap(), dec!(-0.02));
    }

    #[tokio::test]
    async fn test_partial_fills_accumulate_orphan() {
        let h = harness();
        h.mapper.save(1, 1001, "BTC").await.unwrap();

        let mut report = ExecutionReport {
            order_id: 1001,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::PartiallyFilled,
            last_fill_qty: dec!(0.001),
            last_fill_price: dec!(30000.0),
            timestamp: 1,
        };
        h.reconciler.handle_execution_report(&report).await.unwrap();
        report.status = OrderStatus::Filled;
        h.reconciler.handle_execution_report(&report).await.unwrap();

        let orphan = h.orphans.get(1).await.unwrap().unwrap();
        assert_eq!(orphan.follower_size, dec!(0.002));
        assert_eq!(h.ledger.get("BTC").await.unwrap(), dec!(-0.02));
    }

    #[tokio::test]
    async fn test_terminal_report_releases_mapping() {
        let h = harness();
        h.mapper.save(1, 1001, "BTC").await.unwrap();

        let report = ExecutionReport {
            order_id: 1001,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Canceled,
            last_fill_qty: Decimal::ZERO,
            last_fill_price: Decimal::ZERO,
            timestamp: 1,
        };
        h.reconciler.handle_execution_report(&report).await.unwrap();

        assert!(h.mapper.lookup_follower(1).await.unwrap().is_none());
        assert!(h.orphans.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unmapped_report_ignored() {
        let h = harness();
        let report = ExecutionReport {
            order_id: 4242,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            last_fill_qty: dec!(0.002),
            last_fill_price: dec!(30000.0),
            timestamp: 1,
        };
        h.reconciler.handle_execution_report(&report).await.unwrap();
        assert_eq!(h.ledger.get("BTC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_init_ledger_seeds_once() {
        let h = harness();
        h.master.set_position("BTC", dec!(0.5), dec!(30000)).await;

        h.reconciler.init_ledger().await.unwrap();
        assert_eq!(h.ledger.get("BTC").await.unwrap(), dec!(0.5));

        // Accumulated state survives a second pass.
        h.ledger.add("BTC", dec!(0.1)).await.unwrap();
        h.reconciler.init_ledger().await.unwrap();
        assert_eq!(h.ledger.get("BTC").await.unwrap(), dec!(0.6));
    }
}
