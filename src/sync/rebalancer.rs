//! Exposure rebalancer: post-trade reconvergence of minimum-size drift.
//!
//! Minimum-size enforcement deliberately over-exposes the Follower in small
//! discrete steps. After every executed action the rebalancer compares the
//! Follower position against the Master-derived target and parks a
//! reduce-only take-profit limit just past the entry price, so the drift
//! unwinds at a small profit instead of leaking.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::{Config, InstrumentConfig, SizingMode};
use crate::exchange::{futures_symbol, FollowerExchange, MasterData, NewOrder, OrderSide};
use crate::persistence::KvStore;
use crate::state::MAPPING_RETENTION;
use crate::utils::decimal::{floor_to_precision, round_to_precision, snap_to_tick, EPSILON};

const ANCHOR_PREFIX: &str = "rebalance:tp:";

pub struct ExposureRebalancer {
    store: Arc<dyn KvStore>,
    follower: Arc<dyn FollowerExchange>,
    master: Arc<dyn MasterData>,
    instruments: HashMap<String, InstrumentConfig>,
    mode: SizingMode,
    fixed_ratio: Decimal,
    master_accounts: Vec<String>,
    profit_offset: Decimal,
}

impl ExposureRebalancer {
    pub fn new(
        config: &Config,
        store: Arc<dyn KvStore>,
        follower: Arc<dyn FollowerExchange>,
        master: Arc<dyn MasterData>,
    ) -> Self {
        Self {
            store,
            follower,
            master,
            instruments: config.instruments.clone(),
            mode: config.sizing.mode,
            fixed_ratio: config.sizing.fixed_ratio,
            master_accounts: config.master.followed_users.clone(),
            profit_offset: config.engine.profit_offset,
        }
    }

    /// Fire-and-forget invocation after an executed action.
    pub fn trigger(self: &Arc<Self>, coin: &str) {
        let rebalancer = self.clone();
        let coin = coin.to_string();
        tokio::spawn(async move {
            if let Err(e) = rebalancer.rebalance(&coin).await {
                warn!(coin, error = %e, "Exposure rebalance failed");
            }
        });
    }

    /// Compare Follower exposure against the Master-derived target and
    /// refresh the anchored reduce-only take-profit order.
    pub async fn rebalance(&self, coin: &str) -> Result<()> {
        // Equity-drift rebalancing under equal mode is intentionally out of
        // scope; only fixed mode has a deterministic target.
        if self.mode != SizingMode::Fixed {
            debug!(coin, "Rebalance skipped outside fixed mode");
            return Ok(());
        }
        let Some(instrument) = self.instruments.get(coin) else {
            return Ok(());
        };

        let master_position = self.master_position(coin).await?;
        let target = master_position * self.fixed_ratio;

        let symbol = futures_symbol(coin);
        let position = self.follower.position(&symbol).await?;
        let current = position.position_amt;
        if current.abs() <= EPSILON {
            return Ok(());
        }

        let close_side = OrderSide::closing(current);
        let covered: Decimal = self
            .follower
            .open_orders(&symbol)
            .await?
            .iter()
            .filter(|o| o.reduce_only && o.side == close_side)
            .map(|o| o.remaining_qty())
            .sum();

        let excess = current.abs() - target.abs();
        let uncovered = (current.abs() - covered).max(Decimal::ZERO);

        let aggressive = instrument
            .reduction_threshold
            .is_some_and(|threshold| uncovered >= threshold);
        let quantity = if aggressive {
            floor_to_precision(uncovered / Decimal::TWO, instrument.quantity_decimals)
        } else if excess > EPSILON && uncovered > EPSILON {
            round_to_precision(excess.min(uncovered), instrument.quantity_decimals)
        } else {
            Decimal::ZERO
        };
        if quantity <= Decimal::ZERO {
            return Ok(());
        }

        // Take profit just past the entry: above for longs, below for shorts.
        let raw_price = match close_side {
            OrderSide::Sell => position.entry_price * (Decimal::ONE + self.profit_offset),
            OrderSide::Buy => position.entry_price * (Decimal::ONE - self.profit_offset),
        };
        let price = snap_to_tick(raw_price, instrument.price_tick);

        let anchor_key = format!("{ANCHOR_PREFIX}{coin}");
        if let Some(previous) = self.store.get(&anchor_key).await? {
            let order_id: i64 = previous
                .parse()
                .with_context(|| format!("Malformed rebalance anchor for {coin}"))?;
            self.follower.cancel_order(&symbol, order_id).await?;
        }

        let order = NewOrder::limit(&symbol, close_side, quantity, price).reduce_only();
        let placed = self.follower.place_order(&order).await?;
        self.store
            .set(
                &anchor_key,
                &placed.order_id.to_string(),
                Some(MAPPING_RETENTION),
            )
            .await?;

        info!(
            coin,
            %quantity,
            %price,
            side = ?close_side,
            aggressive,
            order_id = placed.order_id,
            "Anchored reduce-only take-profit"
        );
        Ok(())
    }

    /// Authoritative Master exposure, summed over the followed accounts.
    async fn master_position(&self, coin: &str) -> Result<Decimal> {
        let mut total = Decimal::ZERO;
        for account in &self.master_accounts {
            let state = self.master.clearinghouse_state(account).await?;
            total += state.signed_position(coin);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;
    use crate::exchange::mock::{MockFollower, MockMaster};
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    struct Harness {
        rebalancer: ExposureRebalancer,
        follower: Arc<MockFollower>,
        master: Arc<MockMaster>,
        store: Arc<dyn KvStore>,
    }

    fn harness_with(config: Config) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let follower = Arc::new(MockFollower::new());
        let master = Arc::new(MockMaster::new());
        let rebalancer =
            ExposureRebalancer::new(&config, store.clone(), follower.clone(), master.clone());
        Harness {
            rebalancer,
            follower,
            master,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    #[tokio::test]
    async fn test_excess_places_reduce_only_take_profit() {
        let h = harness();
        // Master holds 0.01 long, target = 0.001; Follower holds 0.002.
        h.master.set_position("BTC", dec!(0.01), dec!(30000)).await;
        h.follower.set_position("BTCUSDT", dec!(0.002), dec!(30000)).await;

        h.rebalancer.rebalance("BTC").await.unwrap();

        let placed = h.follower.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert!(placed[0].reduce_only);
        assert_eq!(placed[0].quantity, dec!(0.001));
        // entry 30000 * 1.0001 = 30003, snapped to tick 0.1
        assert_eq!(placed[0].price.unwrap().to_string(), "30003.0");
        assert!(h.store.get("rebalance:tp:BTC").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_action_when_on_target() {
        let h = harness();
        h.master.set_position("BTC", dec!(0.02), dec!(30000)).await;
        h.follower.set_position("BTCUSDT", dec!(0.002), dec!(30000)).await;

        h.rebalancer.rebalance("BTC").await.unwrap();
        assert!(h.follower.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_flat_position_is_noop() {
        let h = harness();
        h.master.set_position("BTC", dec!(0.01), dec!(30000)).await;
        h.rebalancer.rebalance("BTC").await.unwrap();
        assert!(h.follower.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_previous_anchor_replaced() {
        let h = harness();
        h.master.set_position("BTC", dec!(0.01), dec!(30000)).await;
        h.follower.set_position("BTCUSDT", dec!(0.002), dec!(30000)).await;

        h.rebalancer.rebalance("BTC").await.unwrap();
        let first_anchor: i64 = h
            .store
            .get("rebalance:tp:BTC")
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();

        h.rebalancer.rebalance("BTC").await.unwrap();
        let second_anchor: i64 = h
            .store
            .get("rebalance:tp:BTC")
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();

        assert_ne!(first_anchor, second_anchor);
        assert!(h.follower.canceled_orders().await.contains(&first_anchor));
    }

    #[tokio::test]
    async fn test_aggressive_halving_above_threshold() {
        let mut config = test_config();
        config
            .instruments
            .get_mut("BTC")
            .unwrap()
            .reduction_threshold = Some(dec!(0.05));
        let h = harness_with(config);

        h.master.set_position("BTC", dec!(0.1), dec!(30000)).await;
        // Follower far over target (0.01) and fully uncovered.
        h.follower.set_position("BTCUSDT", dec!(0.08), dec!(30000)).await;

        h.rebalancer.rebalance("BTC").await.unwrap();

        let placed = h.follower.placed_orders().await;
        assert_eq!(placed.len(), 1);
        // floor(0.08 / 2) at 3 decimals
        assert_eq!(placed[0].quantity, dec!(0.04));
    }

    #[tokio::test]
    async fn test_short_position_closes_with_buy_below_entry() {
        let h = harness();
        h.master.set_position("BTC", dec!(-0.01), dec!(30000)).await;
        h.follower.set_position("BTCUSDT", dec!(-0.002), dec!(30000)).await;

        h.rebalancer.rebalance("BTC").await.unwrap();

        let placed = h.follower.placed_orders().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].quantity, dec!(0.001));
        // entry 30000 * 0.9999 = 29997.0
        assert_eq!(placed[0].price.unwrap().to_string(), "29997.0");
    }

    #[tokio::test]
    async fn test_equal_mode_skips_rebalance() {
        let mut config = test_config();
        config.sizing.mode = SizingMode::Equal;
        let h = harness_with(config);
        h.master.set_position("BTC", dec!(0.01), dec!(30000)).await;
        h.follower.set_position("BTCUSDT", dec!(0.01), dec!(30000)).await;

        h.rebalancer.rebalance("BTC").await.unwrap();
        assert!(h.follower.placed_orders().await.is_empty());
    }
}
