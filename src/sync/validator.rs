//! Periodic order validator: background reaper for stale mappings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::exchange::{futures_symbol, FollowerExchange};
use crate::state::OrderMapper;

pub struct OrderValidator {
    mapper: Arc<OrderMapper>,
    follower: Arc<dyn FollowerExchange>,
    sweep_interval: Duration,
    max_age: chrono::Duration,
    /// Consecutive per-oid query failures, kept for observability only.
    failures: Mutex<HashMap<u64, u32>>,
}

impl OrderValidator {
    pub fn new(
        config: &Config,
        mapper: Arc<OrderMapper>,
        follower: Arc<dyn FollowerExchange>,
    ) -> Self {
        Self {
            mapper,
            follower,
            sweep_interval: Duration::from_secs(config.engine.validator_interval_secs),
            max_age: chrono::Duration::hours(config.engine.mapping_max_age_hours as i64),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Run sweeps until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.sweep_interval);
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Mapping validation sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Order validator stopped");
    }

    /// One validation pass over every active mapping.
    pub async fn sweep(&self) -> Result<()> {
        let oids = self.mapper.active_master_oids().await?;
        debug!(mappings = oids.len(), "Validating active mappings");

        for oid in oids {
            let Some(mapping) = self.mapper.lookup_follower(oid).await? else {
                continue;
            };

            if let Some(created_at) = self.mapper.timestamp_of(oid).await? {
                if Utc::now() - created_at > self.max_age {
                    info!(oid, "Reaping mapping past the hard age limit");
                    self.mapper.delete(oid).await?;
                    continue;
                }
            }

            let symbol = futures_symbol(&mapping.instrument);
            match self
                .follower
                .query_order(&symbol, mapping.follower_order_id)
                .await
            {
                Ok(None) => {
                    // The venue no longer knows the order: the mapping is dead.
                    info!(oid, follower_order_id = mapping.follower_order_id, "Reaping unknown order");
                    self.mapper.delete(oid).await?;
                    self.failures.lock().await.remove(&oid);
                }
                Ok(Some(status)) if status.is_terminal() => {
                    debug!(oid, ?status, "Reaping terminal order mapping");
                    self.mapper.delete(oid).await?;
                    self.failures.lock().await.remove(&oid);
                }
                Ok(Some(_)) => {
                    self.failures.lock().await.remove(&oid);
                }
                Err(e) => {
                    // Transient: retain the mapping and count the failure.
                    let mut failures = self.failures.lock().await;
                    let count = failures.entry(oid).or_insert(0);
                    *count += 1;
                    warn!(oid, consecutive_failures = *count, error = %e, "Order status query failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;
    use crate::exchange::mock::MockFollower;
    use crate::exchange::{OrderSide, OrderStatus};
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    fn harness() -> (OrderValidator, Arc<OrderMapper>, Arc<MockFollower>) {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let mapper = Arc::new(OrderMapper::new(store));
        let follower = Arc::new(MockFollower::new());
        let validator = OrderValidator::new(&config, mapper.clone(), follower.clone());
        (validator, mapper, follower)
    }

    #[tokio::test]
    async fn test_live_order_mapping_retained() {
        let (validator, mapper, follower) = harness();
        mapper.save(1, 1001, "BTC").await.unwrap();
        follower
            .add_open_order(1001, "BTCUSDT", OrderSide::Buy, dec!(30000.0), dec!(0.002), false)
            .await;

        validator.sweep().await.unwrap();
        assert!(mapper.lookup_follower(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_order_mapping_reaped() {
        let (validator, mapper, follower) = harness();
        mapper.save(1, 1001, "BTC").await.unwrap();
        follower.set_order_status(1001, OrderStatus::Filled).await;

        validator.sweep().await.unwrap();
        assert!(mapper.lookup_follower(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_order_mapping_reaped() {
        let (validator, mapper, _follower) = harness();
        mapper.save(2, 2002, "BTC").await.unwrap();

        validator.sweep().await.unwrap();
        assert!(mapper.lookup_follower(2).await.unwrap().is_none());
    }
}
