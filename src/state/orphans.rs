//! Orphan-fill records: Follower fills observed before the Master's own
//! fill notification.
//!
//! When a mirrored resting order fills on the Follower first, the expected
//! Master-side fill is pre-credited against the delta ledger; the record
//! here carries the amount to reverse once the Master's Filled event for the
//! same oid arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::mapper::MAPPING_RETENTION;
use crate::exchange::OrderSide;
use crate::persistence::KvStore;

const ORPHAN_PREFIX: &str = "orphanFill:";

/// Provisional adjustment recorded per Master oid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanFill {
    pub instrument: String,
    pub side: OrderSide,
    pub follower_size: Decimal,
    /// Signed Master-unit equivalent already credited to the ledger
    pub master_size_equivalent: Decimal,
    pub follower_order_id: i64,
    pub observed_at: DateTime<Utc>,
}

pub struct OrphanFills {
    store: Arc<dyn KvStore>,
}

impl OrphanFills {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(master_oid: u64) -> String {
        format!("{ORPHAN_PREFIX}{master_oid}")
    }

    /// Record a fill, accumulating sizes over partial fills of the same order.
    pub async fn accumulate(&self, master_oid: u64, fill: OrphanFill) -> Result<OrphanFill> {
        let merged = match self.get(master_oid).await? {
            Some(existing) => OrphanFill {
                follower_size: existing.follower_size + fill.follower_size,
                master_size_equivalent: existing.master_size_equivalent
                    + fill.master_size_equivalent,
                ..fill
            },
            None => fill,
        };
        let value = serde_json::to_string(&merged)?;
        self.store
            .set(&Self::key(master_oid), &value, Some(MAPPING_RETENTION))
            .await
            .context("Failed to persist orphan fill")?;
        Ok(merged)
    }

    pub async fn get(&self, master_oid: u64) -> Result<Option<OrphanFill>> {
        let Some(raw) = self.store.get(&Self::key(master_oid)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw).context("Malformed orphan fill record")?;
        Ok(Some(record))
    }

    /// Fetch and delete in one step; resolution must not run twice.
    pub async fn take(&self, master_oid: u64) -> Result<Option<OrphanFill>> {
        let record = self.get(master_oid).await?;
        if record.is_some() {
            self.store.delete(&Self::key(master_oid)).await?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    fn orphans() -> OrphanFills {
        OrphanFills::new(Arc::new(MemoryStore::new()))
    }

    fn fill(follower_size: Decimal, equivalent: Decimal) -> OrphanFill {
        OrphanFill {
            instrument: "BTC".to_string(),
            side: OrderSide::Buy,
            follower_size,
            master_size_equivalent: equivalent,
            follower_order_id: 1001,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_partial_fills_accumulate() {
        let orphans = orphans();
        orphans
            .accumulate(42, fill(dec!(0.001), dec!(0.01)))
            .await
            .unwrap();
        let merged = orphans
            .accumulate(42, fill(dec!(0.001), dec!(0.01)))
            .await
            .unwrap();
        assert_eq!(merged.follower_size, dec!(0.002));
        assert_eq!(merged.master_size_equivalent, dec!(0.02));
    }

    #[tokio::test]
    async fn test_take_deletes_record() {
        let orphans = orphans();
        orphans
            .accumulate(42, fill(dec!(0.002), dec!(0.02)))
            .await
            .unwrap();
        assert!(orphans.take(42).await.unwrap().is_some());
        assert!(orphans.take(42).await.unwrap().is_none());
    }
}
