//! Per-instrument pending-delta ledger.
//!
//! Tracks the signed difference `Target - Actual` in Master units: positive
//! means the Follower is behind and needs to buy net, negative means it is
//! ahead. The ledger is pure state; callers must update it consistently
//! with what they actually executed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::persistence::KvStore;

const LEDGER_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

const DELTA_PREFIX: &str = "pending:delta:";

pub struct DeltaLedger {
    store: Arc<dyn KvStore>,
}

impl DeltaLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(instrument: &str) -> String {
        format!("{DELTA_PREFIX}{instrument}")
    }

    /// Seed the delta for an instrument, overwriting any previous value.
    pub async fn init(&self, instrument: &str, delta: Decimal) -> Result<()> {
        self.store
            .set(
                &Self::key(instrument),
                &delta.to_string(),
                Some(LEDGER_RETENTION),
            )
            .await
    }

    /// Whether the instrument carries any persisted delta entry.
    pub async fn is_initialized(&self, instrument: &str) -> Result<bool> {
        Ok(self.store.get(&Self::key(instrument)).await?.is_some())
    }

    /// Atomically add a signed amount, refreshing the TTL. Returns the new delta.
    pub async fn add(&self, instrument: &str, amount: Decimal) -> Result<Decimal> {
        self.store
            .incr_by(&Self::key(instrument), amount, Some(LEDGER_RETENTION))
            .await
    }

    /// Clear an executed portion: `add(instrument, -amount)`.
    pub async fn consume(&self, instrument: &str, amount: Decimal) -> Result<Decimal> {
        self.add(instrument, -amount).await
    }

    pub async fn get(&self, instrument: &str) -> Result<Decimal> {
        let Some(raw) = self.store.get(&Self::key(instrument)).await? else {
            return Ok(Decimal::ZERO);
        };
        raw.parse()
            .with_context(|| format!("Non-decimal delta for {instrument}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use rust_decimal_macros::dec;

    fn ledger() -> DeltaLedger {
        DeltaLedger::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_absent_delta_reads_zero() {
        assert_eq!(ledger().get("BTC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_add_then_consume_leaves_delta_unchanged() {
        let ledger = ledger();
        ledger.add("BTC", dec!(0.01)).await.unwrap();
        ledger.consume("BTC", dec!(0.01)).await.unwrap();
        assert_eq!(ledger.get("BTC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_signed_accumulation() {
        let ledger = ledger();
        ledger.add("BTC", dec!(0.01)).await.unwrap();
        let delta = ledger.add("BTC", dec!(-0.03)).await.unwrap();
        assert_eq!(delta, dec!(-0.02));
        assert_eq!(ledger.get("BTC").await.unwrap(), dec!(-0.02));
    }

    #[tokio::test]
    async fn test_init_and_is_initialized() {
        let ledger = ledger();
        assert!(!ledger.is_initialized("BTC").await.unwrap());
        ledger.init("BTC", dec!(0.5)).await.unwrap();
        assert!(ledger.is_initialized("BTC").await.unwrap());
        assert_eq!(ledger.get("BTC").await.unwrap(), dec!(0.5));
    }
}
