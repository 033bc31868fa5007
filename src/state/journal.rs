//! Processed-order journal: exactly-once handling of Master events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::persistence::KvStore;

/// Journal entries expire together with the mappings they describe.
pub const JOURNAL_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

const HISTORY_PREFIX: &str = "orderHistory:";

/// What the executor did with an event. Exhaust-matched wherever consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionOutcome {
    /// Follower order placed as a direct mirror
    Placed,
    /// Promoted to the venue minimum because pending delta was nonzero
    Enforced,
    /// Existing mirror replaced after a price or size change
    Replaced,
    /// Below minimum size with no delta to enforce
    SkippedBelowMin,
    /// Denied by the risk gate
    SkippedRisk,
    /// Fill direction did not match the outstanding requirement
    SkippedDirection,
    /// Mapping re-adopted during snapshot reconciliation
    Recovered,
}

/// Outcome metadata persisted per processed event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub outcome: ExecutionOutcome,
    pub follower_order_id: Option<i64>,
    pub master_size: Decimal,
    pub follower_size: Decimal,
    pub price: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl JournalRecord {
    pub fn executed(
        outcome: ExecutionOutcome,
        follower_order_id: i64,
        master_size: Decimal,
        follower_size: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            outcome,
            follower_order_id: Some(follower_order_id),
            master_size,
            follower_size,
            price,
            processed_at: Utc::now(),
        }
    }

    pub fn skipped(outcome: ExecutionOutcome, master_size: Decimal, price: Decimal) -> Self {
        Self {
            outcome,
            follower_order_id: None,
            master_size,
            follower_size: Decimal::ZERO,
            price,
            processed_at: Utc::now(),
        }
    }
}

/// Append-only set of already-acted-upon Master event ids.
pub struct ProcessedJournal {
    store: Arc<dyn KvStore>,
}

impl ProcessedJournal {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(event_id: &str) -> String {
        format!("{HISTORY_PREFIX}{event_id}")
    }

    /// Record the outcome for an event id. Presence implies the event must
    /// never be acted on again.
    pub async fn record(&self, event_id: &str, record: &JournalRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.store
            .set(&Self::key(event_id), &value, Some(JOURNAL_RETENTION))
            .await
            .context("Failed to persist journal record")
    }

    pub async fn contains(&self, event_id: &str) -> Result<bool> {
        Ok(self.store.get(&Self::key(event_id)).await?.is_some())
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<JournalRecord>> {
        let Some(raw) = self.store.get(&Self::key(event_id)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str(&raw).context("Malformed journal record")?;
        Ok(Some(record))
    }
}
