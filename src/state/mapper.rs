//! Durable bidirectional binding between Master and Follower order ids.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persistence::KvStore;

/// Mappings expire after this retention window to bound storage.
pub const MAPPING_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

const M2F_PREFIX: &str = "map:m2f:";
const F2M_PREFIX: &str = "map:f2m:";
const TS_PREFIX: &str = "ts:order:";

/// Forward mapping payload: Master oid to Follower order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub follower_order_id: i64,
    pub instrument: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InverseRecord {
    master_oid: u64,
    instrument: String,
}

/// The only component allowed to create or destroy mappings.
///
/// Both directions and the creation instant are written and deleted as one
/// atomic group, so a lookup in either direction always agrees with the
/// other.
pub struct OrderMapper {
    store: Arc<dyn KvStore>,
}

impl OrderMapper {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Bind `master_oid` to `follower_order_id`, refreshing the TTL.
    pub async fn save(
        &self,
        master_oid: u64,
        follower_order_id: i64,
        instrument: &str,
    ) -> Result<()> {
        let forward = serde_json::to_string(&MappingRecord {
            follower_order_id,
            instrument: instrument.to_string(),
        })?;
        let inverse = serde_json::to_string(&InverseRecord {
            master_oid,
            instrument: instrument.to_string(),
        })?;
        self.store
            .set_many(
                &[
                    (format!("{M2F_PREFIX}{master_oid}"), forward),
                    (format!("{F2M_PREFIX}{follower_order_id}"), inverse),
                    (format!("{TS_PREFIX}{master_oid}"), Utc::now().to_rfc3339()),
                ],
                Some(MAPPING_RETENTION),
            )
            .await
            .context("Failed to persist mapping")
    }

    pub async fn lookup_follower(&self, master_oid: u64) -> Result<Option<MappingRecord>> {
        let Some(raw) = self.store.get(&format!("{M2F_PREFIX}{master_oid}")).await? else {
            return Ok(None);
        };
        let record: MappingRecord =
            serde_json::from_str(&raw).context("Malformed forward mapping record")?;
        Ok(Some(record))
    }

    pub async fn lookup_master(&self, follower_order_id: i64) -> Result<Option<u64>> {
        let Some(raw) = self
            .store
            .get(&format!("{F2M_PREFIX}{follower_order_id}"))
            .await?
        else {
            return Ok(None);
        };
        let record: InverseRecord =
            serde_json::from_str(&raw).context("Malformed inverse mapping record")?;
        Ok(Some(record.master_oid))
    }

    /// Remove both directions and the timestamp atomically.
    pub async fn delete(&self, master_oid: u64) -> Result<()> {
        let mut keys = vec![
            format!("{M2F_PREFIX}{master_oid}"),
            format!("{TS_PREFIX}{master_oid}"),
        ];
        if let Some(record) = self.lookup_follower(master_oid).await? {
            keys.push(format!("{F2M_PREFIX}{}", record.follower_order_id));
        }
        self.store
            .delete_many(&keys)
            .await
            .context("Failed to delete mapping")
    }

    pub async fn timestamp_of(&self, master_oid: u64) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get(&format!("{TS_PREFIX}{master_oid}")).await? else {
            return Ok(None);
        };
        let instant = DateTime::parse_from_rfc3339(&raw)
            .context("Malformed mapping timestamp")?
            .with_timezone(&Utc);
        Ok(Some(instant))
    }

    /// All Master oids with a live mapping, for the validation sweep.
    pub async fn active_master_oids(&self) -> Result<Vec<u64>> {
        let keys = self.store.scan_prefix(M2F_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(M2F_PREFIX)?.parse().ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn mapper() -> OrderMapper {
        OrderMapper::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_bidirectional_lookup() {
        let mapper = mapper();
        mapper.save(42, 1001, "BTC").await.unwrap();

        let forward = mapper.lookup_follower(42).await.unwrap().unwrap();
        assert_eq!(forward.follower_order_id, 1001);
        assert_eq!(forward.instrument, "BTC");
        assert_eq!(mapper.lookup_master(1001).await.unwrap(), Some(42));
        assert!(mapper.timestamp_of(42).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_both_directions() {
        let mapper = mapper();
        mapper.save(42, 1001, "BTC").await.unwrap();
        mapper.delete(42).await.unwrap();

        assert!(mapper.lookup_follower(42).await.unwrap().is_none());
        assert!(mapper.lookup_master(1001).await.unwrap().is_none());
        assert!(mapper.timestamp_of(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_mapping_is_noop() {
        let mapper = mapper();
        mapper.delete(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_master_oids() {
        let mapper = mapper();
        mapper.save(1, 100, "BTC").await.unwrap();
        mapper.save(2, 200, "ETH").await.unwrap();
        let mut oids = mapper.active_master_oids().await.unwrap();
        oids.sort();
        assert_eq!(oids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_save_refreshes_existing_binding() {
        let mapper = mapper();
        mapper.save(42, 1001, "BTC").await.unwrap();
        mapper.save(42, 1002, "BTC").await.unwrap();
        let forward = mapper.lookup_follower(42).await.unwrap().unwrap();
        assert_eq!(forward.follower_order_id, 1002);
        assert_eq!(mapper.lookup_master(1002).await.unwrap(), Some(42));
    }
}
