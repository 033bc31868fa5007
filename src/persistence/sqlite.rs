//! SQLite-backed implementation of the key-value contract.
//!
//! A single `kv` table holds every namespace; TTLs are an `expires_at`
//! column in unix milliseconds checked on every read and purged
//! opportunistically. Decimals are stored as their canonical string form so
//! repeated increments never accumulate float error.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::KvStore;

/// SQLite-based key-value store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("Key-value store opened at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory database, used by tests that exercise the SQL path.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);
            "#,
        )?;
        debug!("Key-value schema initialized");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning only happens after a panic mid-statement; recovering
        // the guard keeps the store usable for the supervised tasks.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|d| Self::now_ms() + d.as_millis() as i64)
    }

    /// Delete every expired row. Runs at startup; prefix scans also purge
    /// opportunistically.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self.lock();
        let purged = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Self::now_ms()],
        )?;
        if purged > 0 {
            debug!(purged, "Purged expired keys");
        }
        Ok(purged)
    }

    fn read_live(conn: &Connection, key: &str) -> Result<Option<String>> {
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, Some(expires_at))) if expires_at <= Self::now_ms() => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        Self::read_live(&conn, key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, Self::expiry_ms(ttl)],
        )?;
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let expires_at = Self::expiry_ms(ttl);
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
                params![key, value, expires_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, Self::now_ms()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, Self::expiry_ms(ttl)],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    async fn incr_by(&self, key: &str, amount: Decimal, ttl: Option<Duration>) -> Result<Decimal> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let current = Self::read_live(&tx, key)?
            .map(|v| Decimal::from_str(&v).with_context(|| format!("Non-decimal value at {key}")))
            .transpose()?
            .unwrap_or(Decimal::ZERO);
        let updated = current + amount;
        tx.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, updated.to_string(), Self::expiry_ms(ttl)],
        )?;
        tx.commit()?;
        Ok(updated)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Self::now_ms()],
        )?;
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let keys = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_key_reads_as_absent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set("gone", "v", Some(Duration::from_millis(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_by_preserves_decimal_digits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut total = Decimal::ZERO;
        for _ in 0..100 {
            total = store.incr_by("delta", dec!(0.001), None).await.unwrap();
        }
        assert_eq!(total, dec!(0.1));
        assert_eq!(store.get("delta").await.unwrap().unwrap(), "0.100");
    }

    #[tokio::test]
    async fn test_set_nx_only_first_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.set_nx("lock", "a", None).await.unwrap());
        assert!(!store.set_nx("lock", "b", None).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_set_nx_succeeds_after_expiry() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store
            .set_nx("lock", "a", Some(Duration::from_millis(0)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.set_nx("lock", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_many_and_scan_prefix() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set_many(
                &[
                    ("map:m2f:1".to_string(), "a".to_string()),
                    ("map:m2f:2".to_string(), "b".to_string()),
                    ("map:f2m:9".to_string(), "c".to_string()),
                ],
                None,
            )
            .await
            .unwrap();
        let keys = store.scan_prefix("map:m2f:").await.unwrap();
        assert_eq!(keys, vec!["map:m2f:1".to_string(), "map:m2f:2".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_many_removes_group() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("a", "1", None).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        store
            .delete_many(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap(), None);
    }
}
