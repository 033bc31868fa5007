//! In-memory implementation of the key-value contract, used by tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::KvStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| at > Instant::now())
    }
}

/// HashMap-backed store with the same TTL semantics as the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(value: &str, ttl: Option<Duration>) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    async fn set_many(&self, pairs: &[(String, String)], ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for (key, value) in pairs {
            entries.insert(key.clone(), Self::entry(value, ttl));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(Entry::live) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Self::entry(value, ttl));
        Ok(true)
    }

    async fn incr_by(&self, key: &str, amount: Decimal, ttl: Option<Duration>) -> Result<Decimal> {
        let mut entries = self.entries.lock().await;
        let current = match entries.get(key) {
            Some(entry) if entry.live() => Decimal::from_str(&entry.value)
                .with_context(|| format!("Non-decimal value at {key}"))?,
            _ => Decimal::ZERO,
        };
        let updated = current + amount;
        entries.insert(key.to_string(), Self::entry(&updated.to_string(), ttl));
        Ok(updated)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_and_consume_round_trip() {
        let store = MemoryStore::new();
        store.incr_by("d", dec!(0.01), None).await.unwrap();
        let after = store.incr_by("d", dec!(-0.01), None).await.unwrap();
        assert_eq!(after, dec!(0.00));
    }

    #[tokio::test]
    async fn test_set_nx() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", "1", None).await.unwrap());
        assert!(!store.set_nx("lock", "1", None).await.unwrap());
    }
}
