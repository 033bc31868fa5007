//! Durable key-value state shared by every stateful component.
//!
//! Mappings, the pending-delta ledger, the processed-order journal, orphan
//! fills, and per-order locks all live behind the [`KvStore`] contract:
//! string keys, string values, optional TTLs, atomic grouped writes, and a
//! decimal-preserving atomic increment. The store is the single source of
//! truth across restarts; in-process state is advisory only.

mod memory;
mod sqlite;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key-value store contract.
///
/// Implementations must apply `set_many`/`delete_many` atomically (all keys
/// or none) and must perform `incr_by` as a single read-add-write with no
/// interleaving writer, preserving decimal digits exactly.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one and refreshing the TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write several keys as one atomic group with a shared TTL.
    async fn set_many(&self, entries: &[(String, String)], ttl: Option<Duration>) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove several keys as one atomic group.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Atomically add `amount` to the decimal stored under `key` (absent
    /// reads as zero), refresh the TTL, and return the new value.
    async fn incr_by(&self, key: &str, amount: Decimal, ttl: Option<Duration>) -> Result<Decimal>;

    /// List live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
