//! Durable synchronization state on top of the key-value store.
//!
//! Each component owns one key namespace: the mapper binds order identities
//! across venues, the ledger accumulates per-instrument pending delta, the
//! journal enforces exactly-once event handling, and orphan records bridge
//! Follower fills that arrive before the Master's own fill notification.

mod journal;
mod ledger;
mod mapper;
mod orphans;

pub use journal::{ExecutionOutcome, JournalRecord, ProcessedJournal, JOURNAL_RETENTION};
pub use ledger::DeltaLedger;
pub use mapper::{MappingRecord, OrderMapper, MAPPING_RETENTION};
pub use orphans::{OrphanFill, OrphanFills};
