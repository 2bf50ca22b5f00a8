//! Persistence sink for strikes, coordination history, and escalation tasks
//!
//! Anything that supports keyed appends plus range queries by time can back
//! the engine. Two implementations ship here:
//!
//! - [`MemoryStore`]: process-local, the default.
//! - `RocksStore` (feature `heavy-state`): RocksDB column families with
//!   bincode values, so pending escalations survive a restart.

pub mod memory;
#[cfg(feature = "heavy-state")]
pub mod rocks;
#[cfg(feature = "heavy-state")]
pub mod schema;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::escalation::{EscalationId, EscalationTask};
use crate::metrics::ResultRecord;
use crate::resilience::Retryable;
use crate::strikes::{StrikeCategory, StrikeRecord};

pub use memory::MemoryStore;
#[cfg(feature = "heavy-state")]
pub use rocks::RocksStore;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            #[cfg(feature = "heavy-state")]
            Self::RocksDb(_) => true,
            Self::Serialization(_)
            | Self::Deserialization(_)
            | Self::LockPoisoned
            | Self::ColumnFamilyNotFound(_) => false,
        }
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a StateStore
pub type SharedStateStore = Arc<dyn StateStore>;

/// Append/range-query contract the engine persists through.
pub trait StateStore: Send + Sync {
    /// Append one strike; existing records are never rewritten.
    fn append_strike(&self, record: &StrikeRecord) -> StoreResult<()>;

    /// Strikes for a subject/category with `timestamp >= since`, oldest first.
    fn strikes_since(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<StrikeRecord>>;

    /// Append one coordination record.
    fn append_result(&self, record: &ResultRecord) -> StoreResult<()>;

    /// Coordination records completed in `[start, end]`, oldest first.
    fn results_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ResultRecord>>;

    /// Insert or replace an escalation task.
    fn put_escalation(&self, task: &EscalationTask) -> StoreResult<()>;

    fn get_escalation(&self, id: &EscalationId) -> StoreResult<Option<EscalationTask>>;

    /// Tasks that have not reached a terminal state.
    fn pending_escalations(&self) -> StoreResult<Vec<EscalationTask>>;
}
