//! Process-local state store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::{StateStore, StoreError, StoreResult};
use crate::escalation::{EscalationId, EscalationTask};
use crate::metrics::ResultRecord;
use crate::strikes::{StrikeCategory, StrikeRecord};

type StrikeKey = (String, StrikeCategory);

/// In-memory [`StateStore`]. Contents are lost when the process exits.
///
/// [`set_available`](Self::set_available) simulates an outage: every
/// operation fails with [`StoreError::Unavailable`] until it is turned back on.
#[derive(Debug)]
pub struct MemoryStore {
    strikes: RwLock<HashMap<StrikeKey, Vec<StrikeRecord>>>,
    results: RwLock<Vec<ResultRecord>>,
    escalations: RwLock<HashMap<EscalationId, EscalationTask>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            strikes: RwLock::new(HashMap::new()),
            results: RwLock::new(Vec::new()),
            escalations: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    /// Number of coordination records held.
    pub fn result_count(&self) -> usize {
        self.results.read().map(|r| r.len()).unwrap_or(0)
    }
}

impl StateStore for MemoryStore {
    fn append_strike(&self, record: &StrikeRecord) -> StoreResult<()> {
        self.ensure_available()?;
        let mut strikes = self.strikes.write().map_err(|_| StoreError::LockPoisoned)?;
        let bucket = strikes
            .entry((record.subject_id.clone(), record.category))
            .or_default();
        // Keep each bucket sorted so backfilled records land in place.
        let pos = bucket.partition_point(|r| r.timestamp <= record.timestamp);
        bucket.insert(pos, record.clone());
        Ok(())
    }

    fn strikes_since(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<StrikeRecord>> {
        self.ensure_available()?;
        let strikes = self.strikes.read().map_err(|_| StoreError::LockPoisoned)?;
        let Some(bucket) = strikes.get(&(subject_id.to_string(), category)) else {
            return Ok(Vec::new());
        };
        let start = bucket.partition_point(|r| r.timestamp < since);
        Ok(bucket[start..].to_vec())
    }

    fn append_result(&self, record: &ResultRecord) -> StoreResult<()> {
        self.ensure_available()?;
        let mut results = self.results.write().map_err(|_| StoreError::LockPoisoned)?;
        let pos = results.partition_point(|r| r.completed_at <= record.completed_at);
        results.insert(pos, record.clone());
        Ok(())
    }

    fn results_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ResultRecord>> {
        self.ensure_available()?;
        let results = self.results.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(results
            .iter()
            .filter(|r| r.completed_at >= start && r.completed_at <= end)
            .cloned()
            .collect())
    }

    fn put_escalation(&self, task: &EscalationTask) -> StoreResult<()> {
        self.ensure_available()?;
        let mut escalations = self
            .escalations
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        escalations.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_escalation(&self, id: &EscalationId) -> StoreResult<Option<EscalationTask>> {
        self.ensure_available()?;
        let escalations = self
            .escalations
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(escalations.get(id).cloned())
    }

    fn pending_escalations(&self) -> StoreResult<Vec<EscalationTask>> {
        self.ensure_available()?;
        let escalations = self
            .escalations
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        let mut pending: Vec<EscalationTask> = escalations
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}
