//! Resilience: bounded retries and the reconciliation log
//!
//! Persistence outages must never stall routing or escalation. Writes are
//! retried a bounded number of times; when they still fail the side effect
//! is flagged here for manual reconciliation instead of being dropped.
//!
//! ```text
//! write
//!   ├─ succeeds                      → done
//!   ├─ retryable error, attempts left → sleep(backoff) → write
//!   └─ attempts exhausted / fatal     → caller marks degraded + flags item
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }
                    let backoff = self.backoff(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Items held by a [`ReconciliationLog`] before the oldest are dropped
pub const DEFAULT_RECONCILIATION_CAPACITY: usize = 1000;

/// What kind of side effect needs reconciling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    StrikeAppend,
    ResultPersist,
    EscalationPersist,
    EscalationSchedule,
}

impl std::fmt::Display for ReconciliationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrikeAppend => write!(f, "strike_append"),
            Self::ResultPersist => write!(f, "result_persist"),
            Self::EscalationPersist => write!(f, "escalation_persist"),
            Self::EscalationSchedule => write!(f, "escalation_schedule"),
        }
    }
}

/// A side effect flagged for manual follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationItem {
    pub kind: ReconciliationKind,
    pub subject_id: String,
    /// Event id or escalation id the item belongs to.
    pub reference: String,
    pub error: String,
    pub flagged_at: DateTime<Utc>,
}

/// Shared reference to a ReconciliationLog
pub type SharedReconciliationLog = Arc<ReconciliationLog>;

/// Bounded list of degraded side effects. Once full, each new item
/// displaces the oldest one and the loss is counted.
#[derive(Debug)]
pub struct ReconciliationLog {
    capacity: usize,
    items: Mutex<VecDeque<ReconciliationItem>>,
    dropped: AtomicU64,
}

impl Default for ReconciliationLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RECONCILIATION_CAPACITY)
    }
}

impl ReconciliationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn shared(self) -> SharedReconciliationLog {
        Arc::new(self)
    }

    pub fn flag(
        &self,
        kind: ReconciliationKind,
        subject_id: &str,
        reference: &str,
        error: impl std::fmt::Display,
    ) {
        let item = ReconciliationItem {
            kind,
            subject_id: subject_id.to_string(),
            reference: reference.to_string(),
            error: error.to_string(),
            flagged_at: Utc::now(),
        };
        warn!(
            kind = %item.kind,
            subject = %item.subject_id,
            reference = %item.reference,
            error = %item.error,
            "Flagged for manual reconciliation"
        );
        if let Ok(mut items) = self.items.lock() {
            if items.len() >= self.capacity {
                if let Some(oldest) = items.pop_front() {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        kind = %oldest.kind,
                        reference = %oldest.reference,
                        dropped,
                        "Reconciliation log full, dropping oldest item"
                    );
                }
            }
            items.push_back(item);
        }
    }

    /// Snapshot of everything flagged so far.
    pub fn pending(&self) -> Vec<ReconciliationItem> {
        self.items
            .lock()
            .map(|i| i.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take everything flagged so far, leaving the log empty.
    pub fn drain(&self) -> Vec<ReconciliationItem> {
        self.items
            .lock()
            .map(|mut i| i.drain(..).collect())
            .unwrap_or_default()
    }

    /// Items displaced because the log was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
