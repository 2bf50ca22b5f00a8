//! Strike Ledger: append-only, per-subject infraction counts with a rolling window
//!
//! Records are never rewritten. A strike stops counting once it is older than
//! the window; that check happens when counts are read, nothing sweeps the
//! store in the background.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::SubjectId;
use crate::resilience::{RetryPolicy, Retryable};
use crate::store::{SharedStateStore, StoreError};

/// Default rolling window for active strikes
pub const DEFAULT_STRIKE_WINDOW_DAYS: i64 = 30;

/// Longest strike window accepted by configuration
pub const MAX_STRIKE_WINDOW_DAYS: i64 = 3650;

/// Window length as a duration; lengths chrono cannot represent saturate.
fn window_duration(window_days: i64) -> Duration {
    Duration::try_days(window_days).unwrap_or(Duration::MAX)
}

/// Infraction category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrikeCategory {
    Punctuality,
    Quality,
}

impl StrikeCategory {
    pub fn all() -> &'static [StrikeCategory] {
        &[Self::Punctuality, Self::Quality]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Punctuality => "punctuality",
            Self::Quality => "quality",
        }
    }
}

impl std::fmt::Display for StrikeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StrikeCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "punctuality" => Ok(Self::Punctuality),
            "quality" => Ok(Self::Quality),
            other => Err(format!("unknown strike category: {}", other)),
        }
    }
}

/// A single recorded infraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeRecord {
    pub id: String,
    pub subject_id: SubjectId,
    pub category: StrikeCategory,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl StrikeRecord {
    pub fn new(
        subject_id: impl Into<String>,
        category: StrikeCategory,
        detail: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            category,
            timestamp,
            detail: detail.into(),
        }
    }

    /// Whether the record counts as of `now` for a window of `window_days`.
    pub fn is_active(&self, now: DateTime<Utc>, window_days: i64) -> bool {
        now - self.timestamp <= window_duration(window_days)
    }
}

/// Error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Strike storage unavailable: {0}")]
    Unavailable(#[source] StoreError),

    #[error("Strike storage error: {0}")]
    Store(#[source] StoreError),
}

impl LedgerError {
    fn from_store(e: StoreError) -> Self {
        if e.is_retryable() {
            Self::Unavailable(e)
        } else {
            Self::Store(e)
        }
    }

    /// Whether the caller may retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Active strike counts for one subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrikeTally {
    pub subject_id: SubjectId,
    pub punctuality: usize,
    pub quality: usize,
    pub window_days: i64,
}

impl StrikeTally {
    pub fn total(&self) -> usize {
        self.punctuality + self.quality
    }

    pub fn count(&self, category: StrikeCategory) -> usize {
        match category {
            StrikeCategory::Punctuality => self.punctuality,
            StrikeCategory::Quality => self.quality,
        }
    }
}

/// Append-only strike log over a [`StateStore`](crate::store::StateStore)
pub struct StrikeLedger {
    store: SharedStateStore,
    window_days: i64,
    retry: RetryPolicy,
}

impl StrikeLedger {
    pub fn new(store: SharedStateStore) -> Self {
        Self {
            store,
            window_days: DEFAULT_STRIKE_WINDOW_DAYS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_window_days(mut self, days: i64) -> Self {
        self.window_days = days;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn window_days(&self) -> i64 {
        self.window_days
    }

    /// Record a strike now; returns its timestamp.
    pub async fn append(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        detail: &str,
    ) -> LedgerResult<DateTime<Utc>> {
        self.append_at(subject_id, category, detail, Utc::now()).await
    }

    /// Record a strike with an explicit timestamp (imports, backfills).
    pub async fn append_at(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        detail: &str,
        timestamp: DateTime<Utc>,
    ) -> LedgerResult<DateTime<Utc>> {
        let record = StrikeRecord::new(subject_id, category, detail, timestamp);
        let store = &self.store;
        let pending = &record;
        self.retry
            .run("strike_append", move || async move { store.append_strike(pending) })
            .await
            .map_err(LedgerError::from_store)?;

        info!(
            subject = subject_id,
            category = %category,
            strike_id = %record.id,
            "Strike recorded"
        );
        Ok(record.timestamp)
    }

    /// Active strikes using the configured window.
    pub async fn active_count(
        &self,
        subject_id: &str,
        category: StrikeCategory,
    ) -> LedgerResult<usize> {
        self.active_count_within(subject_id, category, self.window_days)
            .await
    }

    /// Active strikes within `window_days` of now.
    pub async fn active_count_within(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        window_days: i64,
    ) -> LedgerResult<usize> {
        Ok(self
            .active_records_as_of(subject_id, category, window_days, Utc::now())
            .await?
            .len())
    }

    /// Records with age at most `window_days` as of `now`, oldest first.
    pub async fn active_records_as_of(
        &self,
        subject_id: &str,
        category: StrikeCategory,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<Vec<StrikeRecord>> {
        let since = now
            .checked_sub_signed(window_duration(window_days))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let store = &self.store;
        let records = self
            .retry
            .run("strike_query", move || async move {
                store.strikes_since(subject_id, category, since)
            })
            .await
            .map_err(LedgerError::from_store)?;

        let active: Vec<StrikeRecord> = records
            .into_iter()
            .filter(|r| r.timestamp <= now && r.is_active(now, window_days))
            .collect();

        debug!(
            subject = subject_id,
            category = %category,
            window_days,
            active = active.len(),
            "Strike window evaluated"
        );
        Ok(active)
    }

    /// Active counts for every category.
    pub async fn tally(&self, subject_id: &str) -> LedgerResult<StrikeTally> {
        let now = Utc::now();
        let punctuality = self
            .active_records_as_of(subject_id, StrikeCategory::Punctuality, self.window_days, now)
            .await?
            .len();
        let quality = self
            .active_records_as_of(subject_id, StrikeCategory::Quality, self.window_days, now)
            .await?
            .len();
        Ok(StrikeTally {
            subject_id: subject_id.to_string(),
            punctuality,
            quality,
            window_days: self.window_days,
        })
    }
}
