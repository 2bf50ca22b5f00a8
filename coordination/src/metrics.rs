//! Rolling coordination metrics
//!
//! Every `route_event` call leaves a compact [`ResultRecord`] in a bounded
//! log. Snapshots are recomputed from the log on demand.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventId, SubjectId};
use crate::handler::HandlerStatus;

/// Default number of records kept in the rolling log
pub const DEFAULT_METRICS_CAPACITY: usize = 1000;

/// One handler invocation inside a [`ResultRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRun {
    pub handler_id: String,
    pub status: HandlerStatus,
    /// Confidence reported by a completed handler
    pub confidence: Option<f64>,
    pub elapsed_ms: u64,
}

/// Compact record of one coordination call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub event_id: EventId,
    pub subject_id: SubjectId,
    pub processed: bool,
    pub duplicate: bool,
    pub handlers: Vec<HandlerRun>,
    /// At least one handler was above the high-confidence threshold
    pub high_confidence: bool,
    pub processing_time_ms: u64,
    /// A side effect could not be persisted
    pub degraded: bool,
    pub completed_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Record for an event dropped by the dedup window
    pub fn duplicate(event_id: &str, subject_id: &str, processing_time_ms: u64) -> Self {
        Self {
            event_id: event_id.to_string(),
            subject_id: subject_id.to_string(),
            processed: false,
            duplicate: true,
            handlers: Vec::new(),
            high_confidence: false,
            processing_time_ms,
            degraded: false,
            completed_at: Utc::now(),
        }
    }

    /// Number of handler invocations that did not complete
    pub fn handler_errors(&self) -> usize {
        self.handlers
            .iter()
            .filter(|h| h.status != HandlerStatus::Completed)
            .count()
    }
}

/// Aggregated view over the rolling log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Events that reached the handlers
    pub total_processed: usize,
    /// Events dropped as duplicates
    pub duplicates: usize,
    /// Processed events completed in the last hour
    pub last_hour: usize,
    /// Mean processing time over processed events
    pub avg_processing_ms: f64,
    /// Share of processed events with a high-confidence result
    pub high_confidence_rate: f64,
    /// Handler invocations that failed, panicked or timed out
    pub handler_errors: usize,
    /// Events with a side effect flagged for reconciliation
    pub degraded: usize,
    /// Invocations per handler id
    pub per_handler: BTreeMap<String, usize>,
    /// Records currently held
    pub window_size: usize,
}

impl MetricsSnapshot {
    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "processed={} duplicates={} last_hour={} avg_ms={:.1} high_conf={:.1}% errors={} degraded={}",
            self.total_processed,
            self.duplicates,
            self.last_hour,
            self.avg_processing_ms,
            self.high_confidence_rate * 100.0,
            self.handler_errors,
            self.degraded
        )
    }
}

/// Bounded rolling log of coordination records
#[derive(Debug)]
pub struct MetricsLog {
    capacity: usize,
    records: Mutex<VecDeque<ResultRecord>>,
}

impl Default for MetricsLog {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl MetricsLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest once full.
    pub fn record(&self, record: ResultRecord) {
        if let Ok(mut records) = self.records.lock() {
            if records.len() >= self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the held records, oldest first
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate the log as of `now`.
    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let records = self.records();
        let hour_ago = now - Duration::hours(1);

        let mut snapshot = MetricsSnapshot {
            window_size: records.len(),
            ..Default::default()
        };
        let mut total_ms: u64 = 0;
        let mut high_confidence = 0usize;

        for record in &records {
            if record.duplicate {
                snapshot.duplicates += 1;
                continue;
            }
            if !record.processed {
                continue;
            }
            snapshot.total_processed += 1;
            total_ms += record.processing_time_ms;
            if record.completed_at >= hour_ago {
                snapshot.last_hour += 1;
            }
            if record.high_confidence {
                high_confidence += 1;
            }
            if record.degraded {
                snapshot.degraded += 1;
            }
            snapshot.handler_errors += record.handler_errors();
            for run in &record.handlers {
                *snapshot
                    .per_handler
                    .entry(run.handler_id.clone())
                    .or_insert(0) += 1;
            }
        }

        if snapshot.total_processed > 0 {
            let n = snapshot.total_processed as f64;
            snapshot.avg_processing_ms = total_ms as f64 / n;
            snapshot.high_confidence_rate = high_confidence as f64 / n;
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(handlers: &[(&str, HandlerStatus)], ms: u64, high: bool) -> ResultRecord {
        ResultRecord {
            event_id: uuid::Uuid::new_v4().to_string(),
            subject_id: "u1".into(),
            processed: true,
            duplicate: false,
            handlers: handlers
                .iter()
                .map(|(id, status)| HandlerRun {
                    handler_id: id.to_string(),
                    status: *status,
                    confidence: None,
                    elapsed_ms: 1,
                })
                .collect(),
            high_confidence: high,
            processing_time_ms: ms,
            degraded: false,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_aggregates() {
        let log = MetricsLog::new(10);
        log.record(processed(&[("a", HandlerStatus::Completed)], 10, true));
        log.record(processed(
            &[("a", HandlerStatus::Completed), ("b", HandlerStatus::Failed)],
            30,
            false,
        ));
        log.record(ResultRecord::duplicate("e", "u1", 0));

        let snap = log.snapshot(Utc::now());
        assert_eq!(snap.total_processed, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.last_hour, 2);
        assert_eq!(snap.handler_errors, 1);
        assert!((snap.avg_processing_ms - 20.0).abs() < f64::EPSILON);
        assert!((snap.high_confidence_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snap.per_handler.get("a"), Some(&2));
        assert_eq!(snap.per_handler.get("b"), Some(&1));
    }

    #[test]
    fn test_log_is_bounded() {
        let log = MetricsLog::new(3);
        for _ in 0..5 {
            log.record(processed(&[], 1, false));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.snapshot(Utc::now()).window_size, 3);
    }

    #[test]
    fn test_last_hour_excludes_older_records() {
        let log = MetricsLog::new(10);
        let mut old = processed(&[], 5, false);
        old.completed_at = Utc::now() - Duration::hours(2);
        log.record(old);
        log.record(processed(&[], 5, false));

        let snap = log.snapshot(Utc::now());
        assert_eq!(snap.total_processed, 2);
        assert_eq!(snap.last_hour, 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = MetricsLog::default().snapshot(Utc::now());
        assert_eq!(snap, MetricsSnapshot::default());
    }
}
