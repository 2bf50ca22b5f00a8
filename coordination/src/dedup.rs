//! Duplicate suppression over a trailing time window
//!
//! An event is identified by a blake3 fingerprint of its subject and
//! normalized content. The map of last-seen times is guarded by a single
//! mutex held for one check-and-record, so two concurrent copies of the same
//! event cannot both pass.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::event::{normalize_content, Event};

/// Default trailing window for duplicate detection
pub const DEFAULT_DEDUP_WINDOW_MINUTES: i64 = 5;

/// Longest duplicate window accepted by configuration (one week)
pub const MAX_DEDUP_WINDOW_MINUTES: i64 = 7 * 24 * 60;

/// 32-byte event fingerprint
pub type Fingerprint = [u8; 32];

/// Fingerprint over `(subject_id, normalized content)`.
pub fn fingerprint(subject_id: &str, content: &str) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(subject_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize_content(content).as_bytes());
    *hasher.finalize().as_bytes()
}

/// Fingerprint of an event
pub fn event_fingerprint(event: &Event) -> Fingerprint {
    fingerprint(&event.subject_id, &event.content)
}

/// Last-seen times of recent fingerprints
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: Mutex<HashMap<Fingerprint, DateTime<Utc>>>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_DEDUP_WINDOW_MINUTES))
    }
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Window of `minutes`; lengths chrono cannot represent saturate.
    pub fn from_minutes(minutes: i64) -> Self {
        Self::new(Duration::try_minutes(minutes).unwrap_or(Duration::MAX))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` when `event` is new and records it; `false` when the
    /// same fingerprint was seen within the window as of `now`.
    ///
    /// A duplicate does not refresh the recorded time, so a stream of
    /// repeats cannot hold a fingerprint open forever.
    pub fn check_and_record(&self, event: &Event, now: DateTime<Utc>) -> bool {
        let key = event_fingerprint(event);
        // A poisoned lock degrades to "not a duplicate": false negatives are
        // acceptable, dropping a real event is not.
        let Ok(mut seen) = self.seen.lock() else {
            return true;
        };

        let window = self.window;
        seen.retain(|_, at| now - *at <= window);

        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    /// Whether `event` would be reported as a duplicate, without recording it.
    pub fn contains(&self, event: &Event, now: DateTime<Utc>) -> bool {
        let key = event_fingerprint(event);
        self.seen
            .lock()
            .map(|seen| {
                seen.get(&key)
                    .map(|at| now - *at <= self.window)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Fingerprints currently held (including not-yet-pruned expired ones).
    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fingerprint_normalizes_whitespace_and_case() {
        assert_eq!(
            fingerprint("u1", "Running  20 min LATE"),
            fingerprint("u1", "running 20 min late")
        );
        assert_ne!(
            fingerprint("u1", "running late"),
            fingerprint("u2", "running late")
        );
    }

    #[test]
    fn test_duplicate_within_window() {
        let window = DedupWindow::from_minutes(5);
        let now = Utc::now();
        let event = Event::new("u1", "on my way");

        assert!(window.check_and_record(&event, now));
        assert!(!window.check_and_record(&event, now + Duration::minutes(2)));
        assert!(window.contains(&event, now + Duration::minutes(4)));
    }

    #[test]
    fn test_expired_fingerprint_passes_again() {
        let window = DedupWindow::from_minutes(5);
        let now = Utc::now();
        let event = Event::new("u1", "on my way");

        assert!(window.check_and_record(&event, now));
        assert!(window.check_and_record(&event, now + Duration::minutes(6)));
    }

    #[test]
    fn test_expired_entries_pruned_lazily() {
        let window = DedupWindow::from_minutes(5);
        let now = Utc::now();
        window.check_and_record(&Event::new("u1", "a"), now);
        window.check_and_record(&Event::new("u2", "b"), now);
        assert_eq!(window.len(), 2);

        window.check_and_record(&Event::new("u3", "c"), now + Duration::minutes(10));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_oversized_window_saturates() {
        let window = DedupWindow::from_minutes(i64::MAX);
        assert_eq!(window.window(), Duration::MAX);

        let now = Utc::now();
        let event = Event::new("u1", "on my way");
        assert!(window.check_and_record(&event, now));
        assert!(!window.check_and_record(&event, now + Duration::days(3650)));
    }

    #[test]
    fn test_concurrent_copies_only_one_passes() {
        let window = Arc::new(DedupWindow::from_minutes(5));
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    window.check_and_record(&Event::new("u1", "same text"), now)
                })
            })
            .collect();

        let passed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|fresh| *fresh)
            .count();
        assert_eq!(passed, 1);
    }
}
