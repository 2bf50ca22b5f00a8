//! Liveness predicates: "has the expected action already happened?"
//!
//! The escalation scheduler asks its predicate right before every
//! checkpoint. Errors are treated as "not yet" by the scheduler.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::event::{normalize_content, Event, SubjectId};

/// Default age after which remembered activity is dropped
pub const DEFAULT_ACTIVITY_RETENTION_MINUTES: i64 = 60;

/// Entries kept per subject in the [`ActivityTracker`]
const MAX_ACTIVITY_PER_SUBJECT: usize = 64;

/// Every this many records, idle subjects are swept from the tracker
const SWEEP_EVERY: u64 = 256;

/// Caller-supplied check consulted before each escalation checkpoint
#[async_trait]
pub trait LivenessPredicate: Send + Sync {
    async fn is_satisfied(&self, subject_id: &str) -> anyhow::Result<bool>;
}

/// Shared reference to a predicate
pub type SharedPredicate = Arc<dyn LivenessPredicate>;

/// Predicate backed by a plain closure
pub struct FnPredicate<F> {
    f: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&str) -> anyhow::Result<bool> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> LivenessPredicate for FnPredicate<F>
where
    F: Fn(&str) -> anyhow::Result<bool> + Send + Sync,
{
    async fn is_satisfied(&self, subject_id: &str) -> anyhow::Result<bool> {
        (self.f)(subject_id)
    }
}

/// Predicate that is never satisfied; the escalation runs to exhaustion
/// unless cancelled through its handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverSatisfied;

#[async_trait]
impl LivenessPredicate for NeverSatisfied {
    async fn is_satisfied(&self, _subject_id: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// One processed event remembered by the tracker
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    /// Monotonic sequence number, unique per tracker
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub normalized_content: String,
}

/// Interest of one live escalation in a subject's activity. Once satisfied
/// it stays satisfied, whatever happens to the activity buffer.
#[derive(Debug)]
struct Watch {
    after_seq: u64,
    until: Option<Regex>,
    satisfied: AtomicBool,
}

impl Watch {
    fn observe(&self, activity: &Activity) {
        let matches = activity.seq > self.after_seq
            && self
                .until
                .as_ref()
                .map(|re| re.is_match(&activity.normalized_content))
                .unwrap_or(true);
        if matches {
            self.satisfied.store(true, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Default)]
struct SubjectActivity {
    recent: VecDeque<Activity>,
    watches: Vec<Weak<Watch>>,
}

impl SubjectActivity {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.recent.front().is_some_and(|a| a.at < cutoff) {
            self.recent.pop_front();
        }
        self.watches.retain(|w| w.strong_count() > 0);
    }

    fn is_idle(&self) -> bool {
        self.recent.is_empty() && self.watches.is_empty()
    }
}

/// Per-subject activity, fed by the coordinator for every processed event.
///
/// Escalations register a watch through [`ActivityTracker::watch`]; the
/// watch is matched against every later record, so the buffer itself only
/// has to bridge the gap between recording an event and registering its
/// escalation. Subjects with no recent activity and no live watch are
/// dropped.
#[derive(Debug)]
pub struct ActivityTracker {
    next_seq: AtomicU64,
    retention: Duration,
    subjects: Mutex<HashMap<SubjectId, SubjectActivity>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            retention: Duration::minutes(DEFAULT_ACTIVITY_RETENTION_MINUTES),
            subjects: Mutex::new(HashMap::new()),
        }
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Remember `event`; returns its sequence number.
    pub fn record(&self, event: &Event) -> u64 {
        self.record_content(&event.subject_id, &event.content)
    }

    pub fn record_content(&self, subject_id: &str, content: &str) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let activity = Activity {
            seq,
            at: Utc::now(),
            normalized_content: normalize_content(content),
        };
        let cutoff = self.cutoff(activity.at);
        if let Ok(mut subjects) = self.subjects.lock() {
            let entry = subjects.entry(subject_id.to_string()).or_default();
            for watch in entry.watches.iter().filter_map(Weak::upgrade) {
                watch.observe(&activity);
            }
            if entry.recent.len() >= MAX_ACTIVITY_PER_SUBJECT {
                entry.recent.pop_front();
            }
            entry.recent.push_back(activity);
            entry.prune(cutoff);

            if seq % SWEEP_EVERY == 0 {
                subjects.retain(|_, s| {
                    s.prune(cutoff);
                    !s.is_idle()
                });
            }
        }
        seq
    }

    /// Highest sequence number handed out so far
    pub fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Liveness satisfied by activity from `subject_id` after `after_seq`,
    /// optionally matching `until` on normalized content. Activity already
    /// in the buffer counts.
    pub fn watch(&self, subject_id: &str, after_seq: u64, until: Option<Regex>) -> ActivityLiveness {
        let watch = Arc::new(Watch {
            after_seq,
            until,
            satisfied: AtomicBool::new(false),
        });
        if let Ok(mut subjects) = self.subjects.lock() {
            let entry = subjects.entry(subject_id.to_string()).or_default();
            for activity in &entry.recent {
                watch.observe(activity);
            }
            entry.watches.push(Arc::downgrade(&watch));
        }
        ActivityLiveness {
            subject_id: subject_id.to_string(),
            watch,
        }
    }

    /// Drop activity older than the retention and forget idle subjects.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);
        if let Ok(mut subjects) = self.subjects.lock() {
            subjects.retain(|_, s| {
                s.prune(cutoff);
                !s.is_idle()
            });
        }
    }

    /// Number of subjects currently remembered
    pub fn subject_count(&self) -> usize {
        self.subjects.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Recent activity for a subject, oldest first
    pub fn recent(&self, subject_id: &str) -> Vec<Activity> {
        self.subjects
            .lock()
            .ok()
            .and_then(|s| s.get(subject_id).map(|e| e.recent.iter().cloned().collect()))
            .unwrap_or_default()
    }
}

/// Satisfied once the subject produced a later processed event; built by
/// [`ActivityTracker::watch`]
#[derive(Debug, Clone)]
pub struct ActivityLiveness {
    subject_id: SubjectId,
    watch: Arc<Watch>,
}

#[async_trait]
impl LivenessPredicate for ActivityLiveness {
    async fn is_satisfied(&self, subject_id: &str) -> anyhow::Result<bool> {
        Ok(subject_id == self.subject_id && self.watch.satisfied.load(Ordering::SeqCst))
    }
}
