//! Pluggable event handlers and the priority-ordered registry
//!
//! A handler declares what it cares about through an [`Interest`] and a
//! priority; the coordinator evaluates every descriptor the same way, so new
//! handlers never need changes in the routing code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::escalation::{EscalationId, EscalationPlan};
use crate::event::Event;
use crate::notify::Severity;
use crate::strikes::{StrikeCategory, StrikeLedger};

/// Default threshold above which a result counts as high-confidence
pub const DEFAULT_HIGH_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Business logic reacting to an event
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identifier used in results, metrics and logs
    fn id(&self) -> &str;

    async fn handle(&self, event: &Event, ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome>;
}

/// Shared reference to a handler
pub type SharedHandler = Arc<dyn EventHandler>;

/// Compile a content pattern. Content is normalized to lowercase before
/// matching, so patterns are case-insensitive.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Interest predicate deciding whether a handler sees an event
#[derive(Debug, Clone)]
pub enum Interest {
    /// Catch-all; always matches
    Any,
    /// Case-insensitive substring match on any keyword
    Keywords(Vec<String>),
    /// Regex over the normalized content
    Pattern(Regex),
    /// Exact channel id
    Channel(String),
    AllOf(Vec<Interest>),
    AnyOf(Vec<Interest>),
}

impl Interest {
    pub fn keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Keywords(
            keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        )
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(compile_pattern(pattern)?))
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self::Channel(channel_id.into())
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self, Self::Any)
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.matches_normalized(event, &event.normalized_content())
    }

    fn matches_normalized(&self, event: &Event, normalized: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Keywords(words) => words
                .iter()
                .any(|w| normalized.contains(w.to_lowercase().as_str())),
            Self::Pattern(re) => re.is_match(normalized),
            Self::Channel(channel) => event.channel_id == *channel,
            Self::AllOf(all) => all.iter().all(|i| i.matches_normalized(event, normalized)),
            Self::AnyOf(any) => any.iter().any(|i| i.matches_normalized(event, normalized)),
        }
    }
}

/// A registered handler with its routing metadata
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub id: String,
    /// Higher runs first
    pub priority: i32,
    pub interest: Interest,
    /// Only invoked when no other descriptor matched
    pub fallback: bool,
    pub handler: SharedHandler,
}

impl HandlerDescriptor {
    pub fn new(handler: SharedHandler, priority: i32, interest: Interest) -> Self {
        Self {
            id: handler.id().to_string(),
            priority,
            interest,
            fallback: false,
            handler,
        }
    }

    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("interest", &self.interest)
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Descriptors kept in descending priority order, stable on registration order
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    descriptors: Vec<HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) {
        let pos = self
            .descriptors
            .partition_point(|d| d.priority >= descriptor.priority);
        self.descriptors.insert(pos, descriptor);
    }

    pub fn with(mut self, descriptor: HandlerDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn descriptors(&self) -> &[HandlerDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.id.as_str()).collect()
    }

    /// Descriptors that should see `event`, highest priority first.
    ///
    /// Fallback descriptors are considered only when no regular descriptor
    /// matched.
    pub fn select(&self, event: &Event) -> Vec<&HandlerDescriptor> {
        let normalized = event.normalized_content();
        let primary: Vec<&HandlerDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| !d.fallback && d.interest.matches_normalized(event, &normalized))
            .collect();
        if !primary.is_empty() {
            return primary;
        }
        self.descriptors
            .iter()
            .filter(|d| d.fallback && d.interest.matches_normalized(event, &normalized))
            .collect()
    }
}

/// Outward notification requested by a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub message: String,
    pub severity: Severity,
    /// Empty means "reply where the event came from"
    #[serde(default)]
    pub targets: Vec<String>,
}

impl NotificationRequest {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            targets: Vec::new(),
        }
    }

    pub fn to_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }
}

/// Strike to append for the event's subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeRequest {
    pub category: StrikeCategory,
    pub detail: String,
}

/// Which escalation plan to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanRef {
    /// A plan from the configured `escalation_plans` table
    Named(String),
    Inline(EscalationPlan),
}

/// Escalation to schedule for the event's subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub plan: PlanRef,
    /// Defaults to the event timestamp
    #[serde(default)]
    pub anchor_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targets: Vec<String>,
    /// Only later events matching this regex cancel the escalation
    #[serde(default)]
    pub until: Option<String>,
}

impl EscalationRequest {
    pub fn named(plan: impl Into<String>) -> Self {
        Self {
            plan: PlanRef::Named(plan.into()),
            anchor_time: None,
            targets: Vec::new(),
            until: None,
        }
    }

    pub fn inline(plan: EscalationPlan) -> Self {
        Self {
            plan: PlanRef::Inline(plan),
            anchor_time: None,
            targets: Vec::new(),
            until: None,
        }
    }

    pub fn anchored_at(mut self, anchor_time: DateTime<Utc>) -> Self {
        self.anchor_time = Some(anchor_time);
        self
    }

    pub fn to_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn until(mut self, pattern: impl Into<String>) -> Self {
        self.until = Some(pattern.into());
        self
    }
}

/// What a handler decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    /// Short machine-readable action name
    pub action: String,
    /// Confidence in [0.0, 1.0]
    pub confidence: f64,
    pub summary: Option<String>,
    pub notification: Option<NotificationRequest>,
    pub strike: Option<StrikeRequest>,
    pub escalation: Option<EscalationRequest>,
}

impl HandlerOutcome {
    pub fn new(action: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: action.into(),
            confidence: confidence.clamp(0.0, 1.0),
            summary: None,
            notification: None,
            strike: None,
            escalation: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn notify(mut self, request: NotificationRequest) -> Self {
        self.notification = Some(request);
        self
    }

    pub fn strike(mut self, category: StrikeCategory, detail: impl Into<String>) -> Self {
        self.strike = Some(StrikeRequest {
            category,
            detail: detail.into(),
        });
        self
    }

    pub fn escalate(mut self, request: EscalationRequest) -> Self {
        self.escalation = Some(request);
        self
    }

    pub fn is_high_confidence(&self, threshold: f64) -> bool {
        self.confidence > threshold
    }

    pub fn wants_notification(&self) -> bool {
        self.notification.is_some()
    }
}

/// Per-call context handed to every handler in a batch
#[derive(Clone)]
pub struct HandlerContext {
    high_confidence_threshold: f64,
    suppressing: Arc<AtomicBool>,
    ledger: Option<Arc<StrikeLedger>>,
}

impl HandlerContext {
    pub fn new(high_confidence_threshold: f64) -> Self {
        Self {
            high_confidence_threshold,
            suppressing: Arc::new(AtomicBool::new(false)),
            ledger: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<StrikeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn high_confidence_threshold(&self) -> f64 {
        self.high_confidence_threshold
    }

    /// Whether an earlier result in this batch already claimed the outward
    /// notification. Handlers may use it to skip expensive message drafting.
    pub fn will_be_suppressed(&self) -> bool {
        self.suppressing.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_suppressing(&self) {
        self.suppressing.store(true, Ordering::SeqCst);
    }

    /// Strike ledger, for handlers that look at a subject's history
    pub fn strikes(&self) -> Option<&StrikeLedger> {
        self.ledger.as_deref()
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("high_confidence_threshold", &self.high_confidence_threshold)
            .field("will_be_suppressed", &self.will_be_suppressed())
            .finish()
    }
}

/// How a handler invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Completed,
    Failed,
    TimedOut,
    Panicked,
}

impl HandlerStatus {
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for HandlerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Panicked => write!(f, "panicked"),
        }
    }
}

/// Side effect applied on behalf of a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    StrikeRecorded {
        category: StrikeCategory,
        timestamp: DateTime<Utc>,
    },
    /// Strike could not be stored; flagged for reconciliation
    StrikeDeferred {
        category: StrikeCategory,
        error: String,
    },
    EscalationScheduled {
        escalation_id: EscalationId,
        checkpoints: usize,
        durable: bool,
    },
    EscalationRejected {
        reason: String,
    },
}

/// Per-handler result inside a coordination result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub handler_id: String,
    pub priority: i32,
    pub status: HandlerStatus,
    pub outcome: Option<HandlerOutcome>,
    pub error: Option<String>,
    /// Outward notification withheld by the suppression policy
    pub notification_suppressed: bool,
    pub notifications_sent: usize,
    pub delivery_failures: Vec<String>,
    pub side_effects: Vec<SideEffect>,
    pub elapsed_ms: u64,
}

impl HandlerResult {
    pub fn completed(id: &str, priority: i32, outcome: HandlerOutcome, elapsed_ms: u64) -> Self {
        Self {
            handler_id: id.to_string(),
            priority,
            status: HandlerStatus::Completed,
            outcome: Some(outcome),
            error: None,
            notification_suppressed: false,
            notifications_sent: 0,
            delivery_failures: Vec::new(),
            side_effects: Vec::new(),
            elapsed_ms,
        }
    }

    pub fn errored(
        id: &str,
        priority: i32,
        status: HandlerStatus,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            handler_id: id.to_string(),
            priority,
            status,
            outcome: None,
            error: Some(error.into()),
            notification_suppressed: false,
            notifications_sent: 0,
            delivery_failures: Vec::new(),
            side_effects: Vec::new(),
            elapsed_ms,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        self.outcome.as_ref().map(|o| o.confidence)
    }

    pub fn is_high_confidence(&self, threshold: f64) -> bool {
        self.outcome
            .as_ref()
            .map(|o| o.is_high_confidence(threshold))
            .unwrap_or(false)
    }

    /// High-confidence and asking for an outward notification
    pub fn claims_notification(&self, threshold: f64) -> bool {
        self.outcome
            .as_ref()
            .map(|o| o.is_high_confidence(threshold) && o.wants_notification())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl EventHandler for Named {
        fn id(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: &Event, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::new("noop", 0.1))
        }
    }

    fn descriptor(id: &'static str, priority: i32, interest: Interest) -> HandlerDescriptor {
        HandlerDescriptor::new(Arc::new(Named(id)), priority, interest)
    }

    #[test]
    fn test_registry_orders_by_priority_stable() {
        let registry = HandlerRegistry::new()
            .with(descriptor("low", 1, Interest::Any))
            .with(descriptor("high", 10, Interest::Any))
            .with(descriptor("mid-a", 5, Interest::Any))
            .with(descriptor("mid-b", 5, Interest::Any));
        assert_eq!(registry.ids(), vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn test_fallback_only_when_nothing_else_matches() {
        let registry = HandlerRegistry::new()
            .with(descriptor("late", 10, Interest::keywords(["late"])))
            .with(descriptor("fallback", 0, Interest::Any).as_fallback());

        let late = Event::new("u1", "Running LATE");
        let ids: Vec<&str> = registry.select(&late).iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["late"]);

        let other = Event::new("u1", "job done");
        let ids: Vec<&str> = registry.select(&other).iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["fallback"]);
    }

    #[test]
    fn test_interest_combinators() {
        let interest = Interest::AllOf(vec![
            Interest::channel("ops-room"),
            Interest::AnyOf(vec![
                Interest::keywords(["photo"]),
                Interest::pattern(r"\bpics?\b").unwrap(),
            ]),
        ]);
        assert!(interest.matches(&Event::new("u1", "uploaded pics").with_channel("ops-room")));
        assert!(!interest.matches(&Event::new("u1", "uploaded pics").with_channel("other")));
        assert!(!interest.matches(&Event::new("u1", "hello").with_channel("ops-room")));
    }

    #[test]
    fn test_pattern_sees_normalized_content() {
        let interest = Interest::pattern(r"\d+ MIN late").unwrap();
        assert!(interest.matches(&Event::new("u1", "Running   20 MIN late")));
    }

    #[test]
    fn test_outcome_confidence_clamped() {
        assert_eq!(HandlerOutcome::new("x", 1.7).confidence, 1.0);
        assert_eq!(HandlerOutcome::new("x", -0.2).confidence, 0.0);
        assert!(!HandlerOutcome::new("x", 0.8).is_high_confidence(0.8));
        assert!(HandlerOutcome::new("x", 0.81).is_high_confidence(0.8));
    }

    #[test]
    fn test_context_suppression_flag_shared_across_clones() {
        let ctx = HandlerContext::new(0.8);
        let clone = ctx.clone();
        assert!(!clone.will_be_suppressed());
        ctx.mark_suppressing();
        assert!(clone.will_be_suppressed());
    }
}
