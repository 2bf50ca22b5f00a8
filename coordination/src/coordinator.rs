//! Event Coordinator: routes one event through the handler registry
//!
//! ```text
//! route_event
//!   ├─ validate            → InvalidEvent / EmptyRegistry
//!   ├─ dedup window        → duplicate result, no handler runs
//!   ├─ select handlers     (interest match, fallbacks only if nothing else)
//!   ├─ run batch           (timeout + panic capture per handler)
//!   ├─ suppression policy  (one high-confidence notifier wins)
//!   ├─ notifications       (non-suppressed only)
//!   ├─ side effects        (strikes, escalations)
//!   └─ persist + metrics
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, CoordinationConfig};
use crate::dedup::DedupWindow;
use crate::escalation::{
    EscalationHandle, EscalationPlan, EscalationScheduler, EscalationTask, SchedulerError,
    SUBJECT_TARGET,
};
use crate::event::{Event, EventId, SubjectId};
use crate::handler::{
    compile_pattern, EscalationRequest, HandlerContext, HandlerDescriptor, HandlerRegistry,
    HandlerResult, HandlerStatus, PlanRef, SideEffect,
};
use crate::liveness::{ActivityLiveness, ActivityTracker, NeverSatisfied, SharedPredicate};
use crate::metrics::{HandlerRun, MetricsLog, MetricsSnapshot, ResultRecord};
use crate::notify::SharedSink;
use crate::resilience::{
    ReconciliationItem, ReconciliationKind, ReconciliationLog, RetryPolicy,
    SharedReconciliationLog,
};
use crate::store::SharedStateStore;
use crate::strikes::StrikeLedger;

/// Error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Handler registry is empty")]
    EmptyRegistry,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Escalation error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Shared reference to EventCoordinator
pub type SharedCoordinator = Arc<EventCoordinator>;

/// Outcome of routing one event
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationResult {
    pub event_id: EventId,
    pub subject_id: SubjectId,
    /// Handlers ran
    pub processed: bool,
    /// Dropped by the dedup window
    pub duplicate: bool,
    /// Ids of every handler invoked, in priority order
    pub agents_involved: Vec<String>,
    pub results: Vec<HandlerResult>,
    pub processing_time_ms: u64,
    /// A side effect or the record itself could not be persisted
    pub degraded: bool,
    pub completed_at: DateTime<Utc>,
    /// Escalations scheduled as side effects
    #[serde(skip)]
    pub escalations: Vec<EscalationHandle>,
}

impl CoordinationResult {
    fn duplicate(event: &Event, processing_time_ms: u64) -> Self {
        Self {
            event_id: event.id.clone(),
            subject_id: event.subject_id.clone(),
            processed: false,
            duplicate: true,
            agents_involved: Vec::new(),
            results: Vec::new(),
            processing_time_ms,
            degraded: false,
            completed_at: Utc::now(),
            escalations: Vec::new(),
        }
    }

    pub fn result_for(&self, handler_id: &str) -> Option<&HandlerResult> {
        self.results.iter().find(|r| r.handler_id == handler_id)
    }

    /// Handlers whose outward notification went out
    pub fn notified_by(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.notifications_sent > 0)
            .map(|r| r.handler_id.as_str())
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_error()).count()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Index of the result that keeps its notification; every other result
/// asking for one is marked suppressed.
///
/// Results arrive in priority order, so the highest-priority qualifying
/// result wins when several are high-confidence.
pub fn apply_suppression(results: &mut [HandlerResult], threshold: f64) -> Option<usize> {
    let winner = results
        .iter()
        .position(|r| r.status == HandlerStatus::Completed && r.claims_notification(threshold))?;
    for (index, result) in results.iter_mut().enumerate() {
        let wants = result
            .outcome
            .as_ref()
            .map(|o| o.wants_notification())
            .unwrap_or(false);
        if index != winner && wants {
            result.notification_suppressed = true;
        }
    }
    Some(winner)
}

/// Routes events to handlers and applies their decisions
pub struct EventCoordinator {
    registry: HandlerRegistry,
    sink: SharedSink,
    store: SharedStateStore,
    dedup: DedupWindow,
    metrics: MetricsLog,
    ledger: Arc<StrikeLedger>,
    scheduler: EscalationScheduler,
    activity: Arc<ActivityTracker>,
    plans: BTreeMap<String, EscalationPlan>,
    threshold: f64,
    handler_timeout: Duration,
    concurrent: bool,
    retry: RetryPolicy,
    reconciliation: SharedReconciliationLog,
}

impl EventCoordinator {
    /// Build a coordinator from validated config. Rules from the `handlers`
    /// table are registered immediately.
    pub fn new(
        config: &CoordinationConfig,
        sink: SharedSink,
        store: SharedStateStore,
    ) -> CoordinatorResult<Self> {
        config.validate()?;

        let reconciliation = ReconciliationLog::new().shared();
        let ledger = Arc::new(
            StrikeLedger::new(store.clone())
                .with_window_days(config.strike_window_days)
                .with_retry(config.retry),
        );
        let scheduler = EscalationScheduler::new(sink.clone(), store.clone())
            .with_ledger(Arc::clone(&ledger))
            .with_time_scale(config.simulation_time_scale)
            .with_retry(config.retry)
            .with_reconciliation(Arc::clone(&reconciliation));

        let mut registry = HandlerRegistry::new();
        for rule in &config.handlers {
            let descriptor = rule
                .clone()
                .into_descriptor()
                .map_err(ConfigError::from)?;
            registry.register(descriptor);
        }

        info!(
            handlers = registry.len(),
            plans = config.escalation_plans.len(),
            concurrent = config.concurrent_handlers,
            "Event coordinator ready"
        );

        Ok(Self {
            registry,
            sink,
            store,
            dedup: DedupWindow::from_minutes(config.dedup_window_minutes),
            metrics: MetricsLog::new(config.metrics_capacity),
            ledger,
            scheduler,
            activity: ActivityTracker::new().shared(),
            plans: config.escalation_plans.clone(),
            threshold: config.high_confidence_threshold,
            handler_timeout: config.handler_timeout(),
            concurrent: config.concurrent_handlers,
            retry: config.retry,
            reconciliation,
        })
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedCoordinator {
        Arc::new(self)
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) {
        debug!(handler = %descriptor.id, priority = descriptor.priority, "Handler registered");
        self.registry.register(descriptor);
    }

    pub fn with_handler(mut self, descriptor: HandlerDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<StrikeLedger> {
        &self.ledger
    }

    pub fn scheduler(&self) -> &EscalationScheduler {
        &self.scheduler
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    /// Route through the coordinator's own registry.
    pub async fn route_event(&self, event: &Event) -> CoordinatorResult<CoordinationResult> {
        self.route_with(event, &self.registry).await
    }

    /// Route through an explicit registry.
    pub async fn route_with(
        &self,
        event: &Event,
        registry: &HandlerRegistry,
    ) -> CoordinatorResult<CoordinationResult> {
        if event.subject_id.trim().is_empty() {
            return Err(CoordinatorError::InvalidEvent("empty subject id".to_string()));
        }
        if event.content.trim().is_empty() {
            return Err(CoordinatorError::InvalidEvent("empty content".to_string()));
        }
        if registry.is_empty() {
            return Err(CoordinatorError::EmptyRegistry);
        }

        let started = Instant::now();
        if !self.dedup.check_and_record(event, Utc::now()) {
            info!(
                event_id = %event.id,
                subject = %event.subject_id,
                "Duplicate event dropped"
            );
            let result = CoordinationResult::duplicate(event, elapsed_ms(started));
            let record = ResultRecord::duplicate(&event.id, &event.subject_id, result.processing_time_ms);
            self.persist_record(record).await;
            return Ok(result);
        }

        let activity_seq = self.activity.record(event);
        let selected = registry.select(event);
        let agents_involved: Vec<String> = selected.iter().map(|d| d.id.clone()).collect();
        debug!(
            event_id = %event.id,
            subject = %event.subject_id,
            preview = %event.preview(),
            handlers = ?agents_involved,
            "Handlers selected"
        );

        let ctx = HandlerContext::new(self.threshold).with_ledger(Arc::clone(&self.ledger));
        let mut results = if self.concurrent {
            join_all(selected.iter().map(|d| self.run_handler(d, event, &ctx))).await
        } else {
            let mut results = Vec::with_capacity(selected.len());
            for descriptor in &selected {
                results.push(self.run_handler(descriptor, event, &ctx).await);
            }
            results
        };

        if let Some(winner) = apply_suppression(&mut results, self.threshold) {
            debug!(
                event_id = %event.id,
                handler = %results[winner].handler_id,
                "High-confidence result keeps the notification"
            );
        }

        let mut degraded = false;
        let mut escalations = Vec::new();
        for result in results.iter_mut() {
            self.dispatch_notification(event, result).await;
            degraded |= self
                .apply_side_effects(event, activity_seq, result, &mut escalations)
                .await;
        }

        let high_confidence = results.iter().any(|r| r.is_high_confidence(self.threshold));
        let processing_time_ms = elapsed_ms(started);
        let completed_at = Utc::now();
        let record = ResultRecord {
            event_id: event.id.clone(),
            subject_id: event.subject_id.clone(),
            processed: true,
            duplicate: false,
            handlers: results
                .iter()
                .map(|r| HandlerRun {
                    handler_id: r.handler_id.clone(),
                    status: r.status,
                    confidence: r.confidence(),
                    elapsed_ms: r.elapsed_ms,
                })
                .collect(),
            high_confidence,
            processing_time_ms,
            degraded,
            completed_at,
        };
        degraded |= !self.persist_record(record).await;

        let result = CoordinationResult {
            event_id: event.id.clone(),
            subject_id: event.subject_id.clone(),
            processed: true,
            duplicate: false,
            agents_involved,
            results,
            processing_time_ms,
            degraded,
            completed_at,
            escalations,
        };
        info!(
            event_id = %result.event_id,
            subject = %result.subject_id,
            handlers = result.agents_involved.len(),
            errors = result.error_count(),
            escalations = result.escalations.len(),
            degraded,
            duration_ms = processing_time_ms,
            "Event routed"
        );
        Ok(result)
    }

    async fn run_handler(
        &self,
        descriptor: &HandlerDescriptor,
        event: &Event,
        ctx: &HandlerContext,
    ) -> HandlerResult {
        let started = Instant::now();
        let call = AssertUnwindSafe(descriptor.handler.handle(event, ctx)).catch_unwind();
        let result = match tokio::time::timeout(self.handler_timeout, call).await {
            Ok(Ok(Ok(mut outcome))) => {
                outcome.confidence = outcome.confidence.clamp(0.0, 1.0);
                if outcome.is_high_confidence(self.threshold) && outcome.wants_notification() {
                    ctx.mark_suppressing();
                }
                HandlerResult::completed(&descriptor.id, descriptor.priority, outcome, elapsed_ms(started))
            }
            Ok(Ok(Err(e))) => HandlerResult::errored(
                &descriptor.id,
                descriptor.priority,
                HandlerStatus::Failed,
                format!("{:#}", e),
                elapsed_ms(started),
            ),
            Ok(Err(panic)) => HandlerResult::errored(
                &descriptor.id,
                descriptor.priority,
                HandlerStatus::Panicked,
                panic_message(panic),
                elapsed_ms(started),
            ),
            Err(_) => HandlerResult::errored(
                &descriptor.id,
                descriptor.priority,
                HandlerStatus::TimedOut,
                format!("timed out after {}s", self.handler_timeout.as_secs()),
                elapsed_ms(started),
            ),
        };

        match result.status {
            HandlerStatus::Completed => debug!(
                event_id = %event.id,
                handler = %result.handler_id,
                confidence = ?result.confidence(),
                elapsed_ms = result.elapsed_ms,
                "Handler completed"
            ),
            status => warn!(
                event_id = %event.id,
                handler = %result.handler_id,
                %status,
                error = result.error.as_deref().unwrap_or(""),
                "Handler did not complete"
            ),
        }
        result
    }

    fn notification_targets(event: &Event, requested: &[String]) -> Vec<String> {
        let raw: Vec<String> = if requested.is_empty() {
            if event.channel_id.is_empty() {
                vec![event.subject_id.clone()]
            } else {
                vec![event.channel_id.clone()]
            }
        } else {
            requested.to_vec()
        };
        let mut targets: Vec<String> = Vec::with_capacity(raw.len());
        for target in raw {
            let target = if target == SUBJECT_TARGET {
                event.subject_id.clone()
            } else {
                target
            };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    async fn dispatch_notification(&self, event: &Event, result: &mut HandlerResult) {
        let Some(request) = result
            .outcome
            .as_ref()
            .and_then(|o| o.notification.clone())
        else {
            return;
        };
        if result.notification_suppressed {
            debug!(
                event_id = %event.id,
                handler = %result.handler_id,
                "Notification suppressed"
            );
            return;
        }

        for target in Self::notification_targets(event, &request.targets) {
            match self
                .sink
                .notify(&target, &request.message, request.severity)
                .await
            {
                Ok(()) => result.notifications_sent += 1,
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        handler = %result.handler_id,
                        target = %target,
                        error = %e,
                        "Notification delivery failed"
                    );
                    result.delivery_failures.push(target);
                }
            }
        }
    }

    fn resolve_plan(&self, plan: &PlanRef) -> Option<(EscalationPlan, String)> {
        match plan {
            PlanRef::Named(name) => self.plans.get(name).map(|p| (p.clone(), name.clone())),
            PlanRef::Inline(plan) => Some((plan.clone(), "inline".to_string())),
        }
    }

    /// Returns `true` when a side effect degraded.
    async fn apply_side_effects(
        &self,
        event: &Event,
        activity_seq: u64,
        result: &mut HandlerResult,
        escalations: &mut Vec<EscalationHandle>,
    ) -> bool {
        let Some(outcome) = result.outcome.clone() else {
            return false;
        };
        let mut degraded = false;

        if let Some(strike) = outcome.strike {
            match self
                .ledger
                .append(&event.subject_id, strike.category, &strike.detail)
                .await
            {
                Ok(timestamp) => result.side_effects.push(SideEffect::StrikeRecorded {
                    category: strike.category,
                    timestamp,
                }),
                Err(e) => {
                    degraded = true;
                    self.reconciliation.flag(
                        ReconciliationKind::StrikeAppend,
                        &event.subject_id,
                        &event.id,
                        &e,
                    );
                    result.side_effects.push(SideEffect::StrikeDeferred {
                        category: strike.category,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(request) = outcome.escalation {
            match self
                .schedule_escalation(event, activity_seq, &result.handler_id, &request)
                .await
            {
                Ok(handle) => {
                    degraded |= !handle.is_durable();
                    result.side_effects.push(SideEffect::EscalationScheduled {
                        escalation_id: handle.id().to_string(),
                        checkpoints: self
                            .resolve_plan(&request.plan)
                            .map(|(p, _)| p.len())
                            .unwrap_or(0),
                        durable: handle.is_durable(),
                    });
                    escalations.push(handle);
                }
                Err(reason) => {
                    warn!(
                        event_id = %event.id,
                        handler = %result.handler_id,
                        reason = %reason,
                        "Escalation request rejected"
                    );
                    result
                        .side_effects
                        .push(SideEffect::EscalationRejected { reason });
                }
            }
        }
        degraded
    }

    async fn schedule_escalation(
        &self,
        event: &Event,
        activity_seq: u64,
        handler_id: &str,
        request: &EscalationRequest,
    ) -> Result<EscalationHandle, String> {
        let (plan, plan_name) = self.resolve_plan(&request.plan).ok_or_else(|| match &request.plan {
            PlanRef::Named(name) => format!("unknown escalation plan '{}'", name),
            PlanRef::Inline(_) => "invalid inline plan".to_string(),
        })?;

        let liveness = subject_liveness(
            &self.activity,
            &event.subject_id,
            activity_seq,
            request.until.as_deref(),
        )
            .map_err(|e| format!("invalid until pattern: {}", e))?;

        let targets = if request.targets.is_empty() {
            vec![SUBJECT_TARGET.to_string()]
        } else {
            request.targets.clone()
        };
        let anchor = request.anchor_time.unwrap_or(event.timestamp);
        let mut task = EscalationTask::new(&event.subject_id, anchor, plan, targets)
            .with_label(format!("{}:{}", handler_id, plan_name));
        if let Some(pattern) = &request.until {
            task = task.with_until(pattern.clone());
        }

        self.scheduler
            .schedule_task(task, Arc::new(liveness))
            .await
            .map_err(|e| {
                self.reconciliation.flag(
                    ReconciliationKind::EscalationSchedule,
                    &event.subject_id,
                    &event.id,
                    &e,
                );
                e.to_string()
            })
    }

    /// Persist a record with retry, then add it to the rolling log.
    /// Returns `false` when persistence failed.
    async fn persist_record(&self, mut record: ResultRecord) -> bool {
        let store = &self.store;
        let persisted = {
            let pending = &record;
            self.retry
                .run("result_persist", move || async move {
                    store.append_result(pending)
                })
                .await
        };
        let ok = match persisted {
            Ok(()) => true,
            Err(e) => {
                record.degraded = true;
                self.reconciliation.flag(
                    ReconciliationKind::ResultPersist,
                    &record.subject_id,
                    &record.event_id,
                    &e,
                );
                false
            }
        };
        self.metrics.record(record);
        ok
    }

    /// Aggregated counters over the rolling log
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(Utc::now())
    }

    /// Side effects that could not be persisted
    pub fn pending_reconciliation(&self) -> Vec<ReconciliationItem> {
        self.reconciliation.pending()
    }

    /// Take the flagged side effects, emptying the log. Returns the items and
    /// how many older ones were dropped because the log was full.
    pub fn drain_reconciliation(&self) -> (Vec<ReconciliationItem>, u64) {
        (self.reconciliation.drain(), self.reconciliation.dropped())
    }

    /// Resume persisted escalations after a restart. A later processed event
    /// from the subject cancels a resumed escalation, subject to the same
    /// `until` pattern it was scheduled with.
    pub async fn recover_escalations(&self) -> CoordinatorResult<Vec<EscalationHandle>> {
        let after = self.activity.current_seq();
        let activity = Arc::clone(&self.activity);
        let handles = self
            .scheduler
            .recover(move |task: &EscalationTask| -> SharedPredicate {
                match subject_liveness(&activity, &task.subject_id, after, task.until.as_deref()) {
                    Ok(liveness) => Arc::new(liveness),
                    Err(e) => {
                        warn!(
                            escalation_id = %task.id,
                            error = %e,
                            "Stored until pattern does not compile, escalation will run to exhaustion"
                        );
                        Arc::new(NeverSatisfied)
                    }
                }
            })
            .await?;
        info!(resumed = handles.len(), "Escalations recovered");
        Ok(handles)
    }
}

/// Liveness for coordinator-driven escalations: subject activity after
/// `after`, optionally matching `until`.
fn subject_liveness(
    tracker: &ActivityTracker,
    subject_id: &str,
    after: u64,
    until: Option<&str>,
) -> Result<ActivityLiveness, regex::Error> {
    let until = until.map(compile_pattern).transpose()?;
    Ok(tracker.watch(subject_id, after, until))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{EventHandler, HandlerOutcome, Interest, NotificationRequest};
    use crate::notify::{MemorySink, Severity};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct Scripted {
        id: &'static str,
        confidence: f64,
        notify: bool,
    }

    #[async_trait]
    impl EventHandler for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        async fn handle(&self, _event: &Event, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
            let mut outcome = HandlerOutcome::new(self.id, self.confidence);
            if self.notify {
                outcome = outcome.notify(
                    NotificationRequest::new(format!("from {}", self.id), Severity::Info)
                        .to_targets(["ops"]),
                );
            }
            Ok(outcome)
        }
    }

    fn descriptor(id: &'static str, priority: i32, confidence: f64, notify: bool) -> HandlerDescriptor {
        HandlerDescriptor::new(
            Arc::new(Scripted {
                id,
                confidence,
                notify,
            }),
            priority,
            Interest::Any,
        )
    }

    fn coordinator(sink: Arc<MemorySink>) -> EventCoordinator {
        let config = CoordinationConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        EventCoordinator::new(&config, sink, MemoryStore::new().shared()).unwrap()
    }

    #[test]
    fn test_apply_suppression_highest_priority_wins() {
        let mut results = vec![
            HandlerResult::completed(
                "a",
                10,
                HandlerOutcome::new("a", 0.9).notify(NotificationRequest::new("a", Severity::Info)),
                1,
            ),
            HandlerResult::completed(
                "b",
                5,
                HandlerOutcome::new("b", 0.95).notify(NotificationRequest::new("b", Severity::Info)),
                1,
            ),
            HandlerResult::completed("c", 1, HandlerOutcome::new("c", 0.2), 1),
        ];
        assert_eq!(apply_suppression(&mut results, 0.8), Some(0));
        assert!(!results[0].notification_suppressed);
        assert!(results[1].notification_suppressed);
        assert!(!results[2].notification_suppressed);
    }

    #[test]
    fn test_no_suppression_without_high_confidence() {
        let mut results = vec![
            HandlerResult::completed(
                "a",
                10,
                HandlerOutcome::new("a", 0.8).notify(NotificationRequest::new("a", Severity::Info)),
                1,
            ),
            HandlerResult::completed(
                "b",
                5,
                HandlerOutcome::new("b", 0.5).notify(NotificationRequest::new("b", Severity::Info)),
                1,
            ),
        ];
        assert_eq!(apply_suppression(&mut results, 0.8), None);
        assert!(results.iter().all(|r| !r.notification_suppressed));
    }

    #[test]
    fn test_notification_targets_default_and_subject() {
        let event = Event::new("u1", "hi");
        assert_eq!(EventCoordinator::notification_targets(&event, &[]), vec!["u1"]);

        let event = event.with_channel("room-7");
        assert_eq!(
            EventCoordinator::notification_targets(&event, &[]),
            vec!["room-7"]
        );
        assert_eq!(
            EventCoordinator::notification_targets(
                &event,
                &["@subject".to_string(), "ops".to_string(), "u1".to_string()]
            ),
            vec!["u1", "ops"]
        );
    }

    #[tokio::test]
    async fn test_invalid_event_and_empty_registry() {
        let coordinator = coordinator(MemorySink::new().shared());
        let err = coordinator
            .route_with(&Event::new("u1", "hi"), &HandlerRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::EmptyRegistry));

        let registry = HandlerRegistry::new().with(descriptor("a", 1, 0.5, false));
        let err = coordinator
            .route_with(&Event::new("u1", "   "), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidEvent(_)));
        let err = coordinator
            .route_with(&Event::new("", "hello"), &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn test_only_winner_notifies() {
        let sink = MemorySink::new().shared();
        let coordinator = coordinator(sink.clone())
            .with_handler(descriptor("high", 10, 0.95, true))
            .with_handler(descriptor("also-high", 5, 0.9, true))
            .with_handler(descriptor("low", 1, 0.3, true));

        let result = coordinator
            .route_event(&Event::new("u1", "status update"))
            .await
            .unwrap();
        assert!(result.processed);
        assert_eq!(result.agents_involved, vec!["high", "also-high", "low"]);
        assert_eq!(result.notified_by(), vec!["high"]);
        assert_eq!(sink.messages_for("ops"), vec!["from high".to_string()]);
    }

    #[tokio::test]
    async fn test_result_serializes_without_handles() {
        let coordinator =
            coordinator(MemorySink::new().shared()).with_handler(descriptor("a", 1, 0.9, true));
        let result = coordinator
            .route_event(&Event::new("u1", "done for the day"))
            .await
            .unwrap();

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["subject_id"], "u1");
        assert_eq!(json["agents_involved"][0], "a");
        assert_eq!(json["results"][0]["status"], "completed");
        assert_eq!(json["results"][0]["notifications_sent"], 1);
        assert!(json.get("escalations").is_none());
    }

    #[tokio::test]
    async fn test_metrics_count_duplicates() {
        let coordinator =
            coordinator(MemorySink::new().shared()).with_handler(descriptor("a", 1, 0.5, false));
        let event = Event::new("u1", "same");
        coordinator.route_event(&event).await.unwrap();
        let dup = coordinator.route_event(&event).await.unwrap();
        assert!(dup.duplicate);
        assert!(!dup.processed);

        let metrics = coordinator.get_metrics();
        assert_eq!(metrics.total_processed, 1);
        assert_eq!(metrics.duplicates, 1);
        assert_eq!(metrics.per_handler.get("a"), Some(&1));
    }
}
