//! Integration tests for the Event Coordinator
//!
//! Drives `route_event` end to end against the in-memory store and sink:
//! selection, dedup, handler isolation, the notification suppression
//! policy and degraded persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldops_coordination::rules::RuleNotification;
use fieldops_coordination::{
    CoordinationConfig, Event, EventCoordinator, EventHandler, HandlerContext, HandlerDescriptor,
    HandlerOutcome, HandlerRule, HandlerStatus, Interest, MemorySink, MemoryStore,
    NotificationRequest, ReconciliationKind, RetryPolicy, Severity, StateStore, StrikeCategory,
};

/// Counts invocations and returns a fixed outcome
struct Counting {
    id: &'static str,
    confidence: f64,
    notify: bool,
    calls: AtomicUsize,
}

impl Counting {
    fn new(id: &'static str, confidence: f64, notify: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            confidence,
            notify,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for Counting {
    fn id(&self) -> &str {
        self.id
    }

    async fn handle(&self, _event: &Event, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcome = HandlerOutcome::new(self.id, self.confidence);
        if self.notify {
            outcome = outcome.notify(
                NotificationRequest::new(format!("{} says hi", self.id), Severity::Info)
                    .to_targets(["ops"]),
            );
        }
        Ok(outcome)
    }
}

enum Misbehaviour {
    Fail,
    Panic,
    Hang,
}

struct Broken {
    id: &'static str,
    how: Misbehaviour,
}

#[async_trait]
impl EventHandler for Broken {
    fn id(&self) -> &str {
        self.id
    }

    async fn handle(&self, _event: &Event, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        match self.how {
            Misbehaviour::Fail => anyhow::bail!("upstream lookup failed"),
            Misbehaviour::Panic => panic!("handler bug"),
            Misbehaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(HandlerOutcome::new(self.id, 1.0))
            }
        }
    }
}

/// Records what the context reported about suppression
struct Observer {
    saw_suppression: AtomicUsize,
}

#[async_trait]
impl EventHandler for Observer {
    fn id(&self) -> &str {
        "observer"
    }

    async fn handle(&self, _event: &Event, ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        if ctx.will_be_suppressed() {
            self.saw_suppression.fetch_add(1, Ordering::SeqCst);
        }
        Ok(HandlerOutcome::new("observe", 0.1))
    }
}

fn test_config() -> CoordinationConfig {
    CoordinationConfig {
        retry: RetryPolicy::none(),
        handler_timeout_secs: 2,
        ..Default::default()
    }
}

fn punctuality_rule() -> HandlerRule {
    HandlerRule {
        priority: 50,
        keywords: vec!["late".into(), "traffic".into()],
        confidence: 0.9,
        notify: Some(RuleNotification {
            message: "{subject} is running late".into(),
            severity: Severity::Warn,
            targets: vec!["ops".into()],
        }),
        ..HandlerRule::new("punctuality")
    }
}

fn catch_all_rule() -> HandlerRule {
    HandlerRule {
        priority: 1,
        confidence: 0.3,
        ..HandlerRule::new("log-everything")
    }
}

/// Test: a late-running message selects the punctuality handler and the catch-all
#[tokio::test]
async fn test_late_message_selects_punctuality_and_catch_all() {
    let config = CoordinationConfig {
        handlers: vec![catch_all_rule(), punctuality_rule()],
        ..test_config()
    };
    let sink = MemorySink::new().shared();
    let coordinator = EventCoordinator::new(&config, sink.clone(), MemoryStore::new().shared()).unwrap();

    let result = coordinator
        .route_event(&Event::new("u1", "running 20 min late"))
        .await
        .unwrap();

    assert!(result.processed);
    assert_eq!(result.agents_involved, vec!["punctuality", "log-everything"]);
    assert_eq!(sink.messages_for("ops"), vec!["u1 is running late".to_string()]);
}

/// Test: fallback handlers only run when nothing else matched
#[tokio::test]
async fn test_fallback_runs_only_when_unmatched() {
    let fallback = HandlerRule {
        fallback: true,
        ..HandlerRule::new("triage")
    };
    let config = CoordinationConfig {
        handlers: vec![punctuality_rule(), fallback],
        ..test_config()
    };
    let coordinator =
        EventCoordinator::new(&config, MemorySink::new().shared(), MemoryStore::new().shared()).unwrap();

    let late = coordinator
        .route_event(&Event::new("u1", "stuck in traffic"))
        .await
        .unwrap();
    assert_eq!(late.agents_involved, vec!["punctuality"]);

    let other = coordinator
        .route_event(&Event::new("u1", "customer wants a callback"))
        .await
        .unwrap();
    assert_eq!(other.agents_involved, vec!["triage"]);
}

/// Test: the same content from the same subject inside the window runs handlers once
#[tokio::test]
async fn test_duplicate_inside_window_runs_handlers_once() {
    let counting = Counting::new("counter", 0.5, false);
    let coordinator = EventCoordinator::new(&test_config(), MemorySink::new().shared(), MemoryStore::new().shared())
        .unwrap()
        .with_handler(HandlerDescriptor::new(counting.clone(), 1, Interest::Any));

    let first = coordinator
        .route_event(&Event::new("u1", "Job 42 done"))
        .await
        .unwrap();
    // Whitespace and case differences normalize to the same fingerprint
    let second = coordinator
        .route_event(&Event::new("u1", "  job 42   DONE "))
        .await
        .unwrap();
    let other_subject = coordinator
        .route_event(&Event::new("u2", "Job 42 done"))
        .await
        .unwrap();

    assert!(first.processed);
    assert!(second.duplicate);
    assert!(second.agents_involved.is_empty());
    assert!(other_subject.processed);
    assert_eq!(counting.calls(), 2);
}

/// Test: failing, panicking and hanging handlers never starve the others
#[tokio::test(start_paused = true)]
async fn test_broken_handlers_do_not_starve_others() {
    for concurrent in [false, true] {
        let healthy = Counting::new("healthy", 0.5, false);
        let config = CoordinationConfig {
            concurrent_handlers: concurrent,
            ..test_config()
        };
        let coordinator =
            EventCoordinator::new(&config, MemorySink::new().shared(), MemoryStore::new().shared())
                .unwrap()
                .with_handler(HandlerDescriptor::new(
                    Arc::new(Broken { id: "fails", how: Misbehaviour::Fail }),
                    40,
                    Interest::Any,
                ))
                .with_handler(HandlerDescriptor::new(
                    Arc::new(Broken { id: "panics", how: Misbehaviour::Panic }),
                    30,
                    Interest::Any,
                ))
                .with_handler(HandlerDescriptor::new(
                    Arc::new(Broken { id: "hangs", how: Misbehaviour::Hang }),
                    20,
                    Interest::Any,
                ))
                .with_handler(HandlerDescriptor::new(healthy.clone(), 10, Interest::Any));

        let result = coordinator
            .route_event(&Event::new("u1", "anything at all"))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 4);
        assert_eq!(result.result_for("fails").unwrap().status, HandlerStatus::Failed);
        assert_eq!(result.result_for("panics").unwrap().status, HandlerStatus::Panicked);
        assert_eq!(result.result_for("hangs").unwrap().status, HandlerStatus::TimedOut);
        assert_eq!(result.result_for("healthy").unwrap().status, HandlerStatus::Completed);
        assert_eq!(result.error_count(), 3);
        assert_eq!(healthy.calls(), 1);

        let metrics = coordinator.get_metrics();
        assert_eq!(metrics.handler_errors, 3);
    }
}

/// Test: an event whose every handler errors is still processed and recorded
#[tokio::test(start_paused = true)]
async fn test_all_handlers_failing_still_completes() {
    let sink = MemorySink::new().shared();
    let coordinator = EventCoordinator::new(&test_config(), sink.clone(), MemoryStore::new().shared())
        .unwrap()
        .with_handler(HandlerDescriptor::new(
            Arc::new(Broken { id: "fails", how: Misbehaviour::Fail }),
            30,
            Interest::Any,
        ))
        .with_handler(HandlerDescriptor::new(
            Arc::new(Broken { id: "panics", how: Misbehaviour::Panic }),
            20,
            Interest::Any,
        ))
        .with_handler(HandlerDescriptor::new(
            Arc::new(Broken { id: "hangs", how: Misbehaviour::Hang }),
            10,
            Interest::Any,
        ));

    let result = coordinator
        .route_event(&Event::new("u5", "nobody can handle this"))
        .await
        .unwrap();

    assert!(result.processed);
    assert!(!result.duplicate);
    assert!(!result.degraded);
    assert_eq!(result.agents_involved, vec!["fails", "panics", "hangs"]);
    assert_eq!(result.results.len(), 3);
    assert_eq!(result.error_count(), result.results.len());
    assert!(result.notified_by().is_empty());
    assert!(sink.is_empty());

    let metrics = coordinator.get_metrics();
    assert_eq!(metrics.total_processed, 1);
    assert_eq!(metrics.handler_errors, 3);
}

/// Test: one high-confidence notifier suppresses the others' notifications
#[tokio::test]
async fn test_high_confidence_suppresses_other_notifications() {
    let sink = MemorySink::new().shared();
    let observer = Arc::new(Observer {
        saw_suppression: AtomicUsize::new(0),
    });
    let coordinator = EventCoordinator::new(&test_config(), sink.clone(), MemoryStore::new().shared())
        .unwrap()
        .with_handler(HandlerDescriptor::new(Counting::new("confident", 0.95, true), 30, Interest::Any))
        .with_handler(HandlerDescriptor::new(Counting::new("chatty", 0.4, true), 20, Interest::Any))
        .with_handler(HandlerDescriptor::new(observer.clone(), 10, Interest::Any));

    let result = coordinator
        .route_event(&Event::new("u1", "van broke down"))
        .await
        .unwrap();

    assert_eq!(result.notified_by(), vec!["confident"]);
    assert!(result.result_for("chatty").unwrap().notification_suppressed);
    assert_eq!(sink.messages_for("ops"), vec!["confident says hi".to_string()]);
    // Sequential mode: later handlers can see the pending suppression
    assert_eq!(observer.saw_suppression.load(Ordering::SeqCst), 1);
}

/// Test: without a high-confidence result everyone who asked notifies
#[tokio::test]
async fn test_low_confidence_notifications_all_go_out() {
    let sink = MemorySink::new().shared();
    let coordinator = EventCoordinator::new(&test_config(), sink.clone(), MemoryStore::new().shared())
        .unwrap()
        .with_handler(HandlerDescriptor::new(Counting::new("a", 0.8, true), 2, Interest::Any))
        .with_handler(HandlerDescriptor::new(Counting::new("b", 0.2, true), 1, Interest::Any));

    let result = coordinator
        .route_event(&Event::new("u1", "van broke down"))
        .await
        .unwrap();

    // 0.8 is not strictly above the default threshold
    assert_eq!(result.notified_by(), vec!["a", "b"]);
    assert_eq!(sink.len(), 2);
}

/// Test: a strike-producing rule writes to the ledger
#[tokio::test]
async fn test_rule_strike_lands_in_ledger() {
    let rule = HandlerRule {
        patterns: vec![r"photos?\s+missing".into()],
        strike: Some(StrikeCategory::Quality),
        ..HandlerRule::new("quality")
    };
    let config = CoordinationConfig {
        handlers: vec![rule],
        ..test_config()
    };
    let store = MemoryStore::new().shared();
    let coordinator = EventCoordinator::new(&config, MemorySink::new().shared(), store.clone()).unwrap();

    let result = coordinator
        .route_event(&Event::new("u2", "Job 7 closed, PHOTOS missing"))
        .await
        .unwrap();

    assert!(!result.degraded);
    assert_eq!(
        coordinator
            .ledger()
            .active_count("u2", StrikeCategory::Quality)
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.result_count(), 1);
}

/// Test: a store outage degrades the result and flags reconciliation items
#[tokio::test]
async fn test_store_outage_degrades_and_flags() {
    let rule = HandlerRule {
        keywords: vec!["late".into()],
        strike: Some(StrikeCategory::Punctuality),
        ..HandlerRule::new("punctuality")
    };
    let config = CoordinationConfig {
        handlers: vec![rule],
        ..test_config()
    };
    let store = MemoryStore::new().shared();
    store.set_available(false);
    let coordinator = EventCoordinator::new(&config, MemorySink::new().shared(), store.clone()).unwrap();

    let result = coordinator
        .route_event(&Event::new("u1", "late again"))
        .await
        .unwrap();

    assert!(result.processed);
    assert!(result.degraded);
    let kinds: Vec<ReconciliationKind> = coordinator
        .pending_reconciliation()
        .into_iter()
        .map(|item| item.kind)
        .collect();
    assert!(kinds.contains(&ReconciliationKind::StrikeAppend));
    assert!(kinds.contains(&ReconciliationKind::ResultPersist));
    assert_eq!(coordinator.get_metrics().degraded, 1);

    let (drained, dropped) = coordinator.drain_reconciliation();
    assert_eq!(drained.len(), kinds.len());
    assert_eq!(dropped, 0);
    assert!(coordinator.pending_reconciliation().is_empty());

    store.set_available(true);
    let since = chrono::Utc::now() - chrono::Duration::days(1);
    assert!(store
        .results_between(since, chrono::Utc::now())
        .unwrap()
        .is_empty());
}

/// Test: handler rules load from a TOML file
#[tokio::test]
async fn test_config_file_drives_registry() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("coordination.toml");
    std::fs::write(
        &path,
        r#"
high_confidence_threshold = 0.7

[retry]
max_attempts = 1

[[handlers]]
id = "late-arrival"
priority = 10
keywords = ["running late"]
confidence = 0.9
escalation = "late_arrival"
until = "arrived|on site"

[[handlers]]
id = "fallback"
fallback = true
"#,
    )
    .unwrap();

    let config = CoordinationConfig::load(&path).unwrap();
    assert!(config.plan("late_arrival").is_some());

    let coordinator =
        EventCoordinator::new(&config, MemorySink::new().shared(), MemoryStore::new().shared()).unwrap();
    assert_eq!(coordinator.registry().ids(), vec!["late-arrival", "fallback"]);
}

/// Test: rules pointing at unknown plans are rejected up front
#[test]
fn test_unknown_plan_rejected() {
    let rule = HandlerRule {
        escalation: Some("no_such_plan".into()),
        ..HandlerRule::new("broken")
    };
    let config = CoordinationConfig {
        handlers: vec![rule],
        ..test_config()
    };
    assert!(EventCoordinator::new(&config, MemorySink::new().shared(), MemoryStore::new().shared()).is_err());
}
