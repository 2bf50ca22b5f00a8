//! Field-Service Coordination Library
//!
//! This library provides:
//! - Event routing to prioritized handlers with duplicate suppression
//! - A rolling strike ledger per subject
//! - Timed, cancellable escalation plans that survive restarts
//!
//! # Components
//!
//! ## Event Coordinator
//! - `EventCoordinator::route_event`: dedup, select handlers, run them with
//!   timeout and panic isolation, apply the notification suppression policy,
//!   then apply strike and escalation side effects
//! - `EventCoordinator::get_metrics`: aggregates over the rolling result log
//!
//! ## Escalation Scheduler
//! - `EscalationScheduler::schedule`: walk checkpoints anchored to a due time
//! - `EscalationHandle::cancel`: stop before the next checkpoint fires
//! - `EscalationScheduler::recover`: resume persisted escalations
//!
//! ## Strike Ledger
//! - `StrikeLedger::append`: record a strike for a subject
//! - `StrikeLedger::active_count`: strikes inside the rolling window
//!
//! # Usage
//!
//! ```toml
//! # coordination.toml
//! dedup_window_minutes = 5
//! high_confidence_threshold = 0.8
//! simulation_time_scale = 60.0
//!
//! [[handlers]]
//! id = "late-arrival"
//! priority = 10
//! keywords = ["running late", "stuck in traffic"]
//! confidence = 0.9
//! escalation = "late_arrival"
//! until = "arrived|on site"
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod escalation;
pub mod event;
pub mod handler;
pub mod liveness;
pub mod metrics;
pub mod notify;
pub mod resilience;
pub mod rules;
pub mod store;
pub mod strikes;

// Re-export coordinator types
pub use coordinator::{
    CoordinationResult, CoordinatorError, CoordinatorResult, EventCoordinator, SharedCoordinator,
};

// Re-export config types
pub use config::{ConfigError, CoordinationConfig, LATE_ARRIVAL_PLAN};

// Re-export event and handler types
pub use event::{Attachment, Event, EventId, SubjectId};
pub use handler::{
    EscalationRequest, EventHandler, HandlerContext, HandlerDescriptor, HandlerOutcome,
    HandlerRegistry, HandlerResult, HandlerStatus, Interest, NotificationRequest, PlanRef,
    SharedHandler, SideEffect,
};
pub use rules::{HandlerRule, RuleError, RuleHandler};

// Re-export escalation types
pub use escalation::{
    CancelReason, Checkpoint, EscalationHandle, EscalationPlan, EscalationScheduler,
    EscalationState, EscalationTask, SchedulerError,
};
pub use liveness::{
    ActivityLiveness, ActivityTracker, FnPredicate, LivenessPredicate, SharedPredicate,
};

// Re-export notification types
pub use notify::{MemorySink, NotificationSink, NotifyError, Severity, SharedSink, TracingSink};

// Re-export strike ledger types
pub use strikes::{LedgerError, StrikeCategory, StrikeLedger, StrikeRecord, StrikeTally};

// Re-export store types
pub use store::{MemoryStore, SharedStateStore, StateStore, StoreError};
#[cfg(feature = "heavy-state")]
pub use store::RocksStore;

// Re-export dedup, metrics and resilience types
pub use dedup::DedupWindow;
pub use metrics::{MetricsLog, MetricsSnapshot, ResultRecord};
pub use resilience::{ReconciliationItem, ReconciliationKind, ReconciliationLog, RetryPolicy};
