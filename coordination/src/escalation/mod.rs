//! Escalation Scheduler: time-delayed, cancellable checkpoint sequences
//!
//! An escalation is anchored to the moment some expected action was due
//! (a technician's arrival, a job report) and walks an ordered list of
//! checkpoints until either the action happens or the plan runs out.
//!
//! ```text
//! anchor ─── +5m warn @subject ─── +10m alert ops ─── +15m critical all + strike
//!              │                     │                   │
//!              └ liveness? ──────────┴ liveness? ────────┴ liveness?
//!                 true → Cancelled, nothing later fires
//! ```

pub mod scheduler;
pub mod state;

pub use scheduler::{
    EscalationHandle, EscalationScheduler, EscalationSnapshot, SchedulerError, SchedulerResult,
};
pub use state::{
    CancelReason, Checkpoint, EscalationId, EscalationPlan, EscalationState, EscalationTask,
    FiredCheckpoint, PlanError, TransitionError, SUBJECT_TARGET,
};
