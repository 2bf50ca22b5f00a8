//! Timed, cancellable escalation tasks
//!
//! Each scheduled task runs on its own tokio task. Before every checkpoint it
//! sleeps until `anchor + offset` (scaled by the simulation time scale), then
//! re-checks the cancel token and the liveness predicate. Only when both say
//! "keep going" does the checkpoint fire.
//!
//! ```text
//! Scheduled ──sleep──► cancelled? ──yes──► Cancelled (requested)
//!     ▲                    │ no
//!     │               liveness? ──yes──► Cancelled (liveness satisfied)
//!     │                    │ no / error
//!     └──── more ◄──── fire checkpoint ──last──► Exhausted
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{
    CancelReason, Checkpoint, EscalationId, EscalationPlan, EscalationState, EscalationTask,
    FiredCheckpoint, PlanError,
};
use crate::liveness::SharedPredicate;
use crate::notify::SharedSink;
use crate::resilience::{
    ReconciliationKind, ReconciliationLog, RetryPolicy, SharedReconciliationLog,
};
use crate::store::{SharedStateStore, StoreError};
use crate::strikes::StrikeLedger;

/// Waits longer than this are capped (far enough to never matter).
const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Error type for scheduling
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid escalation plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("Escalation subject id is empty")]
    InvalidSubject,

    #[error("Escalation store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for scheduling
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Latest observable state of a running task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationSnapshot {
    pub state: EscalationState,
    pub fired: usize,
    pub next_checkpoint: usize,
}

impl EscalationSnapshot {
    fn of(task: &EscalationTask) -> Self {
        Self {
            state: task.state,
            fired: task.fired.len(),
            next_checkpoint: task.next_checkpoint,
        }
    }
}

/// Caller-held handle to a scheduled escalation
#[derive(Debug, Clone)]
pub struct EscalationHandle {
    id: EscalationId,
    subject_id: String,
    durable: bool,
    token: CancellationToken,
    status: watch::Receiver<EscalationSnapshot>,
}

impl EscalationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Whether the task was persisted before its timer started
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn snapshot(&self) -> EscalationSnapshot {
        *self.status.borrow()
    }

    pub fn state(&self) -> EscalationState {
        self.snapshot().state
    }

    /// Number of checkpoints fired so far
    pub fn fired(&self) -> usize {
        self.snapshot().fired
    }

    /// Request cancellation. Returns `false` when the task already finished
    /// or cancellation was already requested.
    pub fn cancel(&self) -> bool {
        if self.state().is_terminal() || self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Resolve once the task reaches a terminal state.
    pub async fn wait(&self) -> EscalationState {
        let mut status = self.status.clone();
        loop {
            let state = status.borrow_and_update().state;
            if state.is_terminal() {
                return state;
            }
            if status.changed().await.is_err() {
                return status.borrow().state;
            }
        }
    }
}

/// Drives escalation tasks against a notification sink
#[derive(Clone)]
pub struct EscalationScheduler {
    sink: SharedSink,
    store: SharedStateStore,
    ledger: Option<Arc<StrikeLedger>>,
    time_scale: f64,
    retry: RetryPolicy,
    reconciliation: SharedReconciliationLog,
}

impl EscalationScheduler {
    pub fn new(sink: SharedSink, store: SharedStateStore) -> Self {
        Self {
            sink,
            store,
            ledger: None,
            time_scale: 1.0,
            retry: RetryPolicy::default(),
            reconciliation: ReconciliationLog::new().shared(),
        }
    }

    /// Ledger used by checkpoints marked `record`
    pub fn with_ledger(mut self, ledger: Arc<StrikeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Divide every wait by `scale`; non-positive values are ignored.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        if scale.is_finite() && scale > 0.0 {
            self.time_scale = scale;
        } else {
            warn!(scale, "Ignoring invalid escalation time scale");
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconciliation(mut self, log: SharedReconciliationLog) -> Self {
        self.reconciliation = log;
        self
    }

    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }

    pub fn reconciliation(&self) -> &SharedReconciliationLog {
        &self.reconciliation
    }

    /// Validate `checkpoints` and schedule them for `subject_id`.
    pub async fn schedule(
        &self,
        subject_id: &str,
        anchor_time: DateTime<Utc>,
        checkpoints: Vec<Checkpoint>,
        liveness: SharedPredicate,
        targets: Vec<String>,
    ) -> SchedulerResult<EscalationHandle> {
        let plan = EscalationPlan::new(checkpoints)?;
        self.schedule_plan(subject_id, anchor_time, plan, targets, liveness, None)
            .await
    }

    /// Schedule an already validated plan.
    pub async fn schedule_plan(
        &self,
        subject_id: &str,
        anchor_time: DateTime<Utc>,
        plan: EscalationPlan,
        targets: Vec<String>,
        liveness: SharedPredicate,
        label: Option<&str>,
    ) -> SchedulerResult<EscalationHandle> {
        let mut task = EscalationTask::new(subject_id, anchor_time, plan, targets);
        if let Some(label) = label {
            task = task.with_label(label);
        }
        self.schedule_task(task, liveness).await
    }

    /// Schedule a freshly built task, persisting it before the timer starts.
    pub async fn schedule_task(
        &self,
        task: EscalationTask,
        liveness: SharedPredicate,
    ) -> SchedulerResult<EscalationHandle> {
        if task.subject_id.trim().is_empty() {
            return Err(SchedulerError::InvalidSubject);
        }

        let durable = self.persist(&task).await;
        info!(
            escalation_id = %task.id,
            subject = %task.subject_id,
            anchor = %task.anchor_time,
            checkpoints = task.checkpoints.len(),
            until = task.until.as_deref().unwrap_or(""),
            durable,
            "Escalation scheduled"
        );
        Ok(self.spawn(task, liveness, durable))
    }

    /// Resume every non-terminal persisted task from its next checkpoint.
    pub async fn recover<F>(&self, predicate_for: F) -> SchedulerResult<Vec<EscalationHandle>>
    where
        F: Fn(&EscalationTask) -> SharedPredicate,
    {
        let store = &self.store;
        let tasks = self
            .retry
            .run("escalation_recover", move || async move {
                store.pending_escalations()
            })
            .await?;

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            info!(
                escalation_id = %task.id,
                status = %task.status_line(),
                next_checkpoint = task.next_checkpoint,
                "Resuming escalation"
            );
            let liveness = predicate_for(&task);
            handles.push(self.spawn(task, liveness, true));
        }
        Ok(handles)
    }

    /// Cancel through a handle; a no-op for finished tasks.
    pub fn cancel(&self, handle: &EscalationHandle) -> bool {
        handle.cancel()
    }

    fn spawn(
        &self,
        task: EscalationTask,
        liveness: SharedPredicate,
        durable: bool,
    ) -> EscalationHandle {
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(EscalationSnapshot::of(&task));
        let handle = EscalationHandle {
            id: task.id.clone(),
            subject_id: task.subject_id.clone(),
            durable,
            token: token.clone(),
            status: rx,
        };
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.drive(task, liveness, token, tx).await;
        });
        handle
    }

    fn deadline(&self, clock_start: Instant, wall_start: DateTime<Utc>, due: DateTime<Utc>) -> Instant {
        let wait = (due - wall_start).to_std().unwrap_or(Duration::ZERO);
        let scaled = Duration::try_from_secs_f64(wait.as_secs_f64() / self.time_scale)
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);
        clock_start + scaled
    }

    async fn drive(
        self,
        mut task: EscalationTask,
        liveness: SharedPredicate,
        token: CancellationToken,
        status: watch::Sender<EscalationSnapshot>,
    ) {
        let wall_start = Utc::now();
        let clock_start = Instant::now();
        let mut stop: Option<CancelReason> = None;

        while let Some(checkpoint) = task.pending_checkpoint().cloned() {
            let index = task.next_checkpoint;
            let Some(due) = task.fire_time(index) else {
                break;
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(self.deadline(clock_start, wall_start, due)) => {}
            }

            if token.is_cancelled() {
                stop = Some(CancelReason::Requested);
                break;
            }
            let satisfied = match liveness.is_satisfied(&task.subject_id).await {
                Ok(satisfied) => satisfied,
                Err(e) => {
                    warn!(
                        escalation_id = %task.id,
                        subject = %task.subject_id,
                        error = %e,
                        "Liveness check failed, treating as not satisfied"
                    );
                    false
                }
            };
            if satisfied {
                stop = Some(CancelReason::LivenessSatisfied);
                break;
            }
            if token.is_cancelled() {
                stop = Some(CancelReason::Requested);
                break;
            }

            let fired = self.fire(&task, index, &checkpoint).await;
            if let Err(e) = task.record_fire(fired) {
                warn!(escalation_id = %task.id, error = %e, "Escalation bookkeeping failed");
                stop = Some(CancelReason::Requested);
                break;
            }
            self.persist(&task).await;
            status.send_replace(EscalationSnapshot::of(&task));
        }

        if let Some(reason) = stop {
            if task.cancel(reason) {
                self.persist(&task).await;
            }
        }
        info!(
            escalation_id = %task.id,
            subject = %task.subject_id,
            state = %task.state,
            fired = task.fired.len(),
            reason = ?task.cancel_reason,
            "Escalation finished"
        );
        status.send_replace(EscalationSnapshot::of(&task));
    }

    async fn fire(&self, task: &EscalationTask, index: usize, checkpoint: &Checkpoint) -> FiredCheckpoint {
        let message = task.render_message(index);
        let targets = task.resolve_targets(checkpoint);
        if targets.is_empty() {
            warn!(
                escalation_id = %task.id,
                checkpoint = index,
                "Checkpoint has no targets"
            );
        }

        let mut delivered = 0;
        let mut failed_targets = Vec::new();
        for target in &targets {
            match self.sink.notify(target, &message, checkpoint.severity).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        escalation_id = %task.id,
                        checkpoint = index,
                        target = %target,
                        error = %e,
                        "Escalation delivery failed"
                    );
                    failed_targets.push(target.clone());
                }
            }
        }

        let mut strike_recorded = false;
        if let Some(category) = checkpoint.record {
            match &self.ledger {
                Some(ledger) => {
                    let detail = format!(
                        "escalation {} checkpoint {} ({}m)",
                        task.label.as_deref().unwrap_or(&task.id),
                        index + 1,
                        checkpoint.offset_minutes
                    );
                    match ledger.append(&task.subject_id, category, &detail).await {
                        Ok(_) => strike_recorded = true,
                        Err(e) => self.reconciliation.flag(
                            ReconciliationKind::StrikeAppend,
                            &task.subject_id,
                            &task.id,
                            e,
                        ),
                    }
                }
                None => debug!(
                    escalation_id = %task.id,
                    "No strike ledger attached, skipping record"
                ),
            }
        }

        info!(
            escalation_id = %task.id,
            subject = %task.subject_id,
            checkpoint = index,
            severity = %checkpoint.severity,
            delivered,
            failed = failed_targets.len(),
            strike_recorded,
            "Escalation checkpoint fired"
        );
        FiredCheckpoint {
            index,
            severity: checkpoint.severity,
            fired_at: Utc::now(),
            delivered,
            failed_targets,
            strike_recorded,
        }
    }

    /// Persist with retry; flags the task for reconciliation on failure.
    async fn persist(&self, task: &EscalationTask) -> bool {
        let store = &self.store;
        match self
            .retry
            .run("escalation_persist", move || async move {
                store.put_escalation(task)
            })
            .await
        {
            Ok(()) => true,
            Err(e) => {
                self.reconciliation.flag(
                    ReconciliationKind::EscalationPersist,
                    &task.subject_id,
                    &task.id,
                    e,
                );
                false
            }
        }
    }
}
