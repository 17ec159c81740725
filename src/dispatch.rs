//! Deadline-driven task dispatch.
//!
//! One dispatcher runs per instance. Each pass claims every due task from
//! the shared store, drops claims on guilds the instance does not own, and
//! settles the rest through the handler registry. The run loop sleeps until
//! the nearest known deadline and wakes early when a manager signals that
//! something sooner was scheduled, so an expiry landing in the next second
//! still fires on time.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::constants::{
    CLAIM_BATCH_LIMIT, MAX_TASK_ATTEMPTS, POLL_FALLBACK_SECS, RETRY_BASE_SECS, RETRY_CAP_SECS,
    SWEEP_INTERVAL_SECS,
};
use crate::error::{HandlerError, StoreError};
use crate::handler::HandlerRegistry;
use crate::recurring::RecurringTimerManager;
use crate::router::InstanceRouter;
use crate::store::Store;
use crate::subscription::SubscriptionRegistry;
use crate::task::{ClaimedTask, TaskOutcome, TaskPayload};

/// What one dispatcher pass did
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickReport {
    /// Tasks settled as done
    pub executed: usize,
    /// Tasks requeued with backoff
    pub retried: usize,
    /// Tasks dead-lettered
    pub dead: usize,
    /// Claims released because another instance owns the guild
    pub released: usize,
    /// Recurring timers fired
    pub recurring_fired: usize,
}

/// Exponential retry delay: base doubles per recorded attempt, capped
fn retry_delay(attempts: i32) -> Duration {
    let exp = attempts.clamp(0, 10) as u32;
    let secs = RETRY_BASE_SECS.saturating_mul(1i64 << exp).min(RETRY_CAP_SECS);
    Duration::seconds(secs)
}

/// Claims due work and drives it through handlers, timers and sweeps
pub struct Dispatcher<S> {
    store: Arc<S>,
    router: Arc<InstanceRouter>,
    registry: Arc<HandlerRegistry>,
    recurring: Arc<RecurringTimerManager<S>>,
    subscriptions: Arc<SubscriptionRegistry<S>>,
    wake_rx: watch::Receiver<()>,
    claim_batch_limit: i64,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        router: Arc<InstanceRouter>,
        registry: Arc<HandlerRegistry>,
        recurring: Arc<RecurringTimerManager<S>>,
        subscriptions: Arc<SubscriptionRegistry<S>>,
        wake_rx: watch::Receiver<()>,
    ) -> Self {
        Self {
            store,
            router,
            registry,
            recurring,
            subscriptions,
            wake_rx,
            claim_batch_limit: CLAIM_BATCH_LIMIT,
            last_sweep: Mutex::new(None),
        }
    }

    /// Override the per-pass claim batch size
    pub fn with_claim_batch_limit(mut self, limit: i64) -> Self {
        self.claim_batch_limit = limit;
        self
    }

    /// One dispatcher pass at an explicit instant
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, StoreError> {
        self.router.refresh_if_stale(self.store.as_ref(), now).await?;

        let mut report = TickReport::default();
        let claimed = self
            .store
            .claim_due(self.router.instance_id(), now, self.claim_batch_limit)
            .await?;
        if !claimed.is_empty() {
            debug!("Claimed {} due tasks", claimed.len());
        }

        for task in claimed {
            // Guild-scoped work belongs to the assigned instance only;
            // platform-scoped work (no guild) is claimable by anyone
            if let Some(guild_id) = task.guild_id
                && !self.router.owns_guild(guild_id)
            {
                self.store.release(task.id).await?;
                report.released += 1;
                continue;
            }
            self.settle(&task, now, &mut report).await?;
        }

        report.recurring_fired = self.recurring.run_due(&self.router, now).await?;

        if self.sweep_due(now) {
            self.subscriptions.sweep(now).await?;
            *self.last_sweep.lock().expect("sweep clock lock") = Some(now);
        }

        Ok(report)
    }

    /// Execute one claimed task and resolve it per the failure taxonomy
    async fn settle(
        &self,
        task: &ClaimedTask,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        let (payload, result) = match TaskPayload::decode(&task.kind, task.payload.clone()) {
            Ok(payload) => {
                let result = match self.registry.get(&task.kind) {
                    Some(handler) => handler.handle(task, payload.clone()).await,
                    None => Err(HandlerError::Corrupt(format!(
                        "no handler registered for kind `{}`",
                        task.kind
                    ))),
                };
                (Some(payload), result)
            }
            Err(e) => (None, Err(e)),
        };

        let outcome = match result {
            Ok(()) => {
                report.executed += 1;
                TaskOutcome::Done
            }
            Err(HandlerError::Transient(detail)) => {
                if task.attempts + 1 >= MAX_TASK_ATTEMPTS {
                    error!(
                        "Task {} ({}) failed {} times, dead-lettering: {detail}",
                        task.id,
                        task.kind,
                        task.attempts + 1
                    );
                    report.dead += 1;
                    TaskOutcome::Dead
                } else {
                    let delay = retry_delay(task.attempts);
                    warn!(
                        "Task {} ({}) failed transiently, retrying in {}s: {detail}",
                        task.id,
                        task.kind,
                        delay.num_seconds()
                    );
                    report.retried += 1;
                    TaskOutcome::RetryAt(now + delay)
                }
            }
            Err(HandlerError::PermissionDenied(detail)) => {
                // Retrying cannot grant a capability; the handler already
                // recorded what staff need to see
                warn!("Task {} ({}) abandoned: {detail}", task.id, task.kind);
                report.executed += 1;
                TaskOutcome::Done
            }
            Err(HandlerError::NotFound) => {
                info!(
                    "Task {} ({}) target is gone, nothing to do",
                    task.id, task.kind
                );
                report.executed += 1;
                TaskOutcome::Done
            }
            Err(HandlerError::Corrupt(detail)) => {
                error!("Task {} ({}) is corrupt: {detail}", task.id, task.kind);
                report.dead += 1;
                TaskOutcome::Dead
            }
        };

        // A dead-lettered task may hold state that blocks rescheduling
        // (e.g. a renewal-in-flight flag); let the handler release it
        if matches!(outcome, TaskOutcome::Dead)
            && let Some(payload) = payload
            && let Some(handler) = self.registry.get(&task.kind)
            && let Err(e) = handler.abandoned(task, payload).await
        {
            error!("Dead-letter hook for task {} failed: {e}", task.id);
        }

        self.store.resolve(task.id, outcome).await
    }

    fn sweep_due(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_sweep.lock().expect("sweep clock lock");
        last.is_none_or(|at| now - at >= Duration::seconds(SWEEP_INTERVAL_SECS))
    }

    /// Nearest instant any of this instance's scheduled work becomes due.
    ///
    /// Work owned by other instances is excluded: a due task or timer in a
    /// foreign (or unassigned) guild must not collapse this instance's
    /// sleep to zero.
    pub async fn next_deadline(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let claimant = self.router.instance_id();
        let mut deadline = self.store.next_fire_at(claimant).await?;
        if let Some(timer_at) = self.store.next_timer_at(claimant).await? {
            deadline = Some(deadline.map_or(timer_at, |d| d.min(timer_at)));
        }
        if let Some(last) = *self.last_sweep.lock().expect("sweep clock lock") {
            let sweep_at = last + Duration::seconds(SWEEP_INTERVAL_SECS);
            deadline = Some(deadline.map_or(sweep_at, |d| d.min(sweep_at)));
        }
        Ok(deadline)
    }

    /// Run forever: tick, sleep until the next deadline, wake early on a
    /// scheduling signal
    pub async fn run(mut self) {
        info!(
            "Dispatcher running as instance {}",
            self.router.instance_id()
        );
        loop {
            match self.tick(Utc::now()).await {
                Ok(report) => {
                    if report != TickReport::default() {
                        debug!(
                            "Pass: {} executed, {} retried, {} dead, {} released, {} timers",
                            report.executed,
                            report.retried,
                            report.dead,
                            report.released,
                            report.recurring_fired
                        );
                    }
                }
                Err(e) => error!("Dispatcher pass failed: {e}"),
            }

            // The deadline only covers this instance's work; released
            // foreign claims are retried on the poll fallback cadence
            let wait = match self.next_deadline().await {
                Ok(Some(deadline)) => (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(StdDuration::ZERO)
                    .min(StdDuration::from_secs(POLL_FALLBACK_SECS)),
                Ok(None) => StdDuration::from_secs(POLL_FALLBACK_SECS),
                Err(e) => {
                    error!("Failed to read next deadline: {e}");
                    StdDuration::from_secs(POLL_FALLBACK_SECS)
                }
            };

            tokio::select! {
                _ = sleep(wait) => {}
                changed = self.wake_rx.changed() => {
                    if changed.is_err() {
                        warn!("All scheduling handles dropped, dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
