//! Scheduling and idempotent reversal of temporary punishments.
//!
//! A case with an expiry moves through `active` (processed = false) into
//! `processed` once its reversal ran, or stays terminal with a recorded
//! resolution when the bot could not act. Reversal is guarded by a
//! compare-and-set on the `processed` flag so a retried dispatch or a racing
//! manual closure can never flip it twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use crate::error::{HandlerError, StoreError};
use crate::handler::{TaskHandler, unexpected_payload};
use crate::models::{ActionKind, GuildId, TargetKind, UserId};
use crate::store::Store;
use crate::task::{ClaimedTask, TaskPayload};

/// A guild-scoped moderation case
#[derive(Clone, Debug)]
pub struct ModerationCase {
    pub guild_id: GuildId,
    pub case_id: i32,
    pub target_id: u64,
    pub target_kind: TargetKind,
    pub moderator_id: UserId,
    pub action: ActionKind,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for opening a case; the store assigns the case number
#[derive(Clone, Debug)]
pub struct NewCase {
    pub guild_id: GuildId,
    pub target_id: u64,
    pub target_kind: TargetKind,
    pub moderator_id: UserId,
    pub action: ActionKind,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What the gateway reported back for a reversal attempt
#[derive(Clone, Debug, PartialEq)]
pub enum RevertOutcome {
    Reverted,
    PermissionDenied(String),
    NotFound,
}

/// External collaborator that performs the platform-side reversal
#[async_trait]
pub trait ModerationGateway: Send + Sync {
    /// Undo the case's punishment. `Err` means a transient failure worth
    /// retrying; terminal outcomes come back as [`RevertOutcome`].
    async fn revert(&self, case: &ModerationCase) -> Result<RevertOutcome, HandlerError>;
}

/// Schedules cases and their expiry tasks
pub struct ModerationLifecycle<S> {
    store: Arc<S>,
    wake: watch::Sender<()>,
}

impl<S: Store> ModerationLifecycle<S> {
    pub fn new(store: Arc<S>, wake: watch::Sender<()>) -> Self {
        Self { store, wake }
    }

    /// Open a case; an expiry implicitly enqueues a `case_expiry` task
    /// carrying the case's composite key
    pub async fn open_case(&self, new: NewCase) -> Result<i32, StoreError> {
        let case_id = self.store.open_case(&new).await?;
        if let Some(expires_at) = new.expires_at {
            self.store
                .enqueue_task(
                    &TaskPayload::CaseExpiry {
                        guild_id: new.guild_id,
                        case_id,
                    },
                    expires_at,
                )
                .await?;
            let _ = self.wake.send(());
        }

        info!(
            "Opened case #{} ({}) in guild {} expiring {:?}",
            case_id,
            new.action.as_str(),
            new.guild_id,
            new.expires_at
        );
        Ok(case_id)
    }
}

/// Handler for `case_expiry` tasks: reverses the punishment exactly once
pub struct CaseExpiryHandler<S> {
    store: Arc<S>,
    gateway: Arc<dyn ModerationGateway>,
}

impl<S> CaseExpiryHandler<S> {
    pub fn new(store: Arc<S>, gateway: Arc<dyn ModerationGateway>) -> Self {
        Self { store, gateway }
    }
}

#[async_trait]
impl<S: Store> TaskHandler for CaseExpiryHandler<S> {
    fn kind(&self) -> &'static str {
        "case_expiry"
    }

    async fn handle(&self, _task: &ClaimedTask, payload: TaskPayload) -> Result<(), HandlerError> {
        let TaskPayload::CaseExpiry { guild_id, case_id } = payload else {
            return Err(unexpected_payload("case_expiry", &payload));
        };

        let Some(case) = self.store.case(guild_id, case_id).await? else {
            // Case rows outlive their tasks unless deleted manually
            return Err(HandlerError::NotFound);
        };
        if case.processed {
            // Already reversed or manually closed; re-running is a no-op
            return Ok(());
        }

        match self.gateway.revert(&case).await? {
            RevertOutcome::Reverted => {
                if self.store.mark_processed(guild_id, case_id).await? {
                    info!(
                        "Reversed {} for case #{case_id} in guild {guild_id}",
                        case.action.as_str()
                    );
                }
                Ok(())
            }
            RevertOutcome::NotFound => {
                // Target already gone; success by vacuity
                if self.store.mark_processed(guild_id, case_id).await? {
                    self.store
                        .record_resolution(
                            guild_id,
                            case_id,
                            "target no longer present, case closed automatically",
                        )
                        .await?;
                }
                Ok(())
            }
            RevertOutcome::PermissionDenied(detail) => {
                if self.store.mark_processed(guild_id, case_id).await? {
                    self.store
                        .record_resolution(
                            guild_id,
                            case_id,
                            &format!("automatic {} failed: {detail}", case.action.reversal()),
                        )
                        .await?;
                }
                Err(HandlerError::PermissionDenied(detail))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CaseStore;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGateway {
        reverts: AtomicUsize,
        outcome: fn() -> RevertOutcome,
    }

    #[async_trait]
    impl ModerationGateway for CountingGateway {
        async fn revert(&self, _case: &ModerationCase) -> Result<RevertOutcome, HandlerError> {
            self.reverts.fetch_add(1, Ordering::SeqCst);
            Ok((self.outcome)())
        }
    }

    fn sample_case(expires_at: Option<DateTime<Utc>>) -> NewCase {
        NewCase {
            guild_id: GuildId::new(900),
            target_id: 555,
            target_kind: TargetKind::User,
            moderator_id: UserId::new(1),
            action: ActionKind::Mute,
            reason: Some("spam".into()),
            expires_at,
        }
    }

    fn claimed(kind: &str) -> ClaimedTask {
        ClaimedTask {
            id: crate::models::TaskId(1),
            kind: kind.into(),
            payload: serde_json::Value::Null,
            guild_id: None,
            fire_at: Utc::now(),
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_case_numbers_are_guild_scoped_and_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let lifecycle = ModerationLifecycle::new(store.clone(), wake);

        let first = lifecycle.open_case(sample_case(None)).await.unwrap();
        let second = lifecycle.open_case(sample_case(None)).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let mut other = sample_case(None);
        other.guild_id = GuildId::new(901);
        assert_eq!(lifecycle.open_case(other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reversal_marks_processed_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let lifecycle = ModerationLifecycle::new(store.clone(), wake);
        let gateway = Arc::new(CountingGateway {
            reverts: AtomicUsize::new(0),
            outcome: || RevertOutcome::Reverted,
        });
        let handler = CaseExpiryHandler::new(store.clone(), gateway.clone());

        let guild = GuildId::new(900);
        let case_id = lifecycle
            .open_case(sample_case(Some(Utc::now())))
            .await
            .unwrap();
        let payload = TaskPayload::CaseExpiry {
            guild_id: guild,
            case_id,
        };

        handler
            .handle(&claimed("case_expiry"), payload.clone())
            .await
            .unwrap();
        // Redelivered dispatch must be a no-op
        handler
            .handle(&claimed("case_expiry"), payload)
            .await
            .unwrap();

        assert_eq!(gateway.reverts.load(Ordering::SeqCst), 1);
        let case = store.case(guild, case_id).await.unwrap().unwrap();
        assert!(case.processed);
        assert!(case.resolution.is_none());
    }

    #[tokio::test]
    async fn test_permission_denied_is_terminal_with_resolution() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let lifecycle = ModerationLifecycle::new(store.clone(), wake);
        let gateway = Arc::new(CountingGateway {
            reverts: AtomicUsize::new(0),
            outcome: || RevertOutcome::PermissionDenied("missing Moderate Members".into()),
        });
        let handler = CaseExpiryHandler::new(store.clone(), gateway);

        let guild = GuildId::new(900);
        let case_id = lifecycle
            .open_case(sample_case(Some(Utc::now())))
            .await
            .unwrap();
        let payload = TaskPayload::CaseExpiry {
            guild_id: guild,
            case_id,
        };

        let err = handler
            .handle(&claimed("case_expiry"), payload)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::PermissionDenied(_)));

        let case = store.case(guild, case_id).await.unwrap().unwrap();
        assert!(case.processed);
        assert!(
            case.resolution
                .as_deref()
                .is_some_and(|r| r.contains("unmute"))
        );
    }

    #[tokio::test]
    async fn test_vanished_target_closes_case() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let lifecycle = ModerationLifecycle::new(store.clone(), wake);
        let gateway = Arc::new(CountingGateway {
            reverts: AtomicUsize::new(0),
            outcome: || RevertOutcome::NotFound,
        });
        let handler = CaseExpiryHandler::new(store.clone(), gateway);

        let guild = GuildId::new(900);
        let case_id = lifecycle
            .open_case(sample_case(Some(Utc::now())))
            .await
            .unwrap();

        handler
            .handle(
                &claimed("case_expiry"),
                TaskPayload::CaseExpiry {
                    guild_id: guild,
                    case_id,
                },
            )
            .await
            .unwrap();

        let case = store.case(guild, case_id).await.unwrap().unwrap();
        assert!(case.processed);
        assert!(case.resolution.is_some());
    }
}
