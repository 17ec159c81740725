//! Giveaway end timers.
//!
//! Same exactly-once-fire contract as moderation expiry: the `ended` flag is
//! flipped with a compare-and-set, so a redelivered end task concludes
//! nothing twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use crate::error::{HandlerError, StoreError};
use crate::handler::{TaskHandler, unexpected_payload};
use crate::models::{ChannelId, GuildId, MessageId};
use crate::store::Store;
use crate::task::{ClaimedTask, TaskPayload};

/// A running giveaway keyed by its message
#[derive(Clone, Debug)]
pub struct Giveaway {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub ends_at: DateTime<Utc>,
    pub ended: bool,
}

/// What concluding a giveaway reported back
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConcludeOutcome {
    Concluded,
    /// The giveaway message was deleted
    NotFound,
}

/// External collaborator that picks winners and edits the message
#[async_trait]
pub trait GiveawayGateway: Send + Sync {
    async fn conclude(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<ConcludeOutcome, HandlerError>;
}

/// Schedules giveaways and their end tasks
pub struct GiveawayManager<S> {
    store: Arc<S>,
    wake: watch::Sender<()>,
}

impl<S: Store> GiveawayManager<S> {
    pub fn new(store: Arc<S>, wake: watch::Sender<()>) -> Self {
        Self { store, wake }
    }

    pub async fn schedule(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
        ends_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .insert_giveaway(&Giveaway {
                guild_id,
                channel_id,
                message_id,
                ends_at,
                ended: false,
            })
            .await?;
        self.store
            .enqueue_task(
                &TaskPayload::GiveawayEnd {
                    guild_id,
                    channel_id,
                    message_id,
                },
                ends_at,
            )
            .await?;
        let _ = self.wake.send(());
        Ok(())
    }
}

/// Handler for `giveaway_end` tasks
pub struct GiveawayEndHandler<S> {
    store: Arc<S>,
    gateway: Arc<dyn GiveawayGateway>,
}

impl<S> GiveawayEndHandler<S> {
    pub fn new(store: Arc<S>, gateway: Arc<dyn GiveawayGateway>) -> Self {
        Self { store, gateway }
    }
}

#[async_trait]
impl<S: Store> TaskHandler for GiveawayEndHandler<S> {
    fn kind(&self) -> &'static str {
        "giveaway_end"
    }

    async fn handle(&self, _task: &ClaimedTask, payload: TaskPayload) -> Result<(), HandlerError> {
        let TaskPayload::GiveawayEnd {
            guild_id,
            channel_id,
            message_id,
        } = payload
        else {
            return Err(unexpected_payload("giveaway_end", &payload));
        };

        let Some(giveaway) = self
            .store
            .giveaway(guild_id, channel_id, message_id)
            .await?
        else {
            // Giveaway rows outlive their tasks unless deleted manually
            return Err(HandlerError::NotFound);
        };
        if giveaway.ended {
            // Already concluded or manually ended; re-running is a no-op
            return Ok(());
        }

        let outcome = self
            .gateway
            .conclude(guild_id, channel_id, message_id)
            .await?;
        let flipped = self
            .store
            .mark_ended(guild_id, channel_id, message_id)
            .await?;
        if flipped {
            info!("Ended giveaway {message_id} in guild {guild_id}");
        }

        match outcome {
            ConcludeOutcome::Concluded => Ok(()),
            ConcludeOutcome::NotFound => Err(HandlerError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskId;
    use crate::store::GiveawayStore;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGateway {
        concluded: AtomicUsize,
    }

    #[async_trait]
    impl GiveawayGateway for CountingGateway {
        async fn conclude(
            &self,
            _guild_id: GuildId,
            _channel_id: ChannelId,
            _message_id: MessageId,
        ) -> Result<ConcludeOutcome, HandlerError> {
            self.concluded.fetch_add(1, Ordering::SeqCst);
            Ok(ConcludeOutcome::Concluded)
        }
    }

    #[tokio::test]
    async fn test_ended_flag_flips_once() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let manager = GiveawayManager::new(store.clone(), wake);
        let (guild, channel, message) = (GuildId::new(1), ChannelId::new(2), MessageId::new(3));

        manager
            .schedule(guild, channel, message, Utc::now())
            .await
            .unwrap();

        assert!(store.mark_ended(guild, channel, message).await.unwrap());
        assert!(!store.mark_ended(guild, channel, message).await.unwrap());
    }

    #[tokio::test]
    async fn test_end_handler_concludes() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let manager = GiveawayManager::new(store.clone(), wake);
        let gateway = Arc::new(CountingGateway {
            concluded: AtomicUsize::new(0),
        });
        let handler = GiveawayEndHandler::new(store.clone(), gateway.clone());
        let (guild, channel, message) = (GuildId::new(1), ChannelId::new(2), MessageId::new(3));

        manager
            .schedule(guild, channel, message, Utc::now())
            .await
            .unwrap();

        let task = ClaimedTask {
            id: TaskId(1),
            kind: "giveaway_end".into(),
            payload: serde_json::Value::Null,
            guild_id: Some(guild),
            fire_at: Utc::now(),
            attempts: 0,
            created_at: Utc::now(),
        };
        handler
            .handle(
                &task,
                TaskPayload::GiveawayEnd {
                    guild_id: guild,
                    channel_id: channel,
                    message_id: message,
                },
            )
            .await
            .unwrap();

        assert_eq!(gateway.concluded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_redelivered_end_task_concludes_once() {
        let store = Arc::new(MemoryStore::new());
        let (wake, _) = watch::channel(());
        let manager = GiveawayManager::new(store.clone(), wake);
        let gateway = Arc::new(CountingGateway {
            concluded: AtomicUsize::new(0),
        });
        let handler = GiveawayEndHandler::new(store.clone(), gateway.clone());
        let (guild, channel, message) = (GuildId::new(1), ChannelId::new(2), MessageId::new(3));

        manager
            .schedule(guild, channel, message, Utc::now())
            .await
            .unwrap();

        let task = ClaimedTask {
            id: TaskId(1),
            kind: "giveaway_end".into(),
            payload: serde_json::Value::Null,
            guild_id: Some(guild),
            fire_at: Utc::now(),
            attempts: 0,
            created_at: Utc::now(),
        };
        let payload = TaskPayload::GiveawayEnd {
            guild_id: guild,
            channel_id: channel,
            message_id: message,
        };

        handler.handle(&task, payload.clone()).await.unwrap();
        // Redelivered dispatch must not pick winners again
        handler.handle(&task, payload).await.unwrap();

        assert_eq!(gateway.concluded.load(Ordering::SeqCst), 1);
        let giveaway = store.giveaway(guild, channel, message).await.unwrap().unwrap();
        assert!(giveaway.ended);
    }
}
