//! Recurring per-channel timers: scheduled announcements and anti-nuke
//! channel resets.
//!
//! Firing and rescheduling are atomic: the manager advances `next_fire`
//! with a compare-and-set before executing the effect, so two instances
//! racing on the same timer produce exactly one fire. Missed cycles after
//! downtime coalesce into a single catch-up fire because the new next fire
//! is computed from `max(now, next_fire) + interval`, never from a backlog.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{HandlerError, StoreError};
use crate::models::{ChannelId, GuildId};
use crate::router::InstanceRouter;
use crate::store::Store;

/// Kind of recurring effect a timer drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Re-send templated content to the channel on each fire
    Announcement,
    /// Recreate the channel, wiping its history
    Nuke,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Announcement => "announcement",
            Self::Nuke => "nuke",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "announcement" => Some(Self::Announcement),
            "nuke" => Some(Self::Nuke),
            _ => None,
        }
    }
}

/// A repeating trigger keyed by guild and channel
#[derive(Clone, Debug)]
pub struct RecurringTimer {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub kind: TimerKind,
    pub interval: Duration,
    pub next_fire: DateTime<Utc>,
    pub template: Value,
}

impl RecurringTimer {
    /// Next fire after executing at `now`: never in the past, and missed
    /// cycles collapse into the single fire happening right now
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_fire.max(now) + self.interval
    }
}

/// External collaborator executing recurring effects
#[async_trait]
pub trait RecurringGateway: Send + Sync {
    async fn announce(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        template: &Value,
    ) -> Result<(), HandlerError>;

    async fn nuke_channel(&self, guild_id: GuildId, channel_id: ChannelId)
    -> Result<(), HandlerError>;
}

/// Advances due timers and executes their effects
pub struct RecurringTimerManager<S> {
    store: Arc<S>,
    gateway: Arc<dyn RecurringGateway>,
}

impl<S: Store> RecurringTimerManager<S> {
    pub fn new(store: Arc<S>, gateway: Arc<dyn RecurringGateway>) -> Self {
        Self { store, gateway }
    }

    /// Create or replace a timer; the first fire is one interval out
    pub async fn upsert(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        kind: TimerKind,
        interval: Duration,
        template: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // A non-positive interval would be due again immediately after
        // every advance
        if interval <= Duration::zero() {
            return Err(StoreError::Invalid(format!(
                "non-positive timer interval {}s",
                interval.num_seconds()
            )));
        }
        self.store
            .upsert_timer(&RecurringTimer {
                guild_id,
                channel_id,
                kind,
                interval,
                next_fire: now + interval,
                template,
            })
            .await
    }

    /// Remove a timer; an in-flight fire still completes
    pub async fn cancel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError> {
        self.store.delete_timer(guild_id, channel_id).await
    }

    /// Fire every due timer owned by this instance; returns the fire count
    pub async fn run_due(
        &self,
        router: &InstanceRouter,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let due = self.store.due_timers(now).await?;
        let mut fired = 0;

        for timer in due {
            if !router.owns_guild(timer.guild_id) {
                continue;
            }

            let next = timer.next_fire_after(now);
            let advanced = self
                .store
                .advance_timer(timer.guild_id, timer.channel_id, timer.next_fire, next)
                .await?;
            if !advanced {
                // Another instance won the compare-and-set
                debug!(
                    "Lost timer advance for channel {} in guild {}",
                    timer.channel_id, timer.guild_id
                );
                continue;
            }

            match self.fire(&timer).await {
                Ok(()) => fired += 1,
                Err(HandlerError::NotFound) => {
                    warn!(
                        "Channel {} in guild {} is gone, removing its {} timer",
                        timer.channel_id,
                        timer.guild_id,
                        timer.kind.as_str()
                    );
                    self.store
                        .delete_timer(timer.guild_id, timer.channel_id)
                        .await?;
                }
                Err(e) => {
                    // The advance already happened; the effect resumes on
                    // the next interval rather than replaying
                    warn!(
                        "Failed to fire {} timer for channel {} in guild {}: {e}",
                        timer.kind.as_str(),
                        timer.channel_id,
                        timer.guild_id
                    );
                }
            }
        }

        Ok(fired)
    }

    async fn fire(&self, timer: &RecurringTimer) -> Result<(), HandlerError> {
        match timer.kind {
            TimerKind::Announcement => {
                self.gateway
                    .announce(timer.guild_id, timer.channel_id, &timer.template)
                    .await
            }
            TimerKind::Nuke => {
                self.gateway
                    .nuke_channel(timer.guild_id, timer.channel_id)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceId;
    use crate::store::RecurringStore;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        announcements: Mutex<Vec<(GuildId, ChannelId)>>,
        nukes: Mutex<Vec<(GuildId, ChannelId)>>,
        channel_gone: bool,
    }

    #[async_trait]
    impl RecurringGateway for RecordingGateway {
        async fn announce(
            &self,
            guild_id: GuildId,
            channel_id: ChannelId,
            _template: &Value,
        ) -> Result<(), HandlerError> {
            if self.channel_gone {
                return Err(HandlerError::NotFound);
            }
            self.announcements
                .lock()
                .unwrap()
                .push((guild_id, channel_id));
            Ok(())
        }

        async fn nuke_channel(
            &self,
            guild_id: GuildId,
            channel_id: ChannelId,
        ) -> Result<(), HandlerError> {
            self.nukes.lock().unwrap().push((guild_id, channel_id));
            Ok(())
        }
    }

    async fn owned_router(store: &Arc<MemoryStore>, guild: GuildId) -> InstanceRouter {
        let instance = InstanceId::new("alpha");
        store.assign_guild(guild, instance.clone());
        let router = InstanceRouter::new(instance);
        router.refresh(store.as_ref()).await.unwrap();
        router
    }

    #[tokio::test]
    async fn test_missed_cycles_coalesce_to_one_fire() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let manager = RecurringTimerManager::new(store.clone(), gateway.clone());
        let guild = GuildId::new(10);
        let channel = ChannelId::new(20);
        let router = owned_router(&store, guild).await;

        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        store
            .upsert_timer(&RecurringTimer {
                guild_id: guild,
                channel_id: channel,
                kind: TimerKind::Announcement,
                interval: Duration::seconds(3600),
                next_fire: t0,
                template: serde_json::json!({"content": "hello"}),
            })
            .await
            .unwrap();

        // Two full cycles were missed while the process was down
        let now = t0 + Duration::seconds(7300);
        let fired = manager.run_due(&router, now).await.unwrap();
        assert_eq!(fired, 1);
        assert_eq!(gateway.announcements.lock().unwrap().len(), 1);

        let due_later = store.due_timers(now).await.unwrap();
        assert!(due_later.is_empty());
        let timer = store.timer(guild, channel).unwrap();
        assert_eq!(timer.next_fire, now + Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_next_fire_is_never_in_the_past() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let timer = RecurringTimer {
            guild_id: GuildId::new(1),
            channel_id: ChannelId::new(2),
            kind: TimerKind::Nuke,
            interval: Duration::seconds(600),
            next_fire: t0,
            template: Value::Null,
        };

        // On-time fire advances by exactly one interval
        assert_eq!(timer.next_fire_after(t0), t0 + Duration::seconds(600));
        // Late fire advances from now, not from the stale deadline
        let late = t0 + Duration::seconds(5000);
        assert_eq!(timer.next_fire_after(late), late + Duration::seconds(600));
        assert!(timer.next_fire_after(late) > late);
    }

    #[tokio::test]
    async fn test_unowned_guild_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let manager = RecurringTimerManager::new(store.clone(), gateway.clone());
        let guild = GuildId::new(10);

        store.assign_guild(guild, InstanceId::new("bravo"));
        let router = InstanceRouter::new(InstanceId::new("alpha"));
        router.refresh(store.as_ref()).await.unwrap();

        let t0 = Utc::now();
        store
            .upsert_timer(&RecurringTimer {
                guild_id: guild,
                channel_id: ChannelId::new(20),
                kind: TimerKind::Announcement,
                interval: Duration::seconds(60),
                next_fire: t0,
                template: Value::Null,
            })
            .await
            .unwrap();

        let fired = manager.run_due(&router, t0).await.unwrap();
        assert_eq!(fired, 0);
        assert!(gateway.announcements.lock().unwrap().is_empty());
        // The timer was not advanced either; its owner still sees it due
        assert_eq!(store.due_timers(t0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gone_channel_removes_timer() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway {
            channel_gone: true,
            ..Default::default()
        });
        let manager = RecurringTimerManager::new(store.clone(), gateway);
        let guild = GuildId::new(10);
        let channel = ChannelId::new(20);
        let router = owned_router(&store, guild).await;

        let t0 = Utc::now();
        store
            .upsert_timer(&RecurringTimer {
                guild_id: guild,
                channel_id: channel,
                kind: TimerKind::Announcement,
                interval: Duration::seconds(60),
                next_fire: t0,
                template: Value::Null,
            })
            .await
            .unwrap();

        manager.run_due(&router, t0).await.unwrap();
        assert!(store.timer(guild, channel).is_none());
    }

    #[tokio::test]
    async fn test_non_positive_interval_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(RecordingGateway::default());
        let manager = RecurringTimerManager::new(store.clone(), gateway);
        let guild = GuildId::new(10);
        let channel = ChannelId::new(20);

        for bad in [Duration::zero(), Duration::seconds(-60)] {
            let err = manager
                .upsert(
                    guild,
                    channel,
                    TimerKind::Announcement,
                    bad,
                    Value::Null,
                    Utc::now(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, crate::error::StoreError::Invalid(_)));
        }
        assert!(store.timer(guild, channel).is_none());
    }
}
