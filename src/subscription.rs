//! Expiring feed subscriptions, renewal sweeps, and duplicate-suppressed
//! fan-out of incoming posts.
//!
//! A post travels: platform webhook -> [`SubscriptionRegistry::handle_post`]
//! -> dedup check per bound guild channel -> one `feed_post` delivery task
//! per fresh tuple. Delivery rides the regular task pipeline, so it inherits
//! claim exclusivity, instance ownership and retry backoff.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::{PUBSUB_LEASE_SECS, RENEWAL_WINDOW_SECS};
use crate::error::{HandlerError, StoreError};
use crate::handler::{TaskHandler, unexpected_payload};
use crate::models::{ChannelId, GuildId, Platform};
use crate::store::Store;
use crate::task::{ClaimedTask, TaskPayload};

/// An external feed the bot listens to, with an optional lease expiry
#[derive(Clone, Debug)]
pub struct Subscription {
    pub platform: Platform,
    pub feed_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub renewal_pending: bool,
}

impl Subscription {
    /// A subscription past its expiry must not produce notifications
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|at| at > now)
    }
}

/// An incoming post from a platform collaborator
#[derive(Clone, Debug)]
pub struct FeedPost {
    pub platform: Platform,
    pub feed_id: String,
    pub post_id: String,
    pub content: String,
}

/// Delivery report for one guild channel
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Delivery {
    Delivered,
    RateLimited,
    ChannelGone,
}

/// External collaborator that sends rendered content to a guild channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<Delivery, HandlerError>;
}

/// External collaborator that re-leases a pubsub subscription
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Renew the feed's lease; returns the new expiry
    async fn renew(&self, platform: Platform, feed_id: &str)
    -> Result<DateTime<Utc>, HandlerError>;
}

/// Manages subscriptions, their renewal sweep, and post fan-out
pub struct SubscriptionRegistry<S> {
    store: Arc<S>,
    wake: watch::Sender<()>,
}

impl<S: Store> SubscriptionRegistry<S> {
    pub fn new(store: Arc<S>, wake: watch::Sender<()>) -> Self {
        Self { store, wake }
    }

    /// Register (or re-activate) a feed subscription
    pub async fn subscribe(
        &self,
        platform: Platform,
        feed_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .upsert_subscription(&Subscription {
                platform,
                feed_id: feed_id.to_owned(),
                expires_at: Some(now + Duration::seconds(PUBSUB_LEASE_SECS)),
                active: true,
                renewal_pending: false,
            })
            .await
    }

    pub async fn bind(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), StoreError> {
        self.store
            .bind_feed(platform, feed_id, guild_id, channel_id)
            .await
    }

    /// Drop a subscription; its bindings and dedup rows are removed by an
    /// explicit cleanup task rather than a storage-layer cascade
    pub async fn drop_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let removed = self.store.remove_subscription(platform, feed_id).await?;
        if removed {
            self.store
                .enqueue_task(
                    &TaskPayload::SubscriptionCleanup {
                        platform,
                        feed_id: feed_id.to_owned(),
                    },
                    now,
                )
                .await?;
            let _ = self.wake.send(());
        }
        Ok(removed)
    }

    /// Background maintenance: deactivate expired subscriptions and issue
    /// renewal tasks for those inside the renewal window
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let lapsed = self.store.deactivate_expired(now).await?;
        if lapsed > 0 {
            warn!("{lapsed} subscriptions lapsed without renewal and are now inactive");
        }

        let window = Duration::seconds(RENEWAL_WINDOW_SECS);
        let candidates = self.store.renewal_candidates(now, window).await?;
        let mut issued = 0;
        for sub in candidates {
            self.store
                .set_renewal_pending(sub.platform, &sub.feed_id, true)
                .await?;
            self.store
                .enqueue_task(
                    &TaskPayload::SubscriptionRenewal {
                        platform: sub.platform,
                        feed_id: sub.feed_id.clone(),
                    },
                    now,
                )
                .await?;
            issued += 1;
        }
        if issued > 0 {
            info!("Issued {issued} subscription renewals");
            let _ = self.wake.send(());
        }
        Ok(())
    }

    /// Fan an incoming post out to every bound guild channel, skipping
    /// tuples the dedup log has already seen; returns the number of
    /// deliveries enqueued
    pub async fn handle_post(&self, post: &FeedPost, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let sub = self.store.subscription(post.platform, &post.feed_id).await?;
        let live = sub.map(|s| s.is_live(now)).unwrap_or(false);
        if !live {
            debug!(
                "Dropping post {} from {} feed {}: subscription inactive",
                post.post_id, post.platform, post.feed_id
            );
            return Ok(0);
        }

        let mut enqueued = 0;
        for (guild_id, channel_id) in self.store.feed_targets(post.platform, &post.feed_id).await? {
            let is_new = self
                .store
                .observe_post(guild_id, channel_id, post.platform, &post.post_id, now)
                .await?;
            if !is_new {
                debug!(
                    "Suppressing duplicate post {} for channel {} in guild {}",
                    post.post_id, channel_id, guild_id
                );
                continue;
            }

            self.store
                .enqueue_task(
                    &TaskPayload::FeedPost {
                        guild_id,
                        channel_id,
                        platform: post.platform,
                        feed_id: post.feed_id.clone(),
                        post_id: post.post_id.clone(),
                        content: post.content.clone(),
                    },
                    now,
                )
                .await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            let _ = self.wake.send(());
        }
        Ok(enqueued)
    }
}

/// Handler for `subscription_renewal` tasks
pub struct RenewalHandler<S> {
    store: Arc<S>,
    client: Arc<dyn PlatformClient>,
}

impl<S> RenewalHandler<S> {
    pub fn new(store: Arc<S>, client: Arc<dyn PlatformClient>) -> Self {
        Self { store, client }
    }
}

#[async_trait]
impl<S: Store> TaskHandler for RenewalHandler<S> {
    fn kind(&self) -> &'static str {
        "subscription_renewal"
    }

    async fn handle(&self, _task: &ClaimedTask, payload: TaskPayload) -> Result<(), HandlerError> {
        let TaskPayload::SubscriptionRenewal { platform, feed_id } = payload else {
            return Err(unexpected_payload("subscription_renewal", &payload));
        };

        match self.client.renew(platform, &feed_id).await {
            Ok(expires_at) => {
                self.store
                    .record_renewal(platform, &feed_id, expires_at)
                    .await?;
                debug!("Renewed {platform} feed {feed_id} until {expires_at}");
                Ok(())
            }
            Err(HandlerError::NotFound) => {
                // Feed no longer exists upstream; stop trying
                self.store
                    .deactivate_subscription(platform, &feed_id)
                    .await?;
                Err(HandlerError::NotFound)
            }
            Err(e) => {
                // Leave renewal_pending set; the retry carries the task
                Err(e)
            }
        }
    }

    async fn abandoned(
        &self,
        _task: &ClaimedTask,
        payload: TaskPayload,
    ) -> Result<(), StoreError> {
        let TaskPayload::SubscriptionRenewal { platform, feed_id } = payload else {
            return Ok(());
        };
        // Give the flag back so a later sweep can issue a fresh renewal
        self.store
            .set_renewal_pending(platform, &feed_id, false)
            .await?;
        warn!("Renewal of {platform} feed {feed_id} dead-lettered; a later sweep may retry");
        Ok(())
    }
}

/// Handler for `subscription_cleanup` tasks: explicit ownership cascade
pub struct CleanupHandler<S> {
    store: Arc<S>,
}

impl<S> CleanupHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store> TaskHandler for CleanupHandler<S> {
    fn kind(&self) -> &'static str {
        "subscription_cleanup"
    }

    async fn handle(&self, _task: &ClaimedTask, payload: TaskPayload) -> Result<(), HandlerError> {
        let TaskPayload::SubscriptionCleanup { platform, feed_id } = payload else {
            return Err(unexpected_payload("subscription_cleanup", &payload));
        };

        self.store.purge_feed(platform, &feed_id).await?;
        info!("Purged bindings and dedup history for {platform} feed {feed_id}");
        Ok(())
    }
}

/// Handler for `feed_post` delivery tasks
pub struct FeedPostHandler<S> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
}

impl<S> FeedPostHandler<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl<S: Store> TaskHandler for FeedPostHandler<S> {
    fn kind(&self) -> &'static str {
        "feed_post"
    }

    async fn handle(&self, _task: &ClaimedTask, payload: TaskPayload) -> Result<(), HandlerError> {
        let TaskPayload::FeedPost {
            guild_id,
            channel_id,
            platform,
            feed_id,
            content,
            ..
        } = payload
        else {
            return Err(unexpected_payload("feed_post", &payload));
        };

        match self.notifier.deliver(guild_id, channel_id, &content).await? {
            Delivery::Delivered => Ok(()),
            Delivery::RateLimited => Err(HandlerError::Transient(format!(
                "rate limited delivering to channel {channel_id} in guild {guild_id}"
            ))),
            Delivery::ChannelGone => {
                // The binding is dead weight from here on
                self.store
                    .unbind_feed(platform, &feed_id, guild_id, channel_id)
                    .await?;
                Err(HandlerError::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskId;
    use crate::store::memory::MemoryStore;
    use crate::store::{DedupStore, SubscriptionStore};
    use std::sync::Mutex;

    fn registry(store: &Arc<MemoryStore>) -> SubscriptionRegistry<MemoryStore> {
        let (wake, _) = watch::channel(());
        SubscriptionRegistry::new(store.clone(), wake)
    }

    fn post(post_id: &str) -> FeedPost {
        FeedPost {
            platform: Platform::Youtube,
            feed_id: "UC42".into(),
            post_id: post_id.into(),
            content: "new video".into(),
        }
    }

    fn claimed(kind: &str) -> ClaimedTask {
        ClaimedTask {
            id: TaskId(1),
            kind: kind.into(),
            payload: serde_json::Value::Null,
            guild_id: None,
            fire_at: Utc::now(),
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_second_post_is_suppressed() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = Utc::now();

        registry
            .subscribe(Platform::Youtube, "UC42", now)
            .await
            .unwrap();
        registry
            .bind(Platform::Youtube, "UC42", GuildId::new(1), ChannelId::new(2))
            .await
            .unwrap();

        assert_eq!(registry.handle_post(&post("vid-1"), now).await.unwrap(), 1);
        assert_eq!(registry.handle_post(&post("vid-1"), now).await.unwrap(), 0);
        // A different post still goes through
        assert_eq!(registry.handle_post(&post("vid-2"), now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_subscription_drops_posts() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = Utc::now();

        registry
            .subscribe(Platform::Youtube, "UC42", now)
            .await
            .unwrap();
        registry
            .bind(Platform::Youtube, "UC42", GuildId::new(1), ChannelId::new(2))
            .await
            .unwrap();

        let after_lease = now + Duration::seconds(PUBSUB_LEASE_SECS + 1);
        assert_eq!(
            registry
                .handle_post(&post("vid-1"), after_lease)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_sweep_issues_one_renewal() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = Utc::now();

        registry
            .subscribe(Platform::Twitch, "streamer", now)
            .await
            .unwrap();

        // Move inside the renewal window
        let near_expiry = now + Duration::seconds(PUBSUB_LEASE_SECS - 60);
        registry.sweep(near_expiry).await.unwrap();
        registry.sweep(near_expiry).await.unwrap();

        // Only the first sweep enqueued a renewal; the pending flag gates
        // the second
        assert_eq!(store.pending_task_count(), 1);
        let sub = store
            .subscription(Platform::Twitch, "streamer")
            .await
            .unwrap()
            .unwrap();
        assert!(sub.renewal_pending);
    }

    #[tokio::test]
    async fn test_unrenewed_subscription_goes_inactive() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = Utc::now();

        registry
            .subscribe(Platform::Twitch, "streamer", now)
            .await
            .unwrap();
        let lapsed = now + Duration::seconds(PUBSUB_LEASE_SECS + 1);
        registry.sweep(lapsed).await.unwrap();

        let sub = store
            .subscription(Platform::Twitch, "streamer")
            .await
            .unwrap()
            .unwrap();
        assert!(!sub.active);
    }

    struct ScriptedNotifier {
        outcomes: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl Notifier for ScriptedNotifier {
        async fn deliver(
            &self,
            _guild_id: GuildId,
            _channel_id: ChannelId,
            _content: &str,
        ) -> Result<Delivery, HandlerError> {
            Ok(self.outcomes.lock().unwrap().remove(0))
        }
    }

    #[tokio::test]
    async fn test_gone_channel_unbinds_feed() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = Utc::now();
        let guild = GuildId::new(1);
        let channel = ChannelId::new(2);

        registry
            .subscribe(Platform::Youtube, "UC42", now)
            .await
            .unwrap();
        registry
            .bind(Platform::Youtube, "UC42", guild, channel)
            .await
            .unwrap();

        let handler = FeedPostHandler::new(
            store.clone(),
            Arc::new(ScriptedNotifier {
                outcomes: Mutex::new(vec![Delivery::ChannelGone]),
            }),
        );
        let err = handler
            .handle(
                &claimed("feed_post"),
                TaskPayload::FeedPost {
                    guild_id: guild,
                    channel_id: channel,
                    platform: Platform::Youtube,
                    feed_id: "UC42".into(),
                    post_id: "vid-1".into(),
                    content: "new video".into(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::NotFound));
        assert!(
            store
                .feed_targets(Platform::Youtube, "UC42")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_drop_subscription_enqueues_cleanup() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let now = Utc::now();
        let guild = GuildId::new(1);
        let channel = ChannelId::new(2);

        registry
            .subscribe(Platform::Youtube, "UC42", now)
            .await
            .unwrap();
        registry
            .bind(Platform::Youtube, "UC42", guild, channel)
            .await
            .unwrap();
        registry.handle_post(&post("vid-1"), now).await.unwrap();

        assert!(
            registry
                .drop_subscription(Platform::Youtube, "UC42", now)
                .await
                .unwrap()
        );

        // Run the cleanup task's work directly
        let handler = CleanupHandler::new(store.clone());
        handler
            .handle(
                &claimed("subscription_cleanup"),
                TaskPayload::SubscriptionCleanup {
                    platform: Platform::Youtube,
                    feed_id: "UC42".into(),
                },
            )
            .await
            .unwrap();

        assert!(
            store
                .feed_targets(Platform::Youtube, "UC42")
                .await
                .unwrap()
                .is_empty()
        );
        // Dedup history went with the feed; the same post would be fresh
        // again after an explicit re-subscribe
        assert!(
            store
                .observe_post(guild, channel, Platform::Youtube, "vid-1", now)
                .await
                .unwrap()
        );
    }
}
