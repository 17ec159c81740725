//! Storage traits backing the scheduler.
//!
//! Production runs against Postgres ([`postgres::Database`]); tests and
//! embedded use run against [`memory::MemoryStore`]. Both uphold the same
//! contract: claims are exclusive, advances and flag flips are
//! compare-and-set, and no mutation can lose an update under concurrent
//! instances.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::giveaway::Giveaway;
use crate::models::{ChannelId, GuildId, InstanceId, Platform, TaskId};
use crate::moderation::{ModerationCase, NewCase};
use crate::recurring::RecurringTimer;
use crate::subscription::Subscription;
use crate::task::{ClaimedTask, TaskOutcome, TaskPayload};

/// Durable CRUD and exclusive claiming over deferred tasks
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a deferred task and return its identifier
    async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        guild_id: Option<GuildId>,
        fire_at: DateTime<Utc>,
    ) -> Result<TaskId, StoreError>;

    /// Claim every task due as of `now`, up to `limit`, in (fire_at, id)
    /// order. Claimed tasks are invisible to other claimants until resolved
    /// or released; claiming nothing is not a fault.
    async fn claim_due(
        &self,
        claimant: &InstanceId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Settle a claimed task. Resolving a missing task is a no-op.
    async fn resolve(&self, id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError>;

    /// Return a claim untouched, e.g. after a stale-ownership check
    async fn release(&self, id: TaskId) -> Result<(), StoreError>;

    /// Delete a task that has not been claimed yet; returns whether a row
    /// was removed. A claimed task runs to resolution first.
    async fn cancel(&self, id: TaskId) -> Result<bool, StoreError>;

    /// Earliest fire time among pending unclaimed tasks the claimant may
    /// run: unscoped tasks plus those of guilds assigned to it. Work owned
    /// elsewhere never shortens this claimant's sleep.
    async fn next_fire_at(
        &self,
        claimant: &InstanceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Encode and enqueue a typed payload under its own kind and guild scope
    async fn enqueue_task(
        &self,
        payload: &TaskPayload,
        fire_at: DateTime<Utc>,
    ) -> Result<TaskId, StoreError> {
        let encoded = payload.encode()?;
        self.enqueue(payload.kind(), encoded, payload.guild_id(), fire_at)
            .await
    }
}

/// Guild-scoped moderation cases with monotonic case numbers
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert a case under the next guild-scoped case number
    async fn open_case(&self, new: &NewCase) -> Result<i32, StoreError>;

    async fn case(
        &self,
        guild_id: GuildId,
        case_id: i32,
    ) -> Result<Option<ModerationCase>, StoreError>;

    /// Compare-and-set `processed` from false to true; returns whether this
    /// caller won the flip
    async fn mark_processed(&self, guild_id: GuildId, case_id: i32) -> Result<bool, StoreError>;

    /// Record why an automatic reversal ended the way it did, for staff
    async fn record_resolution(
        &self,
        guild_id: GuildId,
        case_id: i32,
        resolution: &str,
    ) -> Result<(), StoreError>;
}

/// Recurring per-channel timers (announcements, anti-nuke)
#[async_trait]
pub trait RecurringStore: Send + Sync {
    async fn upsert_timer(&self, timer: &RecurringTimer) -> Result<(), StoreError>;

    /// Timers whose next fire is at or before `now`
    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTimer>, StoreError>;

    /// Compare-and-set next_fire from `from` to `to`; the winner fires
    async fn advance_timer(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Remove a timer; cancels all future fires
    async fn delete_timer(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError>;

    /// Earliest next fire across the claimant's own timers
    async fn next_timer_at(
        &self,
        claimant: &InstanceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Expiring pubsub subscriptions and their guild-channel fan-out bindings
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), StoreError>;

    async fn subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Active subscriptions expiring within `window` that have no renewal
    /// in flight yet
    async fn renewal_candidates(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn set_renewal_pending(
        &self,
        platform: Platform,
        feed_id: &str,
        pending: bool,
    ) -> Result<(), StoreError>;

    /// Store a fresh expiry and clear the renewal-pending flag
    async fn record_renewal(
        &self,
        platform: Platform,
        feed_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark every subscription past its expiry inactive; returns the count
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn deactivate_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<(), StoreError>;

    async fn remove_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<bool, StoreError>;

    async fn bind_feed(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), StoreError>;

    async fn unbind_feed(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError>;

    /// Guild channels a feed fans out to
    async fn feed_targets(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<Vec<(GuildId, ChannelId)>, StoreError>;

    /// Remove everything a dropped feed owned: bindings and dedup rows
    async fn purge_feed(&self, platform: Platform, feed_id: &str) -> Result<(), StoreError>;
}

/// Duplicate-suppression log for fan-out notifications
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Record a (guild, channel, platform, post) observation; returns true
    /// the first time the tuple is seen and false on every later attempt
    async fn observe_post(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        platform: Platform,
        post_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Giveaway end timers
#[async_trait]
pub trait GiveawayStore: Send + Sync {
    async fn insert_giveaway(&self, giveaway: &Giveaway) -> Result<(), StoreError>;

    async fn giveaway(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: crate::models::MessageId,
    ) -> Result<Option<Giveaway>, StoreError>;

    /// Compare-and-set `ended` from false to true
    async fn mark_ended(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: crate::models::MessageId,
    ) -> Result<bool, StoreError>;
}

/// Read-only view of the guild-to-instance assignment table.
///
/// Written by a separate fleet-management process; the scheduler only ever
/// reads it.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn assignments(&self) -> Result<Vec<(GuildId, InstanceId)>, StoreError>;
}

/// Everything the dispatcher needs from one backend
pub trait Store:
    TaskStore
    + CaseStore
    + RecurringStore
    + SubscriptionStore
    + DedupStore
    + GiveawayStore
    + InstanceStore
{
}

impl<T> Store for T where
    T: TaskStore
        + CaseStore
        + RecurringStore
        + SubscriptionStore
        + DedupStore
        + GiveawayStore
        + InstanceStore
{
}
