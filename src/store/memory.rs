//! In-memory store backend.
//!
//! Backs the scheduler tests and embedded single-process use without a
//! database. Upholds the same contract as the Postgres backend: a single
//! lock around the state makes every claim and compare-and-set atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::error::StoreError;
use crate::giveaway::Giveaway;
use crate::models::{ChannelId, GuildId, InstanceId, MessageId, Platform, TaskId};
use crate::moderation::{ModerationCase, NewCase};
use crate::recurring::RecurringTimer;
use crate::subscription::Subscription;
use crate::task::{ClaimedTask, TaskOutcome};

use super::{
    CaseStore, DedupStore, GiveawayStore, InstanceStore, RecurringStore, SubscriptionStore,
    TaskStore,
};

#[derive(Clone, Debug)]
struct MemTask {
    id: TaskId,
    kind: String,
    payload: Value,
    guild_id: Option<GuildId>,
    fire_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    attempts: i32,
    dead: bool,
    claimed_by: Option<InstanceId>,
}

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<TaskId, MemTask>,
    next_task_id: i64,
    cases: HashMap<(GuildId, i32), ModerationCase>,
    timers: HashMap<(GuildId, ChannelId), RecurringTimer>,
    subscriptions: HashMap<(Platform, String), Subscription>,
    bindings: BTreeSet<(Platform, String, GuildId, ChannelId)>,
    dedup: HashSet<(GuildId, ChannelId, Platform, String)>,
    giveaways: HashMap<(GuildId, ChannelId, MessageId), Giveaway>,
    assignments: HashMap<GuildId, InstanceId>,
}

/// Store backend holding everything behind one mutex
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock")
    }

    /// Assign a guild to an instance, standing in for fleet management
    pub fn assign_guild(&self, guild_id: GuildId, instance_id: InstanceId) {
        self.lock().assignments.insert(guild_id, instance_id);
    }

    /// Snapshot of a timer row
    pub fn timer(&self, guild_id: GuildId, channel_id: ChannelId) -> Option<RecurringTimer> {
        self.lock().timers.get(&(guild_id, channel_id)).cloned()
    }

    /// Pending (not dead, unclaimed) task count
    pub fn pending_task_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| !t.dead && t.claimed_by.is_none())
            .count()
    }

    /// Dead-lettered task count
    pub fn dead_task_count(&self) -> usize {
        self.lock().tasks.values().filter(|t| t.dead).count()
    }

    /// Attempts recorded on a task, if the row still exists
    pub fn task_attempts(&self, id: TaskId) -> Option<i32> {
        self.lock().tasks.get(&id).map(|t| t.attempts)
    }
}

fn snapshot(task: &MemTask) -> ClaimedTask {
    ClaimedTask {
        id: task.id,
        kind: task.kind.clone(),
        payload: task.payload.clone(),
        guild_id: task.guild_id,
        fire_at: task.fire_at,
        attempts: task.attempts,
        created_at: task.created_at,
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        guild_id: Option<GuildId>,
        fire_at: DateTime<Utc>,
    ) -> Result<TaskId, StoreError> {
        let mut inner = self.lock();
        inner.next_task_id += 1;
        let id = TaskId(inner.next_task_id);
        inner.tasks.insert(
            id,
            MemTask {
                id,
                kind: kind.to_owned(),
                payload,
                guild_id,
                fire_at,
                created_at: Utc::now(),
                attempts: 0,
                dead: false,
                claimed_by: None,
            },
        );
        Ok(id)
    }

    async fn claim_due(
        &self,
        claimant: &InstanceId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut inner = self.lock();
        let mut due: Vec<(DateTime<Utc>, TaskId)> = inner
            .tasks
            .values()
            .filter(|t| !t.dead && t.claimed_by.is_none() && t.fire_at <= now)
            .map(|t| (t.fire_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.claimed_by = Some(claimant.clone());
                claimed.push(snapshot(task));
            }
        }
        Ok(claimed)
    }

    async fn resolve(&self, id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match outcome {
            TaskOutcome::Done => {
                inner.tasks.remove(&id);
            }
            TaskOutcome::RetryAt(fire_at) => {
                if let Some(task) = inner.tasks.get_mut(&id) {
                    task.claimed_by = None;
                    task.fire_at = fire_at;
                    task.attempts += 1;
                }
            }
            TaskOutcome::Dead => {
                if let Some(task) = inner.tasks.get_mut(&id) {
                    task.claimed_by = None;
                    task.dead = true;
                }
            }
        }
        Ok(())
    }

    async fn release(&self, id: TaskId) -> Result<(), StoreError> {
        if let Some(task) = self.lock().tasks.get_mut(&id) {
            task.claimed_by = None;
        }
        Ok(())
    }

    async fn cancel(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let removable = inner
            .tasks
            .get(&id)
            .is_some_and(|t| t.claimed_by.is_none());
        if removable {
            inner.tasks.remove(&id);
        }
        Ok(removable)
    }

    async fn next_fire_at(
        &self,
        claimant: &InstanceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .tasks
            .values()
            .filter(|t| !t.dead && t.claimed_by.is_none())
            .filter(|t| {
                t.guild_id.is_none_or(|guild| {
                    inner
                        .assignments
                        .get(&guild)
                        .is_some_and(|owner| owner == claimant)
                })
            })
            .map(|t| t.fire_at)
            .min())
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn open_case(&self, new: &NewCase) -> Result<i32, StoreError> {
        let mut inner = self.lock();
        let case_id = inner
            .cases
            .keys()
            .filter(|(guild, _)| *guild == new.guild_id)
            .map(|(_, case_id)| *case_id)
            .max()
            .unwrap_or(0)
            + 1;
        let now = Utc::now();
        inner.cases.insert(
            (new.guild_id, case_id),
            ModerationCase {
                guild_id: new.guild_id,
                case_id,
                target_id: new.target_id,
                target_kind: new.target_kind,
                moderator_id: new.moderator_id,
                action: new.action,
                reason: new.reason.clone(),
                expires_at: new.expires_at,
                processed: false,
                resolution: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(case_id)
    }

    async fn case(
        &self,
        guild_id: GuildId,
        case_id: i32,
    ) -> Result<Option<ModerationCase>, StoreError> {
        Ok(self.lock().cases.get(&(guild_id, case_id)).cloned())
    }

    async fn mark_processed(&self, guild_id: GuildId, case_id: i32) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.cases.get_mut(&(guild_id, case_id)) {
            Some(case) if !case.processed => {
                case.processed = true;
                case.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_resolution(
        &self,
        guild_id: GuildId,
        case_id: i32,
        resolution: &str,
    ) -> Result<(), StoreError> {
        if let Some(case) = self.lock().cases.get_mut(&(guild_id, case_id)) {
            case.resolution = Some(resolution.to_owned());
            case.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl RecurringStore for MemoryStore {
    async fn upsert_timer(&self, timer: &RecurringTimer) -> Result<(), StoreError> {
        self.lock()
            .timers
            .insert((timer.guild_id, timer.channel_id), timer.clone());
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTimer>, StoreError> {
        let mut due: Vec<RecurringTimer> = self
            .lock()
            .timers
            .values()
            .filter(|t| t.next_fire <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.next_fire, t.guild_id, t.channel_id));
        Ok(due)
    }

    async fn advance_timer(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.timers.get_mut(&(guild_id, channel_id)) {
            Some(timer) if timer.next_fire == from => {
                timer.next_fire = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_timer(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().timers.remove(&(guild_id, channel_id)).is_some())
    }

    async fn next_timer_at(
        &self,
        claimant: &InstanceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .timers
            .values()
            .filter(|t| {
                inner
                    .assignments
                    .get(&t.guild_id)
                    .is_some_and(|owner| owner == claimant)
            })
            .map(|t| t.next_fire)
            .min())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        self.lock()
            .subscriptions
            .insert((sub.platform, sub.feed_id.clone()), sub.clone());
        Ok(())
    }

    async fn subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .lock()
            .subscriptions
            .get(&(platform, feed_id.to_owned()))
            .cloned())
    }

    async fn renewal_candidates(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Subscription>, StoreError> {
        let horizon = now + window;
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| {
                s.active
                    && !s.renewal_pending
                    && s.expires_at.is_some_and(|at| at <= horizon && at > now)
            })
            .cloned()
            .collect())
    }

    async fn set_renewal_pending(
        &self,
        platform: Platform,
        feed_id: &str,
        pending: bool,
    ) -> Result<(), StoreError> {
        if let Some(sub) = self
            .lock()
            .subscriptions
            .get_mut(&(platform, feed_id.to_owned()))
        {
            sub.renewal_pending = pending;
        }
        Ok(())
    }

    async fn record_renewal(
        &self,
        platform: Platform,
        feed_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(sub) = self
            .lock()
            .subscriptions
            .get_mut(&(platform, feed_id.to_owned()))
        {
            sub.expires_at = Some(expires_at);
            sub.active = true;
            sub.renewal_pending = false;
        }
        Ok(())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut lapsed = 0;
        for sub in self.lock().subscriptions.values_mut() {
            if sub.active && sub.expires_at.is_some_and(|at| at <= now) {
                sub.active = false;
                lapsed += 1;
            }
        }
        Ok(lapsed)
    }

    async fn deactivate_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(sub) = self
            .lock()
            .subscriptions
            .get_mut(&(platform, feed_id.to_owned()))
        {
            sub.active = false;
        }
        Ok(())
    }

    async fn remove_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .subscriptions
            .remove(&(platform, feed_id.to_owned()))
            .is_some())
    }

    async fn bind_feed(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), StoreError> {
        self.lock()
            .bindings
            .insert((platform, feed_id.to_owned(), guild_id, channel_id));
        Ok(())
    }

    async fn unbind_feed(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .bindings
            .remove(&(platform, feed_id.to_owned(), guild_id, channel_id)))
    }

    async fn feed_targets(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<Vec<(GuildId, ChannelId)>, StoreError> {
        Ok(self
            .lock()
            .bindings
            .iter()
            .filter(|(p, f, _, _)| *p == platform && f == feed_id)
            .map(|(_, _, guild, channel)| (*guild, *channel))
            .collect())
    }

    async fn purge_feed(&self, platform: Platform, feed_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .bindings
            .retain(|(p, f, _, _)| !(*p == platform && f == feed_id));
        // Dedup rows are keyed by post, not feed; drop the platform's rows
        // for channels no longer bound to anything on that platform
        let still_bound: HashSet<(GuildId, ChannelId)> = inner
            .bindings
            .iter()
            .filter(|(p, _, _, _)| *p == platform)
            .map(|(_, _, guild, channel)| (*guild, *channel))
            .collect();
        inner.dedup.retain(|(guild, channel, p, _)| {
            *p != platform || still_bound.contains(&(*guild, *channel))
        });
        Ok(())
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn observe_post(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        platform: Platform,
        post_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .dedup
            .insert((guild_id, channel_id, platform, post_id.to_owned())))
    }
}

#[async_trait]
impl GiveawayStore for MemoryStore {
    async fn insert_giveaway(&self, giveaway: &Giveaway) -> Result<(), StoreError> {
        self.lock().giveaways.insert(
            (giveaway.guild_id, giveaway.channel_id, giveaway.message_id),
            giveaway.clone(),
        );
        Ok(())
    }

    async fn giveaway(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<Option<Giveaway>, StoreError> {
        Ok(self
            .lock()
            .giveaways
            .get(&(guild_id, channel_id, message_id))
            .cloned())
    }

    async fn mark_ended(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.giveaways.get_mut(&(guild_id, channel_id, message_id)) {
            Some(giveaway) if !giveaway.ended => {
                giveaway.ended = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn assignments(&self) -> Result<Vec<(GuildId, InstanceId)>, StoreError> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .map(|(guild, instance)| (*guild, instance.clone()))
            .collect())
    }
}
