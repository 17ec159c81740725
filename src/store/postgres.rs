//! Postgres store backend.
//!
//! One shared database is the only coordination between instances: claims
//! take rows with `FOR UPDATE SKIP LOCKED`, and every flag flip or timer
//! advance is a guarded UPDATE whose row count tells the caller whether it
//! won the race.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::error::StoreError;
use crate::giveaway::Giveaway;
use crate::models::{ChannelId, GuildId, InstanceId, MessageId, Platform, TaskId};
use crate::moderation::{ModerationCase, NewCase};
use crate::recurring::{RecurringTimer, TimerKind};
use crate::subscription::Subscription;
use crate::task::{ClaimedTask, TaskOutcome};

use super::{
    CaseStore, DedupStore, GiveawayStore, InstanceStore, RecurringStore, SubscriptionStore,
    TaskStore,
};

/// Database connection pool wrapper
///
/// Handles all durable state for the scheduler: deferred tasks, moderation
/// cases, recurring timers, subscriptions, dedup history, giveaways and the
/// outbound-effect outbox.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection and run migrations
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Database connected and migrations completed");
        Ok(db)
    }

    /// Run database migrations to create tables
    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                payload JSONB NOT NULL,
                guild_id BIGINT,
                fire_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                attempts INTEGER NOT NULL DEFAULT 0,
                dead BOOLEAN NOT NULL DEFAULT FALSE,
                claimed_by TEXT,
                claimed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS tasks_due_idx
            ON tasks (fire_at, id)
            WHERE claimed_by IS NULL AND NOT dead
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                guild_id BIGINT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                owner_id BIGINT NOT NULL,
                token TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'online'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mod_cases (
                guild_id BIGINT NOT NULL,
                case_id INTEGER NOT NULL,
                target_id BIGINT NOT NULL,
                target_kind TEXT NOT NULL,
                moderator_id BIGINT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT,
                expires_at TIMESTAMPTZ,
                processed BOOLEAN NOT NULL DEFAULT FALSE,
                resolution TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (guild_id, case_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recurring_timers (
                guild_id BIGINT NOT NULL,
                channel_id BIGINT NOT NULL,
                kind TEXT NOT NULL,
                interval_secs BIGINT NOT NULL,
                next_fire TIMESTAMPTZ NOT NULL,
                template JSONB NOT NULL DEFAULT '{}'::jsonb,
                PRIMARY KEY (guild_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                platform TEXT NOT NULL,
                feed_id TEXT NOT NULL,
                expires_at TIMESTAMPTZ,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                renewal_pending BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (platform, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_bindings (
                platform TEXT NOT NULL,
                feed_id TEXT NOT NULL,
                guild_id BIGINT NOT NULL,
                channel_id BIGINT NOT NULL,
                PRIMARY KEY (platform, feed_id, guild_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_log (
                guild_id BIGINT NOT NULL,
                channel_id BIGINT NOT NULL,
                platform TEXT NOT NULL,
                post_id TEXT NOT NULL,
                posted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (guild_id, channel_id, platform, post_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS giveaways (
                guild_id BIGINT NOT NULL,
                channel_id BIGINT NOT NULL,
                message_id BIGINT NOT NULL,
                ends_at TIMESTAMPTZ NOT NULL,
                ended BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (guild_id, channel_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id BIGSERIAL PRIMARY KEY,
                guild_id BIGINT,
                kind TEXT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append an outbound side effect for the gateway process to consume
    pub async fn push_outbox(
        &self,
        guild_id: Option<GuildId>,
        kind: &str,
        body: Value,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO outbox (guild_id, kind, body) VALUES ($1, $2, $3)")
            .bind(guild_id.map(|id| id.get() as i64))
            .bind(kind)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for Database {
    async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        guild_id: Option<GuildId>,
        fire_at: DateTime<Utc>,
    ) -> Result<TaskId, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tasks (kind, payload, guild_id, fire_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(kind)
        .bind(payload)
        .bind(guild_id.map(|id| id.get() as i64))
        .bind(fire_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(TaskId(id))
    }

    async fn claim_due(
        &self,
        claimant: &InstanceId,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        type TaskRow = (i64, String, Value, Option<i64>, DateTime<Utc>, i32, DateTime<Utc>);
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET claimed_by = $1, claimed_at = $2
            WHERE id IN (
                SELECT id FROM tasks
                WHERE fire_at <= $2 AND claimed_by IS NULL AND NOT dead
                ORDER BY fire_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, payload, guild_id, fire_at, attempts, created_at
            "#,
        )
        .bind(claimant.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed: Vec<ClaimedTask> = rows
            .into_iter()
            .map(
                |(id, kind, payload, guild_id, fire_at, attempts, created_at)| ClaimedTask {
                    id: TaskId(id),
                    kind,
                    payload,
                    guild_id: guild_id.map(|id| GuildId::new(id as u64)),
                    fire_at,
                    attempts,
                    created_at,
                },
            )
            .collect();
        // RETURNING does not guarantee order
        claimed.sort_by_key(|t| (t.fire_at, t.id));
        Ok(claimed)
    }

    async fn resolve(&self, id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        match outcome {
            TaskOutcome::Done => {
                sqlx::query("DELETE FROM tasks WHERE id = $1")
                    .bind(id.0)
                    .execute(&self.pool)
                    .await?;
            }
            TaskOutcome::RetryAt(fire_at) => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET claimed_by = NULL, claimed_at = NULL,
                        fire_at = $2, attempts = attempts + 1
                    WHERE id = $1
                    "#,
                )
                .bind(id.0)
                .bind(fire_at)
                .execute(&self.pool)
                .await?;
            }
            TaskOutcome::Dead => {
                sqlx::query(
                    "UPDATE tasks SET claimed_by = NULL, claimed_at = NULL, dead = TRUE WHERE id = $1",
                )
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn release(&self, id: TaskId) -> Result<(), StoreError> {
        sqlx::query("UPDATE tasks SET claimed_by = NULL, claimed_at = NULL WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel(&self, id: TaskId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1 AND claimed_by IS NULL")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_fire_at(
        &self,
        claimant: &InstanceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (next,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MIN(t.fire_at) FROM tasks t
            WHERE t.claimed_by IS NULL AND NOT t.dead
            AND (t.guild_id IS NULL OR EXISTS (
                SELECT 1 FROM instances i
                WHERE i.guild_id = t.guild_id
                AND i.instance_id = $1 AND i.status = 'online'
            ))
            "#,
        )
        .bind(claimant.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }
}

#[async_trait]
impl CaseStore for Database {
    async fn open_case(&self, new: &NewCase) -> Result<i32, StoreError> {
        let (case_id,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO mod_cases (
                guild_id, case_id, target_id, target_kind,
                moderator_id, action, reason, expires_at
            )
            SELECT $1, COALESCE(MAX(case_id), 0) + 1, $2, $3, $4, $5, $6, $7
            FROM mod_cases WHERE guild_id = $1
            RETURNING case_id
            "#,
        )
        .bind(new.guild_id.get() as i64)
        .bind(new.target_id as i64)
        .bind(new.target_kind.as_str())
        .bind(new.moderator_id.get() as i64)
        .bind(new.action.as_str())
        .bind(&new.reason)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(case_id)
    }

    async fn case(
        &self,
        guild_id: GuildId,
        case_id: i32,
    ) -> Result<Option<ModerationCase>, StoreError> {
        type CaseRow = (
            i64,
            String,
            i64,
            String,
            Option<String>,
            Option<DateTime<Utc>>,
            bool,
            Option<String>,
            DateTime<Utc>,
            DateTime<Utc>,
        );
        let row: Option<CaseRow> = sqlx::query_as(
            r#"
            SELECT target_id, target_kind, moderator_id, action, reason,
                   expires_at, processed, resolution, created_at, updated_at
            FROM mod_cases WHERE guild_id = $1 AND case_id = $2
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(
            |(
                target_id,
                target_kind,
                moderator_id,
                action,
                reason,
                expires_at,
                processed,
                resolution,
                created_at,
                updated_at,
            )| {
                Ok(ModerationCase {
                    guild_id,
                    case_id,
                    target_id: target_id as u64,
                    target_kind: crate::models::TargetKind::from_str(&target_kind)
                        .ok_or_else(|| {
                            StoreError::Invalid(format!("unknown target kind `{target_kind}`"))
                        })?,
                    moderator_id: crate::models::UserId::new(moderator_id as u64),
                    action: crate::models::ActionKind::from_str(&action).ok_or_else(|| {
                        StoreError::Invalid(format!("unknown action kind `{action}`"))
                    })?,
                    reason,
                    expires_at,
                    processed,
                    resolution,
                    created_at,
                    updated_at,
                })
            },
        )
        .transpose()
    }

    async fn mark_processed(&self, guild_id: GuildId, case_id: i32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE mod_cases
            SET processed = TRUE, updated_at = NOW()
            WHERE guild_id = $1 AND case_id = $2 AND processed = FALSE
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(case_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_resolution(
        &self,
        guild_id: GuildId,
        case_id: i32,
        resolution: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE mod_cases
            SET resolution = $3, updated_at = NOW()
            WHERE guild_id = $1 AND case_id = $2
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(case_id)
        .bind(resolution)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn timer_from_row(
    guild_id: i64,
    channel_id: i64,
    kind: String,
    interval_secs: i64,
    next_fire: DateTime<Utc>,
    template: Value,
) -> Result<RecurringTimer, StoreError> {
    Ok(RecurringTimer {
        guild_id: GuildId::new(guild_id as u64),
        channel_id: ChannelId::new(channel_id as u64),
        kind: TimerKind::from_str(&kind)
            .ok_or_else(|| StoreError::Invalid(format!("unknown timer kind `{kind}`")))?,
        interval: Duration::seconds(interval_secs),
        next_fire,
        template,
    })
}

#[async_trait]
impl RecurringStore for Database {
    async fn upsert_timer(&self, timer: &RecurringTimer) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recurring_timers (
                guild_id, channel_id, kind, interval_secs, next_fire, template
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (guild_id, channel_id)
            DO UPDATE SET
                kind = EXCLUDED.kind,
                interval_secs = EXCLUDED.interval_secs,
                next_fire = EXCLUDED.next_fire,
                template = EXCLUDED.template
            "#,
        )
        .bind(timer.guild_id.get() as i64)
        .bind(timer.channel_id.get() as i64)
        .bind(timer.kind.as_str())
        .bind(timer.interval.num_seconds())
        .bind(timer.next_fire)
        .bind(&timer.template)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTimer>, StoreError> {
        type TimerRow = (i64, i64, String, i64, DateTime<Utc>, Value);
        let rows: Vec<TimerRow> = sqlx::query_as(
            r#"
            SELECT guild_id, channel_id, kind, interval_secs, next_fire, template
            FROM recurring_timers
            WHERE next_fire <= $1
            ORDER BY next_fire, guild_id, channel_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(guild_id, channel_id, kind, interval_secs, next_fire, template)| {
                timer_from_row(guild_id, channel_id, kind, interval_secs, next_fire, template)
            })
            .collect()
    }

    async fn advance_timer(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_timers
            SET next_fire = $4
            WHERE guild_id = $1 AND channel_id = $2 AND next_fire = $3
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(channel_id.get() as i64)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_timer(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM recurring_timers WHERE guild_id = $1 AND channel_id = $2")
                .bind(guild_id.get() as i64)
                .bind(channel_id.get() as i64)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_timer_at(
        &self,
        claimant: &InstanceId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let (next,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            r#"
            SELECT MIN(t.next_fire) FROM recurring_timers t
            WHERE EXISTS (
                SELECT 1 FROM instances i
                WHERE i.guild_id = t.guild_id
                AND i.instance_id = $1 AND i.status = 'online'
            )
            "#,
        )
        .bind(claimant.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }
}

fn subscription_from_row(
    platform: String,
    feed_id: String,
    expires_at: Option<DateTime<Utc>>,
    active: bool,
    renewal_pending: bool,
) -> Result<Subscription, StoreError> {
    Ok(Subscription {
        platform: Platform::from_str(&platform)
            .ok_or_else(|| StoreError::Invalid(format!("unknown platform `{platform}`")))?,
        feed_id,
        expires_at,
        active,
        renewal_pending,
    })
}

#[async_trait]
impl SubscriptionStore for Database {
    async fn upsert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (platform, feed_id, expires_at, active, renewal_pending)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (platform, feed_id)
            DO UPDATE SET
                expires_at = EXCLUDED.expires_at,
                active = EXCLUDED.active,
                renewal_pending = EXCLUDED.renewal_pending
            "#,
        )
        .bind(sub.platform.as_str())
        .bind(&sub.feed_id)
        .bind(sub.expires_at)
        .bind(sub.active)
        .bind(sub.renewal_pending)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let row: Option<(Option<DateTime<Utc>>, bool, bool)> = sqlx::query_as(
            r#"
            SELECT expires_at, active, renewal_pending
            FROM subscriptions WHERE platform = $1 AND feed_id = $2
            "#,
        )
        .bind(platform.as_str())
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(expires_at, active, renewal_pending)| Subscription {
            platform,
            feed_id: feed_id.to_owned(),
            expires_at,
            active,
            renewal_pending,
        }))
    }

    async fn renewal_candidates(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Subscription>, StoreError> {
        type SubRow = (String, String, Option<DateTime<Utc>>, bool, bool);
        let rows: Vec<SubRow> = sqlx::query_as(
            r#"
            SELECT platform, feed_id, expires_at, active, renewal_pending
            FROM subscriptions
            WHERE active AND NOT renewal_pending
              AND expires_at IS NOT NULL
              AND expires_at > $1 AND expires_at <= $2
            "#,
        )
        .bind(now)
        .bind(now + window)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(platform, feed_id, expires_at, active, renewal_pending)| {
                subscription_from_row(platform, feed_id, expires_at, active, renewal_pending)
            })
            .collect()
    }

    async fn set_renewal_pending(
        &self,
        platform: Platform,
        feed_id: &str,
        pending: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions SET renewal_pending = $3 WHERE platform = $1 AND feed_id = $2",
        )
        .bind(platform.as_str())
        .bind(feed_id)
        .bind(pending)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_renewal(
        &self,
        platform: Platform,
        feed_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET expires_at = $3, active = TRUE, renewal_pending = FALSE
            WHERE platform = $1 AND feed_id = $2
            "#,
        )
        .bind(platform.as_str())
        .bind(feed_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET active = FALSE WHERE active AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET active = FALSE WHERE platform = $1 AND feed_id = $2")
            .bind(platform.as_str())
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_subscription(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE platform = $1 AND feed_id = $2")
            .bind(platform.as_str())
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bind_feed(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_bindings (platform, feed_id, guild_id, channel_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (platform, feed_id, guild_id, channel_id) DO NOTHING
            "#,
        )
        .bind(platform.as_str())
        .bind(feed_id)
        .bind(guild_id.get() as i64)
        .bind(channel_id.get() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unbind_feed(
        &self,
        platform: Platform,
        feed_id: &str,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_bindings
            WHERE platform = $1 AND feed_id = $2 AND guild_id = $3 AND channel_id = $4
            "#,
        )
        .bind(platform.as_str())
        .bind(feed_id)
        .bind(guild_id.get() as i64)
        .bind(channel_id.get() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn feed_targets(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<Vec<(GuildId, ChannelId)>, StoreError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT guild_id, channel_id FROM feed_bindings WHERE platform = $1 AND feed_id = $2",
        )
        .bind(platform.as_str())
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(guild_id, channel_id)| {
                (
                    GuildId::new(guild_id as u64),
                    ChannelId::new(channel_id as u64),
                )
            })
            .collect())
    }

    async fn purge_feed(&self, platform: Platform, feed_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM feed_bindings WHERE platform = $1 AND feed_id = $2")
            .bind(platform.as_str())
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        // Dedup rows are keyed by post, not feed; drop the platform's rows
        // for channels no longer bound to anything on that platform
        sqlx::query(
            r#"
            DELETE FROM dedup_log d
            WHERE d.platform = $1
            AND NOT EXISTS (
                SELECT 1 FROM feed_bindings b
                WHERE b.platform = d.platform
                AND b.guild_id = d.guild_id
                AND b.channel_id = d.channel_id
            )
            "#,
        )
        .bind(platform.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for Database {
    async fn observe_post(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        platform: Platform,
        post_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_log (guild_id, channel_id, platform, post_id, posted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (guild_id, channel_id, platform, post_id) DO NOTHING
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(channel_id.get() as i64)
        .bind(platform.as_str())
        .bind(post_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl GiveawayStore for Database {
    async fn insert_giveaway(&self, giveaway: &Giveaway) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO giveaways (guild_id, channel_id, message_id, ends_at, ended)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (guild_id, channel_id, message_id) DO NOTHING
            "#,
        )
        .bind(giveaway.guild_id.get() as i64)
        .bind(giveaway.channel_id.get() as i64)
        .bind(giveaway.message_id.get() as i64)
        .bind(giveaway.ends_at)
        .bind(giveaway.ended)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn giveaway(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<Option<Giveaway>, StoreError> {
        let row: Option<(DateTime<Utc>, bool)> = sqlx::query_as(
            r#"
            SELECT ends_at, ended FROM giveaways
            WHERE guild_id = $1 AND channel_id = $2 AND message_id = $3
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(channel_id.get() as i64)
        .bind(message_id.get() as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(ends_at, ended)| Giveaway {
            guild_id,
            channel_id,
            message_id,
            ends_at,
            ended,
        }))
    }

    async fn mark_ended(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE giveaways
            SET ended = TRUE
            WHERE guild_id = $1 AND channel_id = $2 AND message_id = $3 AND ended = FALSE
            "#,
        )
        .bind(guild_id.get() as i64)
        .bind(channel_id.get() as i64)
        .bind(message_id.get() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl InstanceStore for Database {
    async fn assignments(&self) -> Result<Vec<(GuildId, InstanceId)>, StoreError> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT guild_id, instance_id FROM instances WHERE status = 'online'")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(guild_id, instance_id)| {
                (GuildId::new(guild_id as u64), InstanceId::new(instance_id))
            })
            .collect())
    }
}
