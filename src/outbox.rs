//! Outbox-backed gateway implementations.
//!
//! The scheduler process does not talk to the chat platform itself. Every
//! outward effect is appended to the `outbox` table in the same database the
//! tasks live in, and the gateway process drains it. Appending is the success
//! criterion here: once the row is durable the effect will happen, and
//! outcomes the platform only learns later (a vanished target, a deleted
//! message) are handled by the consumer.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

use crate::constants::PUBSUB_LEASE_SECS;
use crate::error::HandlerError;
use crate::giveaway::{ConcludeOutcome, GiveawayGateway};
use crate::models::{ChannelId, GuildId, MessageId, Platform};
use crate::moderation::{ModerationCase, ModerationGateway, RevertOutcome};
use crate::recurring::RecurringGateway;
use crate::store::postgres::Database;
use crate::subscription::{Delivery, Notifier, PlatformClient};

/// Gateway that records effects in the shared-database outbox
#[derive(Clone)]
pub struct OutboxGateway {
    db: Database,
}

impl OutboxGateway {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ModerationGateway for OutboxGateway {
    async fn revert(&self, case: &ModerationCase) -> Result<RevertOutcome, HandlerError> {
        self.db
            .push_outbox(
                Some(case.guild_id),
                "revert_sanction",
                json!({
                    "case_id": case.case_id,
                    "target_id": case.target_id,
                    "target_kind": case.target_kind.as_str(),
                    "action": case.action.reversal(),
                }),
            )
            .await?;
        Ok(RevertOutcome::Reverted)
    }
}

#[async_trait]
impl RecurringGateway for OutboxGateway {
    async fn announce(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        template: &Value,
    ) -> Result<(), HandlerError> {
        self.db
            .push_outbox(
                Some(guild_id),
                "announce",
                json!({
                    "channel_id": channel_id.get(),
                    "template": template,
                }),
            )
            .await?;
        Ok(())
    }

    async fn nuke_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<(), HandlerError> {
        self.db
            .push_outbox(
                Some(guild_id),
                "nuke_channel",
                json!({ "channel_id": channel_id.get() }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for OutboxGateway {
    async fn deliver(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<Delivery, HandlerError> {
        self.db
            .push_outbox(
                Some(guild_id),
                "deliver_post",
                json!({
                    "channel_id": channel_id.get(),
                    "content": content,
                }),
            )
            .await?;
        Ok(Delivery::Delivered)
    }
}

#[async_trait]
impl PlatformClient for OutboxGateway {
    async fn renew(
        &self,
        platform: Platform,
        feed_id: &str,
    ) -> Result<DateTime<Utc>, HandlerError> {
        self.db
            .push_outbox(
                None,
                "renew_subscription",
                json!({
                    "platform": platform.as_str(),
                    "feed_id": feed_id,
                }),
            )
            .await?;
        Ok(Utc::now() + Duration::seconds(PUBSUB_LEASE_SECS))
    }
}

#[async_trait]
impl GiveawayGateway for OutboxGateway {
    async fn conclude(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<ConcludeOutcome, HandlerError> {
        self.db
            .push_outbox(
                Some(guild_id),
                "conclude_giveaway",
                json!({
                    "channel_id": channel_id.get(),
                    "message_id": message_id.get(),
                }),
            )
            .await?;
        Ok(ConcludeOutcome::Concluded)
    }
}
