use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HandlerError;
use crate::models::{ChannelId, GuildId, MessageId, Platform, TaskId};

/// Typed payload of a deferred task, tagged by event kind.
///
/// Payloads are stored as JSON and decoded at claim time; a payload whose
/// tag is unknown or whose fields do not deserialize is data corruption and
/// gets dead-lettered instead of silently executing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskPayload {
    /// A temporary punishment reached its expiry and must be reversed
    CaseExpiry { guild_id: GuildId, case_id: i32 },
    /// A giveaway reached its end timestamp
    GiveawayEnd {
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    },
    /// A pubsub subscription is inside the renewal window
    SubscriptionRenewal { platform: Platform, feed_id: String },
    /// A dropped subscription's bindings and dedup rows must be removed
    SubscriptionCleanup { platform: Platform, feed_id: String },
    /// A deduplicated feed post awaiting delivery to one guild channel
    FeedPost {
        guild_id: GuildId,
        channel_id: ChannelId,
        platform: Platform,
        feed_id: String,
        post_id: String,
        content: String,
    },
}

impl TaskPayload {
    /// Event kind tag, also stored in the task row for indexing
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CaseExpiry { .. } => "case_expiry",
            Self::GiveawayEnd { .. } => "giveaway_end",
            Self::SubscriptionRenewal { .. } => "subscription_renewal",
            Self::SubscriptionCleanup { .. } => "subscription_cleanup",
            Self::FeedPost { .. } => "feed_post",
        }
    }

    /// Guild the task acts on, if it is guild-scoped.
    ///
    /// Platform-scoped work (subscription renewal and cleanup) carries no
    /// guild and is claimable by any instance.
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::CaseExpiry { guild_id, .. }
            | Self::GiveawayEnd { guild_id, .. }
            | Self::FeedPost { guild_id, .. } => Some(*guild_id),
            Self::SubscriptionRenewal { .. } | Self::SubscriptionCleanup { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode a claimed payload, checking it against the stored kind tag
    pub fn decode(kind: &str, value: Value) -> Result<Self, HandlerError> {
        let payload: Self = serde_json::from_value(value)
            .map_err(|e| HandlerError::Corrupt(format!("undecodable `{kind}` payload: {e}")))?;
        if payload.kind() != kind {
            return Err(HandlerError::Corrupt(format!(
                "payload tagged `{}` stored under kind `{kind}`",
                payload.kind()
            )));
        }
        Ok(payload)
    }
}

/// A due task exclusively claimed by one dispatcher
#[derive(Clone, Debug)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub kind: String,
    pub payload: Value,
    pub guild_id: Option<GuildId>,
    pub fire_at: DateTime<Utc>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// How a claimed task is settled
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TaskOutcome {
    /// Consumed; the row is deleted
    Done,
    /// Failed transiently; requeued for the given time with attempts + 1
    RetryAt(DateTime<Utc>),
    /// Failed permanently; kept for operator visibility, never re-claimed
    Dead,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_case_expiry() {
        let value = json!({"event": "case_expiry", "guild_id": 1001, "case_id": 7});
        let payload = TaskPayload::decode("case_expiry", value).expect("decodes");
        assert_eq!(
            payload,
            TaskPayload::CaseExpiry {
                guild_id: GuildId::new(1001),
                case_id: 7,
            }
        );
    }

    #[test]
    fn test_decode_unknown_kind_is_corrupt() {
        let value = json!({"event": "reindex_galaxy"});
        let err = TaskPayload::decode("reindex_galaxy", value).unwrap_err();
        assert!(matches!(err, HandlerError::Corrupt(_)));
    }

    #[test]
    fn test_decode_kind_mismatch_is_corrupt() {
        let value = json!({"event": "case_expiry", "guild_id": 1, "case_id": 2});
        let err = TaskPayload::decode("giveaway_end", value).unwrap_err();
        assert!(matches!(err, HandlerError::Corrupt(_)));
    }

    #[test]
    fn test_guild_scope() {
        let renewal = TaskPayload::SubscriptionRenewal {
            platform: Platform::Youtube,
            feed_id: "UC123".into(),
        };
        assert_eq!(renewal.guild_id(), None);

        let expiry = TaskPayload::CaseExpiry {
            guild_id: GuildId::new(42),
            case_id: 1,
        };
        assert_eq!(expiry.guild_id(), Some(GuildId::new(42)));
    }
}
