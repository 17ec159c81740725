use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! snowflake_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

snowflake_id!(
    /// A tenant (isolated community); the primary sharding unit
    GuildId
);
snowflake_id!(ChannelId);
snowflake_id!(UserId);
snowflake_id!(MessageId);

/// Identifier of a durable deferred task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a service process that owns a shard of guilds
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a moderation case was issued against
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    User,
    Role,
    Other,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Role => "role",
            Self::Other => "other",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "role" => Some(Self::Role),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Temporary punishment kinds the scheduler knows how to reverse
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Mute,
    Jail,
    Ban,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mute => "mute",
            Self::Jail => "jail",
            Self::Ban => "ban",
        }
    }

    /// The gateway-side action that undoes this punishment
    pub fn reversal(self) -> &'static str {
        match self {
            Self::Mute => "unmute",
            Self::Jail => "unjail",
            Self::Ban => "unban",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "mute" => Some(Self::Mute),
            "jail" => Some(Self::Jail),
            "ban" => Some(Self::Ban),
            _ => None,
        }
    }
}

/// External content platform a feed subscription belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    Twitch,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Twitch => "twitch",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "youtube" => Some(Self::Youtube),
            "twitch" => Some(Self::Twitch),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_reversal() {
        assert_eq!(ActionKind::Mute.reversal(), "unmute");
        assert_eq!(ActionKind::Jail.reversal(), "unjail");
        assert_eq!(ActionKind::Ban.reversal(), "unban");
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [ActionKind::Mute, ActionKind::Jail, ActionKind::Ban] {
            assert_eq!(ActionKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ActionKind::from_str("warn"), None);
        assert_eq!(TargetKind::from_str("role"), Some(TargetKind::Role));
        assert_eq!(Platform::from_str("twitch"), Some(Platform::Twitch));
        assert_eq!(Platform::from_str("myspace"), None);
    }
}
