/// Log directive for the application
pub const LOG_DIRECTIVE: &str = "guildclock=info";

/// Maximum number of tasks claimed in one dispatcher pass
pub const CLAIM_BATCH_LIMIT: i64 = 100;

/// Retry ceiling before a failing task is dead-lettered
pub const MAX_TASK_ATTEMPTS: i32 = 5;

/// Base delay for exponential retry backoff
pub const RETRY_BASE_SECS: i64 = 30;

/// Upper bound on a single retry delay
pub const RETRY_CAP_SECS: i64 = 3_600;

/// Fallback wake interval when no deadline is known
pub const POLL_FALLBACK_SECS: u64 = 60;

/// How long the guild-to-instance assignment cache stays fresh
pub const ROUTER_REFRESH_SECS: i64 = 30;

/// Subscriptions expiring within this window get a renewal issued
pub const RENEWAL_WINDOW_SECS: i64 = 6 * 3_600;

/// Interval between subscription maintenance sweeps
pub const SWEEP_INTERVAL_SECS: i64 = 300;

/// Lease granted to a renewed pubsub subscription
pub const PUBSUB_LEASE_SECS: i64 = 864_000;
