use thiserror::Error;

/// Failure taxonomy for task handlers.
///
/// The dispatcher decides what happens to the claimed task based on the
/// variant: `Transient` is retried with backoff up to a ceiling, `Corrupt`
/// is dead-lettered immediately, and the remaining variants are terminal
/// with a log entry.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Network trouble or rate limiting; worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// The bot lacks the capability to perform the action
    #[error("missing permission: {0}")]
    PermissionDenied(String),

    /// The target is already gone (user left, channel deleted)
    #[error("target no longer exists")]
    NotFound,

    /// Malformed payload or unknown event kind; never retried
    #[error("malformed payload: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the durable stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored column holds a value the code no longer understands
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(msg) => Self::Corrupt(msg),
            other => Self::Transient(other.to_string()),
        }
    }
}
