//! Deferred-execution scheduler backend for a multi-instance guild bot.
//!
//! Durable tasks, moderation reversals, recurring timers and feed
//! subscriptions all live in one shared database; exclusive task claims and
//! compare-and-set updates are the only coordination between instances.

pub mod constants;
pub mod dispatch;
pub mod error;
pub mod giveaway;
pub mod handler;
pub mod models;
pub mod moderation;
pub mod outbox;
pub mod recurring;
pub mod router;
pub mod store;
pub mod subscription;
pub mod task;

pub use dispatch::Dispatcher;
pub use error::{HandlerError, StoreError};
pub use handler::{HandlerRegistry, TaskHandler};
pub use router::InstanceRouter;
pub use task::{ClaimedTask, TaskOutcome, TaskPayload};
