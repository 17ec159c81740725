use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{HandlerError, StoreError};
use crate::task::{ClaimedTask, TaskPayload};

/// Domain logic invoked for one event kind.
///
/// Handlers are the boundary to external collaborators: they receive the
/// decoded payload and perform the side effect (reverse a sanction, deliver
/// a notification, renew a subscription). A handler that receives a payload
/// variant it did not register for must report corruption, not guess.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The event kind this handler consumes
    fn kind(&self) -> &'static str;

    async fn handle(&self, task: &ClaimedTask, payload: TaskPayload) -> Result<(), HandlerError>;

    /// Called after a task of this kind is dead-lettered; the last chance
    /// to release state the pending task was holding
    async fn abandoned(
        &self,
        _task: &ClaimedTask,
        _payload: TaskPayload,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Pluggable map from event kind to handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own kind; replaces any previous one
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}

/// Corruption error for a payload variant the handler does not consume
pub fn unexpected_payload(handler_kind: &str, payload: &TaskPayload) -> HandlerError {
    HandlerError::Corrupt(format!(
        "handler `{handler_kind}` received `{}` payload",
        payload.kind()
    ))
}
