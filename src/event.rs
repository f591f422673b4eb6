//! In-process event bus that turns domain events into task submissions.
//!
//! Producers emit a [`TaskRequestEvent`]; every registered [`EventHandler`]
//! sees it. Events are not persisted: work only becomes durable once a
//! handler has submitted a task to the runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::factory::FactoryError;
use crate::runner::SubmitError;
use crate::task::panic_message;

/// Request to create a background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequestEvent {
    pub id: Uuid,
    /// Task type that should be created.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Task-specific data, serialized as JSON.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl TaskRequestEvent {
    /// New event with `payload` serialized to JSON.
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_bytes(event_type, serde_json::to_vec(payload)?))
    }

    /// New event carrying already-serialized bytes.
    pub fn from_bytes(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Decode the payload into `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Error returned by an event handler.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("failed to unmarshal payload of event {event_id}: {source}")]
    Payload {
        event_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to create task: {0}")]
    Factory(#[from] FactoryError),

    #[error("failed to submit task: {0}")]
    Submit(#[from] SubmitError),

    #[error("event handler panicked: {0}")]
    HandlerPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Something that reacts to emitted events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(
        &self,
        event: &TaskRequestEvent,
        cancel: &CancellationToken,
    ) -> Result<(), EventError>;
}

/// Dispatches events to every registered handler.
///
/// Built once at startup and shared by reference with producers and
/// consumers. Registering the same handler twice makes it run twice.
#[derive(Default)]
pub struct EventEmitter {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write();
        handlers.push(handler);
        debug!(handler_count = handlers.len(), "registered new event handler");
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Deliver `event` to every handler, one after another.
    ///
    /// A failing or panicking handler is logged and does not stop delivery
    /// to the rest. Handlers are not retried. Returns the first handler error
    /// once all handlers have run.
    pub async fn emit(
        &self,
        event: &TaskRequestEvent,
        cancel: &CancellationToken,
    ) -> Result<(), EventError> {
        let handlers: Vec<_> = self.handlers.read().clone();

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            handler_count = handlers.len(),
            "emitting event"
        );

        if handlers.is_empty() {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no handlers registered for event"
            );
            return Ok(());
        }

        let mut first_error = None;
        for (index, handler) in handlers.iter().enumerate() {
            let outcome = AssertUnwindSafe(handler.handle_event(event, cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(EventError::HandlerPanicked(panic_message(panic.as_ref())))
                });

            if let Err(e) = outcome {
                error!(
                    handler_index = index,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "handler failed to process event"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
