//! Event handler that builds tasks through a factory and submits them.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::event::{EventError, EventHandler, TaskRequestEvent};
use crate::factory::TaskFactory;
use crate::runner::TaskSubmitter;

/// Bridges one task type from the event bus to the runner.
///
/// Events whose type does not match the factory's are ignored. For matching
/// events the payload is decoded into the factory's input, a task is built
/// and submitted. Register one handler per task type.
pub struct TaskFactoryEventHandler<F, R> {
    factory: Arc<F>,
    runner: R,
}

impl<F, R> TaskFactoryEventHandler<F, R>
where
    F: TaskFactory,
    R: TaskSubmitter,
{
    pub fn new(factory: Arc<F>, runner: R) -> Self {
        Self { factory, runner }
    }

    pub fn task_type(&self) -> &str {
        self.factory.task_type()
    }
}

#[async_trait]
impl<F, R> EventHandler for TaskFactoryEventHandler<F, R>
where
    F: TaskFactory + 'static,
    R: TaskSubmitter + 'static,
{
    async fn handle_event(
        &self,
        event: &TaskRequestEvent,
        cancel: &CancellationToken,
    ) -> Result<(), EventError> {
        if event.event_type != self.factory.task_type() {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                handles = %self.factory.task_type(),
                "ignoring event of unrelated type"
            );
            return Ok(());
        }

        let input: F::Input = event.decode_payload().map_err(|source| {
            error!(event_id = %event.id, error = %source, "failed to decode event payload");
            EventError::Payload {
                event_id: event.id,
                source,
            }
        })?;

        let task = self.factory.create(input).map_err(|e| {
            error!(event_id = %event.id, event_type = %event.event_type, error = %e, "failed to create task");
            e
        })?;
        let task_id = task.id();

        self.runner.submit_task(task, cancel).await.map_err(|e| {
            error!(
                event_id = %event.id,
                task_id = %task_id,
                durable = e.is_durable(),
                error = %e,
                "failed to submit task"
            );
            e
        })?;

        info!(
            event_id = %event.id,
            task_id = %task_id,
            task_type = %event.event_type,
            "task created and submitted"
        );
        Ok(())
    }
}
