//! Flashcard generation from memos: the reference task type.
//!
//! The memo, card generation and card persistence layers are abstract here;
//! the service wires in its own implementations.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::factory::{FactoryError, TaskFactory};
use crate::task::{Task, TaskContext, TaskId};

/// Task type tag for memo generation.
pub const MEMO_GENERATION: &str = "memo_generation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoStatus {
    Pending,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl fmt::Display for MemoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        })
    }
}

/// Text a user submitted for flashcard generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub text: String,
    pub status: MemoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memo {
    pub fn new(user_id: Uuid, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            text: text.into(),
            status: MemoStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A generated flashcard. `content` is free-form JSON (front, back, hints).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub memo_id: Uuid,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Card {
    pub fn new(user_id: Uuid, memo_id: Uuid, content: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            memo_id,
            content,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MemoService: Send + Sync {
    async fn get_memo(&self, memo_id: Uuid) -> anyhow::Result<Memo>;

    async fn update_memo_status(&self, memo_id: Uuid, status: MemoStatus) -> anyhow::Result<()>;
}

#[async_trait]
pub trait CardGenerator: Send + Sync {
    async fn generate_cards(&self, memo_text: &str, user_id: Uuid) -> anyhow::Result<Vec<Card>>;
}

#[async_trait]
pub trait CardRepository: Send + Sync {
    /// Save all cards or none of them.
    async fn create_cards(&self, cards: &[Card]) -> anyhow::Result<()>;
}

/// Payload of a `memo_generation` event and task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoGenerationRequest {
    pub memo_id: Uuid,
}

/// Generates flashcards for one memo.
pub struct MemoGenerationTask {
    id: TaskId,
    memo_id: Uuid,
    payload: Vec<u8>,
    memo_service: Arc<dyn MemoService>,
    generator: Arc<dyn CardGenerator>,
    card_repo: Arc<dyn CardRepository>,
}

impl MemoGenerationTask {
    pub fn memo_id(&self) -> Uuid {
        self.memo_id
    }

    /// Best-effort memo status write on a failure path.
    async fn mark_memo_failed(&self) {
        if let Err(e) = self
            .memo_service
            .update_memo_status(self.memo_id, MemoStatus::Failed)
            .await
        {
            warn!(task_id = %self.id, memo_id = %self.memo_id, error = %e, "failed to mark memo as failed");
        }
    }
}

#[async_trait]
impl Task for MemoGenerationTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn task_type(&self) -> &str {
        MEMO_GENERATION
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let (task_id, memo_id) = (self.id, self.memo_id);
        info!(%task_id, %memo_id, "starting memo generation task");

        if ctx.is_cancelled() {
            anyhow::bail!("task cancelled before start");
        }

        let memo = self
            .memo_service
            .get_memo(memo_id)
            .await
            .context("failed to retrieve memo")?;
        info!(%task_id, %memo_id, user_id = %memo.user_id, memo_status = %memo.status, "retrieved memo");

        self.memo_service
            .update_memo_status(memo_id, MemoStatus::Processing)
            .await
            .context("failed to update memo status to processing")?;

        let cards = match self.generator.generate_cards(&memo.text, memo.user_id).await {
            Ok(cards) => cards,
            Err(e) => {
                self.mark_memo_failed().await;
                return Err(e.context("failed to generate cards"));
            }
        };
        info!(%task_id, %memo_id, count = cards.len(), "cards generated");

        if cards.is_empty() {
            warn!(%task_id, %memo_id, "memo processing completed but no cards were generated");
        } else if let Err(e) = self.card_repo.create_cards(&cards).await {
            self.mark_memo_failed().await;
            return Err(e.context("failed to save generated cards"));
        }

        // The cards are saved at this point; a failed status write is not a task failure.
        if let Err(e) = self
            .memo_service
            .update_memo_status(memo_id, MemoStatus::Completed)
            .await
        {
            error!(
                %task_id,
                %memo_id,
                cards_generated = cards.len(),
                error = %e,
                "failed to update memo final status, but cards were generated and saved"
            );
        }

        info!(%task_id, %memo_id, cards_generated = cards.len(), "memo generation task completed");
        Ok(())
    }
}

/// Builds [`MemoGenerationTask`]s with their collaborators attached.
#[derive(Clone)]
pub struct MemoGenerationTaskFactory {
    memo_service: Arc<dyn MemoService>,
    generator: Arc<dyn CardGenerator>,
    card_repo: Arc<dyn CardRepository>,
}

impl MemoGenerationTaskFactory {
    pub fn new(
        memo_service: Arc<dyn MemoService>,
        generator: Arc<dyn CardGenerator>,
        card_repo: Arc<dyn CardRepository>,
    ) -> Self {
        Self {
            memo_service,
            generator,
            card_repo,
        }
    }
}

impl TaskFactory for MemoGenerationTaskFactory {
    type Input = MemoGenerationRequest;

    fn task_type(&self) -> &str {
        MEMO_GENERATION
    }

    fn build(&self, id: TaskId, input: MemoGenerationRequest) -> Result<Arc<dyn Task>, FactoryError> {
        if input.memo_id.is_nil() {
            return Err(FactoryError::InvalidInput("memo id cannot be empty".into()));
        }
        let payload =
            serde_json::to_vec(&input).map_err(|e| FactoryError::InvalidInput(e.to_string()))?;

        Ok(Arc::new(MemoGenerationTask {
            id,
            memo_id: input.memo_id,
            payload,
            memo_service: self.memo_service.clone(),
            generator: self.generator.clone(),
            card_repo: self.card_repo.clone(),
        }))
    }
}
