//! End-to-end memo generation on an SQLite task store.
//!
//! This example demonstrates:
//! - Loading runner settings from `SCRY_TASK_*` environment variables
//! - Installing the tracing subscriber at the entry point
//! - Wiring the emitter, the factory-backed handler and the runner
//! - Waiting for the emitted work and shutting down with a grace period
//!
//! Run with `cargo run --example memo_generation`. Set `SCRY_DATABASE_URL`
//! to keep tasks in a file between runs, e.g. `sqlite://tasks.db?mode=rwc`.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use scry_tasks::telemetry::{self, LogFormat};
use scry_tasks::{
    Card, CardGenerator, CardRepository, EventEmitter, Memo, MemoGenerationRequest,
    MemoGenerationTaskFactory, MemoService, MemoStatus, SqliteTaskStore, TaskFactoryEventHandler,
    TaskRequestEvent, TaskRunner, TaskRunnerConfig, TaskStatus, TaskStore, MEMO_GENERATION,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Memos held in memory.
#[derive(Default)]
struct InMemoryMemos {
    memos: Mutex<HashMap<Uuid, Memo>>,
}

impl InMemoryMemos {
    fn add(&self, user_id: Uuid, text: &str) -> Uuid {
        let memo = Memo::new(user_id, text);
        let id = memo.id;
        self.memos.lock().insert(id, memo);
        id
    }
}

#[async_trait]
impl MemoService for InMemoryMemos {
    async fn get_memo(&self, memo_id: Uuid) -> anyhow::Result<Memo> {
        self.memos
            .lock()
            .get(&memo_id)
            .cloned()
            .with_context(|| format!("memo {memo_id} not found"))
    }

    async fn update_memo_status(&self, memo_id: Uuid, status: MemoStatus) -> anyhow::Result<()> {
        let mut memos = self.memos.lock();
        let memo = memos
            .get_mut(&memo_id)
            .with_context(|| format!("memo {memo_id} not found"))?;
        memo.status = status;
        memo.updated_at = chrono::Utc::now();
        Ok(())
    }
}

/// Turns each `term: definition` line into a card.
struct DefinitionGenerator;

#[async_trait]
impl CardGenerator for DefinitionGenerator {
    async fn generate_cards(&self, memo_text: &str, user_id: Uuid) -> anyhow::Result<Vec<Card>> {
        Ok(memo_text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(front, back)| {
                Card::new(
                    user_id,
                    Uuid::nil(),
                    json!({"front": front.trim(), "back": back.trim()}),
                )
            })
            .collect())
    }
}

#[derive(Default)]
struct InMemoryCards {
    cards: Mutex<Vec<Card>>,
}

#[async_trait]
impl CardRepository for InMemoryCards {
    async fn create_cards(&self, cards: &[Card]) -> anyhow::Result<()> {
        self.cards.lock().extend_from_slice(cards);
        Ok(())
    }
}

const MEMOS: &[&str] = &[
    "mitochondria: powerhouse of the cell\nribosome: protein factory",
    "photosynthesis: light to chemical energy",
    "just some notes without definitions",
];

/// Poll until `expected` tasks have reached a terminal status.
async fn wait_for_tasks(store: &SqliteTaskStore, expected: usize) -> anyhow::Result<()> {
    loop {
        let done = store.find_by_status(TaskStatus::Completed, None).await?.len()
            + store.find_by_status(TaskStatus::Failed, None).await?.len();
        if done >= expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn run() -> anyhow::Result<()> {
    let config = TaskRunnerConfig::from_env().context("failed to load runner configuration")?;

    let url = std::env::var("SCRY_DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".into());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .with_context(|| format!("failed to open task database {url}"))?;
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await?;

    let memos = Arc::new(InMemoryMemos::default());
    let cards = Arc::new(InMemoryCards::default());
    let factory = Arc::new(MemoGenerationTaskFactory::new(
        memos.clone(),
        Arc::new(DefinitionGenerator),
        cards.clone(),
    ));

    let runner = TaskRunner::builder(store.clone())
        .config(config)
        .factory(factory.clone())
        .build();
    runner.start()?;

    let emitter = EventEmitter::new();
    emitter.register_handler(Arc::new(TaskFactoryEventHandler::new(
        factory,
        runner.clone(),
    )));

    let user_id = Uuid::new_v4();
    let cancel = CancellationToken::new();
    for text in MEMOS {
        let memo_id = memos.add(user_id, text);
        let event = TaskRequestEvent::new(MEMO_GENERATION, &MemoGenerationRequest { memo_id })?;
        emitter.emit(&event, &cancel).await?;
    }

    let finished = tokio::time::timeout(
        Duration::from_secs(10),
        wait_for_tasks(&store, MEMOS.len()),
    )
    .await;

    if !runner.shutdown(Duration::from_secs(5)).await {
        info!("some tasks were cancelled during shutdown");
    }
    finished.context("timed out waiting for memo generation")??;

    info!(
        cards = cards.cards.lock().len(),
        memos = MEMOS.len(),
        "memo generation finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = telemetry::init("info", LogFormat::Pretty) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "memo generation demo failed");
            ExitCode::FAILURE
        }
    }
}
