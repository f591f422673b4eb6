//! Memo generation task against in-memory collaborators.

mod common;

use async_trait::async_trait;
use common::{test_config, wait_for_status};
use scry_tasks::{
    Card, CardGenerator, CardRepository, EventEmitter, Memo, MemoGenerationRequest,
    MemoGenerationTaskFactory, MemoService, MemoStatus, MemoryTaskStore, Task, TaskContext,
    TaskFactory, TaskFactoryEventHandler, TaskRequestEvent, TaskRunner, TaskStatus,
    MEMO_GENERATION,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct FakeMemos {
    memos: Mutex<HashMap<Uuid, Memo>>,
    history: Mutex<Vec<MemoStatus>>,
    fail_completed_write: AtomicBool,
}

impl FakeMemos {
    fn with_memo(text: &str) -> (Arc<Self>, Uuid) {
        let memo = Memo::new(Uuid::new_v4(), text);
        let id = memo.id;
        let memos = Self::default();
        memos.memos.lock().unwrap().insert(id, memo);
        (Arc::new(memos), id)
    }

    fn history(&self) -> Vec<MemoStatus> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoService for FakeMemos {
    async fn get_memo(&self, memo_id: Uuid) -> anyhow::Result<Memo> {
        self.memos
            .lock()
            .unwrap()
            .get(&memo_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("memo {memo_id} not found"))
    }

    async fn update_memo_status(&self, memo_id: Uuid, status: MemoStatus) -> anyhow::Result<()> {
        if status == MemoStatus::Completed && self.fail_completed_write.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset");
        }
        self.history.lock().unwrap().push(status);
        if let Some(memo) = self.memos.lock().unwrap().get_mut(&memo_id) {
            memo.status = status;
        }
        Ok(())
    }
}

/// Generates one card per line of memo text.
struct LineGenerator {
    fail: bool,
}

#[async_trait]
impl CardGenerator for LineGenerator {
    async fn generate_cards(&self, memo_text: &str, user_id: Uuid) -> anyhow::Result<Vec<Card>> {
        if self.fail {
            anyhow::bail!("model quota exceeded");
        }
        Ok(memo_text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Card::new(user_id, Uuid::nil(), json!({"front": line, "back": "?"})))
            .collect())
    }
}

#[derive(Default)]
struct FakeCards {
    saved: Mutex<Vec<Card>>,
    fail: bool,
    calls: Mutex<usize>,
}

impl FakeCards {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl CardRepository for FakeCards {
    async fn create_cards(&self, cards: &[Card]) -> anyhow::Result<()> {
        *self.calls.lock().unwrap() += 1;
        if self.fail {
            anyhow::bail!("unique constraint violated");
        }
        self.saved.lock().unwrap().extend_from_slice(cards);
        Ok(())
    }
}

fn ctx() -> TaskContext {
    TaskContext::new(0, CancellationToken::new())
}

fn factory(
    memos: &Arc<FakeMemos>,
    generator: LineGenerator,
    cards: &Arc<FakeCards>,
) -> MemoGenerationTaskFactory {
    MemoGenerationTaskFactory::new(memos.clone(), Arc::new(generator), cards.clone())
}

#[tokio::test]
async fn test_cards_are_generated_and_saved() {
    let (memos, memo_id) = FakeMemos::with_memo("mitochondria\nribosome\n");
    let cards = Arc::new(FakeCards::default());
    let task = factory(&memos, LineGenerator { fail: false }, &cards)
        .create(MemoGenerationRequest { memo_id })
        .unwrap();

    task.execute(&ctx()).await.unwrap();

    assert_eq!(cards.saved.lock().unwrap().len(), 2);
    assert_eq!(
        memos.history(),
        vec![MemoStatus::Processing, MemoStatus::Completed]
    );
}

#[tokio::test]
async fn test_generation_failure_marks_memo_failed() {
    let (memos, memo_id) = FakeMemos::with_memo("photosynthesis");
    let cards = Arc::new(FakeCards::default());
    let task = factory(&memos, LineGenerator { fail: true }, &cards)
        .create(MemoGenerationRequest { memo_id })
        .unwrap();

    let err = task.execute(&ctx()).await.unwrap_err();

    assert!(format!("{err:#}").contains("model quota exceeded"));
    assert_eq!(memos.history(), vec![MemoStatus::Processing, MemoStatus::Failed]);
    assert_eq!(*cards.calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_save_failure_marks_memo_failed() {
    let (memos, memo_id) = FakeMemos::with_memo("osmosis");
    let cards = Arc::new(FakeCards::failing());
    let task = factory(&memos, LineGenerator { fail: false }, &cards)
        .create(MemoGenerationRequest { memo_id })
        .unwrap();

    let err = task.execute(&ctx()).await.unwrap_err();

    assert!(err.to_string().contains("failed to save generated cards"));
    assert_eq!(memos.history(), vec![MemoStatus::Processing, MemoStatus::Failed]);
    assert!(cards.saved.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_no_cards_still_completes_without_saving() {
    let (memos, memo_id) = FakeMemos::with_memo("   ");
    let cards = Arc::new(FakeCards::default());
    let task = factory(&memos, LineGenerator { fail: false }, &cards)
        .create(MemoGenerationRequest { memo_id })
        .unwrap();

    task.execute(&ctx()).await.unwrap();

    assert_eq!(*cards.calls.lock().unwrap(), 0);
    assert_eq!(
        memos.history(),
        vec![MemoStatus::Processing, MemoStatus::Completed]
    );
}

#[tokio::test]
async fn test_final_status_write_failure_is_not_fatal() {
    let (memos, memo_id) = FakeMemos::with_memo("krebs cycle");
    memos.fail_completed_write.store(true, Ordering::SeqCst);
    let cards = Arc::new(FakeCards::default());
    let task = factory(&memos, LineGenerator { fail: false }, &cards)
        .create(MemoGenerationRequest { memo_id })
        .unwrap();

    task.execute(&ctx()).await.unwrap();
    assert_eq!(cards.saved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_memo_fails_without_status_updates() {
    let (memos, _) = FakeMemos::with_memo("unused");
    let cards = Arc::new(FakeCards::default());
    let task = factory(&memos, LineGenerator { fail: false }, &cards)
        .create(MemoGenerationRequest {
            memo_id: Uuid::new_v4(),
        })
        .unwrap();

    let err = task.execute(&ctx()).await.unwrap_err();
    assert!(err.to_string().contains("failed to retrieve memo"));
    assert!(memos.history().is_empty());
}

#[tokio::test]
async fn test_cancelled_context_stops_before_work() {
    let (memos, memo_id) = FakeMemos::with_memo("glycolysis");
    let cards = Arc::new(FakeCards::default());
    let task = factory(&memos, LineGenerator { fail: false }, &cards)
        .create(MemoGenerationRequest { memo_id })
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(task.execute(&TaskContext::new(0, cancel)).await.is_err());
    assert!(memos.history().is_empty());
}

#[tokio::test]
async fn test_memo_event_flows_through_runner() {
    let (memos, memo_id) = FakeMemos::with_memo("alpha\nbeta\ngamma");
    let cards = Arc::new(FakeCards::default());
    let factory = Arc::new(factory(&memos, LineGenerator { fail: false }, &cards));

    let store = MemoryTaskStore::new();
    let runner = TaskRunner::builder(store.clone())
        .config(test_config())
        .factory(factory.clone())
        .build();
    runner.start().unwrap();

    let emitter = EventEmitter::new();
    emitter.register_handler(Arc::new(TaskFactoryEventHandler::new(
        factory,
        runner.clone(),
    )));

    let event = TaskRequestEvent::new(MEMO_GENERATION, &MemoGenerationRequest { memo_id }).unwrap();
    emitter.emit(&event, &CancellationToken::new()).await.unwrap();

    let record = store.records().await.pop().unwrap();
    assert_eq!(record.task_type, MEMO_GENERATION);
    wait_for_status(&runner, record.id, TaskStatus::Completed).await;
    runner.stop().await;

    assert_eq!(cards.saved.lock().unwrap().len(), 3);
    assert_eq!(
        memos.memos.lock().unwrap()[&memo_id].status,
        MemoStatus::Completed
    );
}
