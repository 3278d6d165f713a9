//! Queue lifecycle tests: enqueue/claim/complete round trips, retry with
//! backoff, permanent failure, unknown task types, and external-dispatcher
//! fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use fm_bridge::event_bus::EventBus;
use fm_core::config::QueueConfig;
use fm_core::store::CoreDb;
use fm_core::types::{Task, TaskEnvelope, TaskStatus, TaskType};
use fm_daemon::dispatch::{DispatchError, Dispatcher};
use fm_daemon::handlers::{HandlerError, HandlerRegistry, TaskHandler, TaskOutcome};
use fm_daemon::queue::{EnqueueOptions, EnqueueReceipt, TaskQueue};

// ---------------------------------------------------------------------------
// Stub handlers / dispatchers
// ---------------------------------------------------------------------------

struct StubHandler {
    task_type: TaskType,
    succeed: bool,
    skip: bool,
    invocations: Arc<AtomicUsize>,
}

impl StubHandler {
    fn ok(task_type: TaskType) -> (Arc<Self>, Arc<AtomicUsize>) {
        Self::build(task_type, true, false)
    }

    fn failing(task_type: TaskType) -> (Arc<Self>, Arc<AtomicUsize>) {
        Self::build(task_type, false, false)
    }

    fn skipping(task_type: TaskType) -> (Arc<Self>, Arc<AtomicUsize>) {
        Self::build(task_type, true, true)
    }

    fn build(task_type: TaskType, succeed: bool, skip: bool) -> (Arc<Self>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                task_type,
                succeed,
                skip,
                invocations: invocations.clone(),
            }),
            invocations,
        )
    }
}

#[async_trait::async_trait]
impl TaskHandler for StubHandler {
    fn task_type(&self) -> TaskType {
        self.task_type.clone()
    }

    async fn handle(&self, _task: &Task) -> Result<TaskOutcome, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.skip {
            return Ok(TaskOutcome::Skipped {
                reason: "precondition no longer holds".into(),
            });
        }
        if self.succeed {
            Ok(TaskOutcome::Completed(json!({"ok": true})))
        } else {
            Err(HandlerError::RunFailed("handler exploded".into()))
        }
    }
}

struct StaticDispatcher {
    accept: bool,
}

#[async_trait::async_trait]
impl Dispatcher for StaticDispatcher {
    fn name(&self) -> &str {
        "static"
    }

    async fn dispatch(&self, _envelope: &TaskEnvelope) -> Result<Option<String>, DispatchError> {
        if self.accept {
            Ok(Some("external-run-42".into()))
        } else {
            Err(DispatchError::Transport("connection refused".into()))
        }
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        poll_interval_secs: 1,
        concurrency: 4,
        stale_timeout_secs: 600,
        retry_base_delay_secs: 1,
        retry_max_delay_secs: 1,
        default_max_attempts: 3,
    }
}

async fn queue_with(
    handlers: HandlerRegistry,
    config: QueueConfig,
) -> (TaskQueue, Arc<CoreDb>) {
    let store = Arc::new(CoreDb::new_in_memory().await.unwrap());
    let queue = TaskQueue::new(store.clone(), EventBus::new(), Arc::new(handlers), config);
    (queue, store)
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_claim_complete_round_trip() {
    let (handler, count) = StubHandler::ok(TaskType::AgentRun);
    let mut handlers = HandlerRegistry::new();
    handlers.register(handler);
    let (queue, store) = queue_with(handlers, fast_config()).await;

    let receipt = queue
        .enqueue(
            Uuid::new_v4(),
            TaskType::AgentRun,
            json!({"input": "go"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    let EnqueueReceipt::Local(task_id) = receipt else {
        panic!("expected a local receipt");
    };

    let stats = queue.poll_once().await;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let row = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert!(row.completed_at.is_some());

    // No further claims are possible.
    let stats = queue.poll_once().await;
    assert_eq!(stats.claimed, 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn skipped_outcome_completes_the_task() {
    let (handler, _count) = StubHandler::skipping(TaskType::ApprovalResume);
    let mut handlers = HandlerRegistry::new();
    handlers.register(handler);
    let (queue, store) = queue_with(handlers, fast_config()).await;

    let EnqueueReceipt::Local(task_id) = queue
        .enqueue(
            Uuid::new_v4(),
            TaskType::ApprovalResume,
            json!({"request_id": Uuid::new_v4().to_string()}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
    else {
        panic!("expected local receipt");
    };

    let stats = queue.poll_once().await;
    assert_eq!(stats.completed, 1);
    let row = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// Retry and permanent failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_handler_retries_with_backoff_then_fails_permanently() {
    let (handler, count) = StubHandler::failing(TaskType::AgentRun);
    let mut handlers = HandlerRegistry::new();
    handlers.register(handler);
    let (queue, store) = queue_with(handlers, fast_config()).await;

    let EnqueueReceipt::Local(task_id) = queue
        .enqueue(
            Uuid::new_v4(),
            TaskType::AgentRun,
            json!({"input": "boom"}),
            EnqueueOptions {
                max_attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    else {
        panic!("expected local receipt");
    };

    // First attempt fails and reschedules.
    let stats = queue.poll_once().await;
    assert_eq!(stats.retried, 1);
    let row = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert!(row.scheduled_for > row.created_at, "backoff pushed the schedule out");

    // Not yet due: nothing claimed.
    let stats = queue.poll_once().await;
    assert_eq!(stats.claimed, 0);

    // After the backoff the second (and final) attempt fails permanently.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let stats = queue.poll_once().await;
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    let row = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.attempts, 2);
    assert!(row.error.as_deref().unwrap().contains("handler exploded"));

    // A permanently failed task never comes back.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let stats = queue.poll_once().await;
    assert_eq!(stats.claimed, 0);
}

#[tokio::test]
async fn unknown_task_type_fails_without_a_handler() {
    let (queue, store) = queue_with(HandlerRegistry::new(), fast_config()).await;

    let EnqueueReceipt::Local(task_id) = queue
        .enqueue(
            Uuid::new_v4(),
            TaskType::Custom("webhook_replay".into()),
            json!({}),
            EnqueueOptions {
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    else {
        panic!("expected local receipt");
    };

    let stats = queue.poll_once().await;
    assert_eq!(stats.failed, 1);
    let row = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert!(row.error.as_deref().unwrap().contains("unknown task type"));
}

// ---------------------------------------------------------------------------
// Stale recovery ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_tasks_are_recovered_before_the_claim_pass() {
    let (handler, count) = StubHandler::ok(TaskType::AgentRun);
    let mut handlers = HandlerRegistry::new();
    handlers.register(handler);
    let mut config = fast_config();
    config.stale_timeout_secs = 0; // anything processing is instantly stale
    let (queue, store) = queue_with(handlers, config).await;

    // Simulate a dead worker: claim directly, then never complete.
    let task = Task::new(Uuid::new_v4(), TaskType::AgentRun, json!({"input": "x"}));
    store.insert_task(&task).await.unwrap();
    let claimed = store.claim_due(1, chrono::Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;

    // The same pass recovers the stale row and re-claims it.
    let stats = queue.poll_once().await;
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let row = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert_eq!(row.attempts, 2, "recovery claim counts as a fresh attempt");
}

// ---------------------------------------------------------------------------
// External dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_dispatch_skips_the_local_queue() {
    let (queue, store) = queue_with(HandlerRegistry::new(), fast_config()).await;
    let queue = queue.with_dispatcher(Arc::new(StaticDispatcher { accept: true }));

    let receipt = queue
        .enqueue(
            Uuid::new_v4(),
            TaskType::AgentRun,
            json!({"input": "remote"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(receipt, EnqueueReceipt::External("external-run-42".into()));
    assert_eq!(
        store.count_tasks_by_status(TaskStatus::Pending).await.unwrap(),
        0,
        "no local row is written for externally dispatched work"
    );
}

#[tokio::test]
async fn failed_dispatch_falls_back_to_the_local_queue() {
    let (queue, store) = queue_with(HandlerRegistry::new(), fast_config()).await;
    let queue = queue.with_dispatcher(Arc::new(StaticDispatcher { accept: false }));

    let receipt = queue
        .enqueue(
            Uuid::new_v4(),
            TaskType::AgentRun,
            json!({"input": "local after all"}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    assert!(matches!(receipt, EnqueueReceipt::Local(_)));
    assert_eq!(
        store.count_tasks_by_status(TaskStatus::Pending).await.unwrap(),
        1
    );
}
