use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::CoreEvent;
use fm_core::config::QueueConfig;
use fm_core::store::CoreDb;
use fm_core::types::{Task, TaskEnvelope, TaskType};

use crate::dispatch::Dispatcher;
use crate::handlers::{HandlerError, HandlerRegistry, TaskOutcome};
use crate::shutdown::ShutdownSignal;

// ---------------------------------------------------------------------------
// Enqueue types
// ---------------------------------------------------------------------------

/// Where an enqueued task ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueReceipt {
    /// A row in the local queue.
    Local(Uuid),
    /// The external workflow engine's run identifier; no local row exists.
    External(String),
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i64,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
}

/// Counters from one poll pass, for logging and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollStats {
    pub recovered: usize,
    pub force_failed: usize,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

enum Processed {
    Completed,
    Retried,
    Failed,
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// The task distribution layer: a claim-based durable queue over the store.
///
/// Producers call [`enqueue`](TaskQueue::enqueue); the background loop
/// recovers stale work, claims due tasks in priority order, and dispatches
/// them concurrently to the handler registered for each task type. Failed
/// handlers drive retry-with-backoff until the attempt cap, then permanent
/// failure.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<CoreDb>,
    bus: EventBus,
    handlers: Arc<HandlerRegistry>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(
        store: Arc<CoreDb>,
        bus: EventBus,
        handlers: Arc<HandlerRegistry>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            bus,
            handlers,
            dispatcher: None,
            config,
        }
    }

    /// Route enqueues through an external workflow dispatcher, with the
    /// local queue as fallback.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Durably enqueue work for an agent.
    ///
    /// When a dispatcher is configured and accepts the envelope, the
    /// external engine's run id is returned and no local row is written.
    /// Any dispatcher failure falls back to the local queue.
    pub async fn enqueue(
        &self,
        agent_id: Uuid,
        task_type: TaskType,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<EnqueueReceipt, tokio_rusqlite::Error> {
        let scheduled_for = opts.scheduled_for.unwrap_or_else(Utc::now);

        if let Some(dispatcher) = &self.dispatcher {
            let envelope = TaskEnvelope {
                agent_id,
                task_type: task_type.clone(),
                payload: payload.clone(),
                priority: opts.priority,
                scheduled_for,
            };
            match dispatcher.dispatch(&envelope).await {
                Ok(Some(run_id)) => {
                    info!(
                        dispatcher = dispatcher.name(),
                        run_id = %run_id,
                        task_type = %task_type,
                        "task dispatched to external engine"
                    );
                    return Ok(EnqueueReceipt::External(run_id));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        dispatcher = dispatcher.name(),
                        error = %e,
                        "external dispatch failed; falling back to local queue"
                    );
                }
            }
        }

        let task = Task::new(agent_id, task_type.clone(), payload)
            .with_priority(opts.priority)
            .with_scheduled_for(scheduled_for)
            .with_max_attempts(
                opts.max_attempts
                    .unwrap_or(self.config.default_max_attempts),
            );
        self.store.insert_task(&task).await?;

        self.bus.publish(CoreEvent::TaskEnqueued {
            task_id: task.id,
            agent_id,
            task_type,
        });

        Ok(EnqueueReceipt::Local(task.id))
    }

    /// Run the poll loop until shutdown.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        // Consume the immediate first tick so the loop starts on schedule.
        tick.tick().await;
        let mut shutdown_rx = shutdown.subscribe();

        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            concurrency = self.config.concurrency,
            "task queue loop started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let stats = self.poll_once().await;
                    if stats.claimed > 0 || stats.recovered > 0 || stats.force_failed > 0 {
                        info!(
                            recovered = stats.recovered,
                            force_failed = stats.force_failed,
                            claimed = stats.claimed,
                            completed = stats.completed,
                            retried = stats.retried,
                            failed = stats.failed,
                            "poll pass finished"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("task queue loop stopping");
                    break;
                }
            }
        }
    }

    /// One full pass: stale recovery first, then claim, then concurrent
    /// dispatch. Recovery runs before the claim so retried work competes
    /// with fresh inserts in the same pass instead of starving behind them.
    pub async fn poll_once(&self) -> PollStats {
        let mut stats = PollStats::default();
        let now = Utc::now();

        let cutoff = now - chrono::Duration::seconds(self.config.stale_timeout_secs as i64);
        match self.store.recover_stale(cutoff, now).await {
            Ok((retried, force_failed)) => {
                stats.recovered = retried.len();
                stats.force_failed = force_failed.len();
                for task_id in &force_failed {
                    warn!(task_id = %task_id, "stale task force-failed");
                }
            }
            Err(e) => {
                error!(error = %e, "stale recovery failed");
                return stats;
            }
        }

        let claimed = match self.store.claim_due(self.config.concurrency, now).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "claim pass failed");
                return stats;
            }
        };
        stats.claimed = claimed.len();

        let mut workers = JoinSet::new();
        for task in claimed {
            let queue = self.clone();
            workers.spawn(async move { queue.process_task(task).await });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Processed::Completed) => stats.completed += 1,
                Ok(Processed::Retried) => stats.retried += 1,
                Ok(Processed::Failed) => stats.failed += 1,
                Err(e) => {
                    // A panicking handler is a bug; the task stays
                    // `processing` until stale recovery picks it up.
                    error!(error = %e, "task worker panicked");
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    async fn process_task(&self, task: Task) -> Processed {
        let outcome = match self.handlers.get(task.task_type.as_str()) {
            Some(handler) => handler.handle(&task).await,
            None => Err(HandlerError::UnknownTaskType(
                task.task_type.as_str().to_string(),
            )),
        };
        let now = Utc::now();

        match outcome {
            Ok(outcome) => {
                if let TaskOutcome::Skipped { reason } = &outcome {
                    info!(task_id = %task.id, reason = %reason, "task skipped");
                }
                match self.store.complete_task(task.id, now).await {
                    Ok(true) => {
                        self.bus.publish(CoreEvent::TaskCompleted {
                            task_id: task.id,
                            agent_id: task.agent_id,
                        });
                        Processed::Completed
                    }
                    Ok(false) => {
                        // The row left `processing` under us: a stale
                        // recovery already re-queued or failed it. Tolerated.
                        warn!(task_id = %task.id, "completion raced a recovery; result dropped");
                        Processed::Completed
                    }
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "failed to persist completion");
                        Processed::Failed
                    }
                }
            }
            Err(handler_err) => self.handle_failure(&task, handler_err, now).await,
        }
    }

    async fn handle_failure(
        &self,
        task: &Task,
        handler_err: HandlerError,
        now: DateTime<Utc>,
    ) -> Processed {
        let message = handler_err.to_string();

        if task.attempts_remaining() {
            let delay = backoff_delay(
                task.attempts,
                self.config.retry_base_delay_secs,
                self.config.retry_max_delay_secs,
            );
            let next_attempt_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            match self
                .store
                .retry_task(task.id, next_attempt_at, message.as_str())
                .await
            {
                Ok(true) => {
                    warn!(
                        task_id = %task.id,
                        attempts = task.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %message,
                        "task failed; scheduled for retry"
                    );
                    return Processed::Retried;
                }
                Ok(false) => {
                    warn!(task_id = %task.id, "retry refused; marking failed");
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "failed to schedule retry");
                    return Processed::Failed;
                }
            }
        }

        match self.store.fail_task(task.id, message.as_str(), now).await {
            Ok(_) => {
                error!(
                    task_id = %task.id,
                    attempts = task.attempts,
                    error = %message,
                    "task failed permanently"
                );
                self.bus.publish(CoreEvent::TaskFailed {
                    task_id: task.id,
                    agent_id: task.agent_id,
                    error: message,
                });
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to persist task failure");
            }
        }
        Processed::Failed
    }
}

/// Exponential backoff: base doubling per attempt, capped.
pub fn backoff_delay(attempts: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << exponent).min(cap_secs);
    Duration::from_secs(secs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1, 10, 600), Duration::from_secs(10));
        assert_eq!(backoff_delay(2, 10, 600), Duration::from_secs(20));
        assert_eq!(backoff_delay(3, 10, 600), Duration::from_secs(40));
        assert_eq!(backoff_delay(7, 10, 600), Duration::from_secs(600));
        // Huge attempt counts do not overflow.
        assert_eq!(backoff_delay(64, 10, 600), Duration::from_secs(600));
    }
}
