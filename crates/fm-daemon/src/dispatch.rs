use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use fm_core::types::{Task, TaskEnvelope, TaskType};

use crate::handlers::{HandlerError, HandlerRegistry, TaskOutcome};

// ---------------------------------------------------------------------------
// Dispatcher strategy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher transport error: {0}")]
    Transport(String),
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Strategy seam for handing task envelopes to an external durable-workflow
/// engine.
///
/// `Ok(Some(run_id))` means the external engine owns the work and no local
/// queue row should exist for it. `Ok(None)` and `Err(_)` both mean "use the
/// local queue"; external dispatch is an alternative backend, never a hard
/// dependency.
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<Option<String>, DispatchError>;
}

/// The no-op strategy: everything stays on the local queue.
pub struct NullDispatcher;

#[async_trait::async_trait]
impl Dispatcher for NullDispatcher {
    fn name(&self) -> &str {
        "null"
    }

    async fn dispatch(&self, _envelope: &TaskEnvelope) -> Result<Option<String>, DispatchError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// HttpWorkflowDispatcher
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DispatchResponse {
    run_id: String,
}

/// Hands envelopes to an external workflow engine over HTTP.
pub struct HttpWorkflowDispatcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkflowDispatcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Dispatcher for HttpWorkflowDispatcher {
    fn name(&self) -> &str {
        "http-workflow"
    }

    async fn dispatch(&self, envelope: &TaskEnvelope) -> Result<Option<String>, DispatchError> {
        let url = format!("{}/workflows", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DispatchError::Rejected(format!(
                "http {}",
                response.status()
            )));
        }

        let body: DispatchResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Rejected(format!("invalid dispatch response: {e}")))?;

        debug!(run_id = %body.run_id, "envelope dispatched to external engine");
        Ok(Some(body.run_id))
    }
}

// ---------------------------------------------------------------------------
// ActivityWorker
// ---------------------------------------------------------------------------

/// Worker-side mirror for the external engine: exposes the same task-type
/// handlers as callable activities, so behavior is identical whether a task
/// ran through the local queue or the external engine.
pub struct ActivityWorker {
    handlers: Arc<HandlerRegistry>,
}

impl ActivityWorker {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    /// Execute one activity invocation. The external engine owns retries and
    /// persistence; this builds a transient task row and runs the matching
    /// handler.
    pub async fn execute_activity(
        &self,
        task_type: &str,
        agent_id: Uuid,
        payload: Value,
    ) -> Result<TaskOutcome, HandlerError> {
        let handler = self
            .handlers
            .get(task_type)
            .ok_or_else(|| HandlerError::UnknownTaskType(task_type.to_string()))?;

        let task = Task::new(agent_id, TaskType::parse(task_type), payload);
        handler.handle(&task).await
    }
}
