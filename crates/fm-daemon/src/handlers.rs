use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;
use uuid::Uuid;

use fm_agents::context::{PreApprovedAction, RunContext};
use fm_agents::directory::AgentDirectory;
use fm_agents::runner::AgentRunner;
use fm_agents::serializer::RunSerializer;
use fm_core::store::CoreDb;
use fm_core::types::{ApprovalStatus, RunTrigger, Task, TaskType};

// ---------------------------------------------------------------------------
// Errors / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(Uuid),
    #[error("run failed: {0}")]
    RunFailed(String),
    #[error("store error: {0}")]
    Store(#[from] tokio_rusqlite::Error),
}

/// A handler's non-error result. `Skipped` completes the task without doing
/// the work, used when the task's precondition no longer holds (e.g. an
/// `approval_resume` whose request was denied) and a retry would be
/// pointless.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(serde_json::Value),
    Skipped { reason: String },
}

// ---------------------------------------------------------------------------
// TaskHandler trait + registry
// ---------------------------------------------------------------------------

/// One handler per task type. Handlers are stateless from the queue's point
/// of view: everything they need arrives in the task row.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, task: &Task) -> Result<TaskOutcome, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .insert(handler.task_type().as_str().to_string(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }
}

// ---------------------------------------------------------------------------
// AgentRunHandler
// ---------------------------------------------------------------------------

/// Handles `agent_run` tasks: resolve the agent, pick the conversation,
/// gate on the run serializer, and invoke the run loop.
pub struct AgentRunHandler {
    runner: Arc<AgentRunner>,
    directory: Arc<dyn AgentDirectory>,
    serializer: RunSerializer,
}

impl AgentRunHandler {
    pub fn new(
        runner: Arc<AgentRunner>,
        directory: Arc<dyn AgentDirectory>,
        serializer: RunSerializer,
    ) -> Self {
        Self {
            runner,
            directory,
            serializer,
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for AgentRunHandler {
    fn task_type(&self) -> TaskType {
        TaskType::AgentRun
    }

    async fn handle(&self, task: &Task) -> Result<TaskOutcome, HandlerError> {
        let input = task
            .payload
            .get("input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerError::InvalidPayload("missing `input` field".into()))?;

        let profile = self
            .directory
            .get(task.agent_id)
            .await
            .ok_or(HandlerError::UnknownAgent(task.agent_id))?;

        // Reuse the conversation named in the payload, or fall back to the
        // agent's standing event conversation.
        let conversation_id = task
            .payload
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("agent-{}", task.agent_id));

        let mut ctx = RunContext::new(
            task.agent_id,
            conversation_id.clone(),
            RunTrigger::Event,
            profile.capabilities.clone(),
        );

        let _permit = self.serializer.acquire(task.agent_id, &conversation_id).await;
        let result = self.runner.run(input, &mut ctx).await;

        if !result.success {
            return Err(HandlerError::RunFailed(
                result.response.unwrap_or_else(|| "no details".into()),
            ));
        }

        Ok(TaskOutcome::Completed(json!({
            "response": result.response,
            "iterations": result.iterations,
            "tools_used": result.tools_used,
            "approvals_pending": result.approvals_pending,
        })))
    }
}

// ---------------------------------------------------------------------------
// ApprovalResumeHandler
// ---------------------------------------------------------------------------

/// Handles `approval_resume` tasks: re-enter the run loop for a decided
/// approval request, carrying the one-shot pre-approved token.
///
/// A request that is anything other than `approved` resolves to a
/// [`TaskOutcome::Skipped`], not an error, so the queue will not retry what
/// a human already refused.
pub struct ApprovalResumeHandler {
    store: Arc<CoreDb>,
    runner: Arc<AgentRunner>,
    directory: Arc<dyn AgentDirectory>,
    serializer: RunSerializer,
}

impl ApprovalResumeHandler {
    pub fn new(
        store: Arc<CoreDb>,
        runner: Arc<AgentRunner>,
        directory: Arc<dyn AgentDirectory>,
        serializer: RunSerializer,
    ) -> Self {
        Self {
            store,
            runner,
            directory,
            serializer,
        }
    }
}

#[async_trait::async_trait]
impl TaskHandler for ApprovalResumeHandler {
    fn task_type(&self) -> TaskType {
        TaskType::ApprovalResume
    }

    async fn handle(&self, task: &Task) -> Result<TaskOutcome, HandlerError> {
        let request_id = task
            .payload
            .get("request_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| HandlerError::InvalidPayload("missing `request_id` field".into()))?;

        let request = self
            .store
            .get_approval(request_id)
            .await?
            .ok_or_else(|| {
                HandlerError::InvalidPayload(format!("approval request {request_id} not found"))
            })?;

        if request.status != ApprovalStatus::Approved {
            return Ok(TaskOutcome::Skipped {
                reason: format!(
                    "approval request {} is {}, not approved",
                    request_id, request.status
                ),
            });
        }

        // The stored action payload carries the resume context.
        let tool_name = request
            .action_payload
            .get("tool")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerError::InvalidPayload("approval payload missing `tool`".into())
            })?
            .to_string();
        let arguments = request
            .action_payload
            .get("arguments")
            .cloned()
            .ok_or_else(|| {
                HandlerError::InvalidPayload("approval payload missing `arguments`".into())
            })?;
        let conversation_id = request
            .action_payload
            .get("conversation_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HandlerError::InvalidPayload("approval payload missing `conversation_id`".into())
            })?
            .to_string();
        let trace_id = request
            .action_payload
            .get("trace_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let profile = self
            .directory
            .get(request.agent_id)
            .await
            .ok_or(HandlerError::UnknownAgent(request.agent_id))?;

        let mut ctx = RunContext::new(
            request.agent_id,
            conversation_id.clone(),
            RunTrigger::Event,
            profile.capabilities.clone(),
        )
        .with_pre_approved(PreApprovedAction {
            request_id,
            tool_name: tool_name.clone(),
            arguments,
        });
        if !trace_id.is_empty() {
            ctx = ctx.with_trace_id(trace_id);
        }

        let prompt = format!(
            "Approval request {} for the `{}` tool call was approved by {}. \
             Re-issue that tool call with the same arguments and continue the task.",
            request_id,
            tool_name,
            request.decided_by.as_deref().unwrap_or("a human reviewer"),
        );

        info!(
            request_id = %request_id,
            agent_id = %request.agent_id,
            tool = %tool_name,
            "resuming run after approval"
        );

        let _permit = self
            .serializer
            .acquire(request.agent_id, &conversation_id)
            .await;
        let result = self.runner.run(&prompt, &mut ctx).await;

        if !result.success {
            return Err(HandlerError::RunFailed(
                result.response.unwrap_or_else(|| "no details".into()),
            ));
        }

        Ok(TaskOutcome::Completed(json!({
            "resumed": true,
            "request_id": request_id,
            "response": result.response,
            "approvals_pending": result.approvals_pending,
        })))
    }
}
