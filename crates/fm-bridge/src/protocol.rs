use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fm_core::types::{ApprovalDecision, TaskType};

/// Events published on the in-process bus.
///
/// Consumers that only care about one request filter on the ids inside the
/// payloads; every decision additionally fans out as a generic
/// [`CoreEvent::Event`] for audit-style subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum CoreEvent {
    ApprovalRequested(ApprovalRequestedPayload),
    ApprovalDecided(ApprovalDecidedPayload),
    TaskEnqueued {
        task_id: Uuid,
        agent_id: Uuid,
        task_type: TaskType,
    },
    TaskCompleted {
        task_id: Uuid,
        agent_id: Uuid,
    },
    TaskFailed {
        task_id: Uuid,
        agent_id: Uuid,
        error: String,
    },
    RunStarted {
        agent_id: Uuid,
        conversation_id: String,
        trace_id: String,
    },
    RunFinished {
        agent_id: Uuid,
        conversation_id: String,
        success: bool,
        iterations: u32,
    },
    Event(EventPayload),
}

/// Everything a human-interface adapter needs to render an actionable
/// approval prompt: who wants to do what, why, and until when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestedPayload {
    pub request_id: Uuid,
    pub agent_id: Uuid,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub reason: String,
    pub context_summary: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecidedPayload {
    pub request_id: Uuid,
    pub agent_id: Uuid,
    pub decision: ApprovalDecision,
    pub decided_by: Option<String>,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Free-form event for audit and fan-out subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    pub agent_id: Option<Uuid>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload {
    pub fn new(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            agent_id: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}
