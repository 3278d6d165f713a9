use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Processing -> Pending` is the retry path; `Completed` and `Failed`
    /// are terminal.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Pending)
        )
    }
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// Kind of work a queued task represents. Handlers are registered per type;
/// `Custom` keeps the set open for integrations without schema changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskType {
    AgentRun,
    ApprovalResume,
    Custom(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::AgentRun => "agent_run",
            TaskType::ApprovalResume => "approval_resume",
            TaskType::Custom(s) => s.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "agent_run" => TaskType::AgentRun,
            "approval_resume" => TaskType::ApprovalResume,
            other => TaskType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for TaskType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(TaskType::parse(&raw))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A durable unit of work pulled from the queue by exactly one worker at a
/// time. The `payload` is an opaque JSON object interpreted by the handler
/// registered for `task_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(agent_id: Uuid, task_type: TaskType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_type,
            payload,
            priority: 0,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            scheduled_for: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_scheduled_for(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_for = when;
        self
    }

    /// Whether another processing attempt is allowed.
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// TaskEnvelope
// ---------------------------------------------------------------------------

/// The portable description of a task handed to an external workflow
/// dispatcher. Deliberately excludes local-only bookkeeping (attempts,
/// status); the external engine owns those for its own runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub agent_id: Uuid,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub scheduled_for: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ApprovalStatus / ApprovalDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    /// Approval records only move forward: `Pending` to a terminal state.
    pub fn can_transition_to(&self, target: &ApprovalStatus) -> bool {
        matches!(
            (self, target),
            (ApprovalStatus::Pending, ApprovalStatus::Approved)
                | (ApprovalStatus::Pending, ApprovalStatus::Denied)
                | (ApprovalStatus::Pending, ApprovalStatus::Expired)
        )
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        };
        write!(f, "{}", label)
    }
}

/// A human decision on a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
    Expired,
}

impl ApprovalDecision {
    pub fn as_status(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Denied => ApprovalStatus::Denied,
            ApprovalDecision::Expired => ApprovalStatus::Expired,
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalRequest
// ---------------------------------------------------------------------------

/// A persisted request for human sign-off on a sensitive action.
///
/// `action_payload` carries everything needed to resume the interrupted run
/// later, on any process: the target tool name, its arguments, and the
/// conversation/trace ids. Rows are never deleted; the table doubles as the
/// audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub reason: String,
    pub context_summary: Option<String>,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decision_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        agent_id: Uuid,
        action_type: impl Into<String>,
        action_payload: serde_json::Value,
        reason: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            action_type: action_type.into(),
            action_payload,
            reason: reason.into(),
            context_summary: None,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decision_reason: None,
            expires_at,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// RunTrigger
// ---------------------------------------------------------------------------

/// What caused a run: the origin is threaded into the system context so the
/// model knows whether it is answering a person or reacting to machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    ChatMessage,
    ChatCommand,
    Scheduled,
    Event,
    InterAgent,
    Api,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunTrigger::ChatMessage => "chat_message",
            RunTrigger::ChatCommand => "chat_command",
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Event => "event",
            RunTrigger::InterAgent => "inter_agent",
            RunTrigger::Api => "api",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// CapabilitySet
// ---------------------------------------------------------------------------

/// Coarse-grained permissions held by an agent. `Wildcard` passes every
/// capability check; `Set` must be a superset of a tool's requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySet {
    Wildcard,
    Set(BTreeSet<String>),
}

impl CapabilitySet {
    pub fn wildcard() -> Self {
        CapabilitySet::Wildcard
    }

    pub fn of<I, S>(caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CapabilitySet::Set(caps.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        CapabilitySet::Set(BTreeSet::new())
    }

    /// Required capabilities not covered by this set, in stable order.
    pub fn missing_from(&self, required: &[String]) -> Vec<String> {
        match self {
            CapabilitySet::Wildcard => Vec::new(),
            CapabilitySet::Set(held) => required
                .iter()
                .filter(|cap| !held.contains(*cap))
                .cloned()
                .collect(),
        }
    }

    pub fn covers(&self, required: &[String]) -> bool {
        self.missing_from(required).is_empty()
    }
}

// ---------------------------------------------------------------------------
// AgentProfile
// ---------------------------------------------------------------------------

/// Static description of an agent: identity, org placement, and the
/// capability set the policy layer enforces. The prompt-facing fields
/// (personality, role, team) feed the system-prompt builder and carry no
/// authorization meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: Uuid,
    pub name: String,
    pub capabilities: CapabilitySet,
    pub personality: Option<String>,
    pub role: Option<String>,
    pub team: Option<String>,
    pub reports_to: Option<String>,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capabilities,
            personality: None,
            role: None,
            team: None,
            reports_to: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(&TaskStatus::Pending));
        assert!(TaskStatus::Processing.can_transition_to(&TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(&TaskStatus::Processing));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Completed));
    }

    #[test]
    fn approval_status_only_moves_forward() {
        assert!(ApprovalStatus::Pending.can_transition_to(&ApprovalStatus::Approved));
        assert!(ApprovalStatus::Pending.can_transition_to(&ApprovalStatus::Expired));
        assert!(!ApprovalStatus::Approved.can_transition_to(&ApprovalStatus::Pending));
        assert!(!ApprovalStatus::Expired.can_transition_to(&ApprovalStatus::Approved));
    }

    #[test]
    fn task_type_round_trips_through_strings() {
        assert_eq!(TaskType::parse("agent_run"), TaskType::AgentRun);
        assert_eq!(TaskType::parse("approval_resume"), TaskType::ApprovalResume);
        assert_eq!(
            TaskType::parse("webhook_replay"),
            TaskType::Custom("webhook_replay".into())
        );
        assert_eq!(TaskType::AgentRun.as_str(), "agent_run");
    }

    #[test]
    fn capability_set_missing_lists_gaps() {
        let caps = CapabilitySet::of(["network"]);
        let missing = caps.missing_from(&["network".into(), "shell".into()]);
        assert_eq!(missing, vec!["shell".to_string()]);
        assert!(!caps.covers(&["shell".into()]));
        assert!(caps.covers(&["network".into()]));
    }

    #[test]
    fn wildcard_covers_everything() {
        let caps = CapabilitySet::wildcard();
        assert!(caps.covers(&["shell".into(), "network".into()]));
        assert!(caps.missing_from(&["delegation".into()]).is_empty());
    }

    #[test]
    fn new_task_starts_pending_with_zero_attempts() {
        let task = Task::new(Uuid::new_v4(), TaskType::AgentRun, serde_json::json!({}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert!(task.attempts_remaining());
    }

    #[test]
    fn expired_check_respects_status() {
        let now = Utc::now();
        let mut req = ApprovalRequest::new(
            Uuid::new_v4(),
            "tool_call",
            serde_json::json!({}),
            "test",
            now - chrono::Duration::minutes(1),
        );
        assert!(req.is_expired_at(now));
        req.status = ApprovalStatus::Denied;
        assert!(!req.is_expired_at(now));
    }
}
