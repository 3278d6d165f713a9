use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::{
    ApprovalDecidedPayload, ApprovalRequestedPayload, CoreEvent, EventPayload,
};
use fm_core::store::CoreDb;
use fm_core::types::{ApprovalDecision, ApprovalRequest, ApprovalStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    #[error("approval request already decided: {0}")]
    AlreadyDecided(Uuid),
    #[error("timed out waiting for decision on {0}")]
    DecisionTimeout(Uuid),
    #[error("store error: {0}")]
    Store(#[from] tokio_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

// ---------------------------------------------------------------------------
// ApprovalGate / DecisionOutcome
// ---------------------------------------------------------------------------

/// Everything needed to open an approval request for a sensitive action.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    pub agent_id: Uuid,
    pub action_type: String,
    /// Must contain enough to resume the interrupted run later: tool name,
    /// arguments, conversation id, trace id.
    pub action_payload: serde_json::Value,
    pub reason: String,
    pub context_summary: Option<String>,
    /// Per-request override of the default expiry.
    pub expires_in: Option<Duration>,
}

/// The terminal fate of a request, as seen by a synchronous waiter.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: ApprovalDecision,
    pub decided_by: Option<String>,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// ApprovalWorkflow
// ---------------------------------------------------------------------------

/// Creates and tracks human approval requests.
///
/// Decouples "a tool wants to act" from "a human decided": requesting
/// returns immediately with an id, and the decision arrives later through
/// [`process_decision`](ApprovalWorkflow::process_decision), usually from a
/// chat button handler or an API endpoint. Resumption of the paused run is
/// the task layer's job, driven by the decision events published here.
pub struct ApprovalWorkflow {
    store: Arc<CoreDb>,
    bus: EventBus,
    default_ttl: Duration,
    poll_interval: Duration,
}

impl ApprovalWorkflow {
    pub fn new(store: Arc<CoreDb>, bus: EventBus, default_ttl: Duration) -> Self {
        Self {
            store,
            bus,
            default_ttl,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Override the synchronous waiter's poll interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Persist a pending request and announce it.
    ///
    /// The emitted event carries everything a human-interface adapter needs
    /// to render an actionable prompt.
    pub async fn request_approval(&self, gate: ApprovalGate) -> Result<Uuid> {
        let ttl = gate.expires_in.unwrap_or(self.default_ttl);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));

        let mut request = ApprovalRequest::new(
            gate.agent_id,
            gate.action_type,
            gate.action_payload,
            gate.reason,
            expires_at,
        );
        request.context_summary = gate.context_summary;

        self.store.insert_approval(&request).await?;

        info!(
            request_id = %request.id,
            agent_id = %request.agent_id,
            action_type = %request.action_type,
            expires_at = %request.expires_at,
            "approval requested"
        );

        self.bus
            .publish(CoreEvent::ApprovalRequested(ApprovalRequestedPayload {
                request_id: request.id,
                agent_id: request.agent_id,
                action_type: request.action_type.clone(),
                action_payload: request.action_payload.clone(),
                reason: request.reason.clone(),
                context_summary: request.context_summary.clone(),
                expires_at: request.expires_at,
            }));

        Ok(request.id)
    }

    /// Record a human decision.
    ///
    /// The write carries a `status = 'pending'` predicate, so of two
    /// near-simultaneous deciders exactly one wins; the loser gets
    /// [`ApprovalError::AlreadyDecided`]. Fires a request-scoped decision
    /// event plus a generic audit event.
    pub async fn process_decision(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        decided_by: Option<String>,
        reason: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let won = self
            .store
            .decide_approval(
                request_id,
                decision.as_status(),
                decided_by.clone(),
                reason.clone(),
                now,
            )
            .await?;

        if !won {
            return match self.store.get_approval(request_id).await? {
                None => Err(ApprovalError::NotFound(request_id)),
                Some(_) => Err(ApprovalError::AlreadyDecided(request_id)),
            };
        }

        let request = self
            .store
            .get_approval(request_id)
            .await?
            .ok_or(ApprovalError::NotFound(request_id))?;

        info!(
            request_id = %request_id,
            decision = ?decision,
            decided_by = decided_by.as_deref().unwrap_or("unknown"),
            "approval decided"
        );

        self.publish_decided(&request, decision, decided_by, reason);
        Ok(())
    }

    /// Block until the request is decided, polling the store.
    ///
    /// Off the main run path by design: the run loop never waits; this
    /// exists for callers that explicitly want synchronous semantics.
    pub async fn wait_for_decision(
        &self,
        request_id: Uuid,
        timeout: Duration,
    ) -> Result<DecisionOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let request = self
                .store
                .get_approval(request_id)
                .await?
                .ok_or(ApprovalError::NotFound(request_id))?;

            match request.status {
                ApprovalStatus::Pending => {}
                ApprovalStatus::Approved => {
                    return Ok(DecisionOutcome {
                        decision: ApprovalDecision::Approved,
                        decided_by: request.decided_by,
                        reason: request.decision_reason,
                    })
                }
                ApprovalStatus::Denied => {
                    return Ok(DecisionOutcome {
                        decision: ApprovalDecision::Denied,
                        decided_by: request.decided_by,
                        reason: request.decision_reason,
                    })
                }
                ApprovalStatus::Expired => {
                    return Ok(DecisionOutcome {
                        decision: ApprovalDecision::Expired,
                        decided_by: None,
                        reason: request.decision_reason,
                    })
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ApprovalError::DecisionTimeout(request_id));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Flip overdue pending requests to `expired`, with the same decision
    /// fan-out a human decision would produce. Returns how many expired.
    pub async fn expire_stale(&self) -> Result<usize> {
        let expired = self.store.expire_stale_approvals(Utc::now()).await?;
        for request in &expired {
            warn!(
                request_id = %request.id,
                agent_id = %request.agent_id,
                "approval request expired without a decision"
            );
            self.publish_decided(request, ApprovalDecision::Expired, None, None);
        }
        Ok(expired.len())
    }

    fn publish_decided(
        &self,
        request: &ApprovalRequest,
        decision: ApprovalDecision,
        decided_by: Option<String>,
        reason: Option<String>,
    ) {
        // Request-scoped event for direct resumers.
        self.bus
            .publish(CoreEvent::ApprovalDecided(ApprovalDecidedPayload {
                request_id: request.id,
                agent_id: request.agent_id,
                decision,
                decided_by: decided_by.clone(),
                reason,
                decided_at: request.decided_at.unwrap_or_else(Utc::now),
            }));
        // Generic fan-out for audit subscribers.
        self.bus.publish(CoreEvent::Event(
            EventPayload::new(
                "approval_decided",
                format!(
                    "approval {} for agent {} decided: {:?} by {}",
                    request.id,
                    request.agent_id,
                    decision,
                    decided_by.as_deref().unwrap_or("system")
                ),
            )
            .for_agent(request.agent_id),
        ));
    }
}
