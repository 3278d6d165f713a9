use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use fm_harness::policy::{PolicyBackend, PolicyRequest};
use fm_harness::tools::{ExecContext, ToolRegistry, ToolResult};

use crate::approval::{ApprovalGate, ApprovalWorkflow};
use crate::context::RunContext;

/// Default hard timeout for a single tool invocation.
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// ToolGateway
// ---------------------------------------------------------------------------

/// Wraps the tool registry with the full authorization pipeline.
///
/// Every call runs: resolve -> capability check -> schema validation ->
/// external policy backends -> approval gate -> timed execution. Each step
/// that refuses the call produces a failed [`ToolResult`] with the refusal
/// reason; this method never returns an error and never panics, because the
/// run loop feeds its output straight back into the conversation.
pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    approvals: Arc<ApprovalWorkflow>,
    policy_backend: Option<Arc<dyn PolicyBackend>>,
    relationship_authorizer: Option<Arc<dyn PolicyBackend>>,
    /// When true, an unreachable backend allows the call instead of denying.
    fail_open: bool,
    tool_timeout: Duration,
}

impl ToolGateway {
    pub fn new(registry: Arc<ToolRegistry>, approvals: Arc<ApprovalWorkflow>) -> Self {
        Self {
            registry,
            approvals,
            policy_backend: None,
            relationship_authorizer: None,
            fail_open: false,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_policy_backend(mut self, backend: Arc<dyn PolicyBackend>) -> Self {
        self.policy_backend = Some(backend);
        self
    }

    pub fn with_relationship_authorizer(mut self, authorizer: Arc<dyn PolicyBackend>) -> Self {
        self.relationship_authorizer = Some(authorizer);
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Execute one tool call on behalf of the run in `ctx`.
    pub async fn execute(&self, tool_name: &str, args: Value, ctx: &mut RunContext) -> ToolResult {
        // (a) resolve
        let Some(tool) = self.registry.get(tool_name) else {
            return ToolResult::fail(format!("tool not found: {tool_name}"))
                .with_metadata(json!({"not_found": true}));
        };
        let spec = tool.spec();

        // (b) capability check
        let required = spec.required_capabilities();
        let missing = ctx.capabilities.missing_from(&required);
        if !missing.is_empty() {
            warn!(
                agent_id = %ctx.agent_id,
                tool = tool_name,
                missing = ?missing,
                "tool call denied: missing capabilities"
            );
            return ToolResult::fail(format!("Missing capabilities: {}", missing.join(", ")))
                .with_metadata(json!({"missing_capabilities": missing}));
        }

        // structural argument validation before anything expensive runs
        if let Err(e) = spec.parameters.validate(&args) {
            return ToolResult::fail(format!("invalid arguments for `{tool_name}`: {e}"));
        }

        // (c) external policy backends, deny-closed
        if let Some(verdict) = self
            .consult_backend(
                self.policy_backend.as_deref(),
                "policy backend",
                tool_name,
                &args,
                ctx,
            )
            .await
        {
            return verdict;
        }
        if let Some(verdict) = self
            .consult_backend(
                self.relationship_authorizer.as_deref(),
                "relationship authorizer",
                tool_name,
                &args,
                ctx,
            )
            .await
        {
            return verdict;
        }

        // (d) approval gate, unless a matching pre-approved token covers
        // this exact call. The token is consumed here, before the body runs.
        if spec.requires_approval {
            match ctx.take_pre_approval_for(tool_name, &args) {
                Some(token) => {
                    debug!(
                        request_id = %token.request_id,
                        tool = tool_name,
                        "pre-approved token consumed"
                    );
                }
                None => {
                    let gate = ApprovalGate {
                        agent_id: ctx.agent_id,
                        action_type: "tool_call".to_string(),
                        action_payload: json!({
                            "tool": tool_name,
                            "arguments": args,
                            "conversation_id": ctx.conversation_id,
                            "trace_id": ctx.trace_id,
                        }),
                        reason: format!("Tool `{tool_name}` requires human approval"),
                        context_summary: Some(format!(
                            "Agent {} wants to call `{}`",
                            ctx.agent_id, tool_name
                        )),
                        expires_in: None,
                    };
                    return match self.approvals.request_approval(gate).await {
                        Ok(request_id) => ToolResult::approval_pending(request_id, tool_name),
                        Err(e) => ToolResult::fail(format!(
                            "failed to create approval request for `{tool_name}`: {e}"
                        )),
                    };
                }
            }
        }

        // (e) invoke under a hard timeout
        let exec_ctx = ExecContext {
            agent_id: ctx.agent_id,
            conversation_id: ctx.conversation_id.clone(),
            trace_id: ctx.trace_id.clone(),
        };
        match tokio::time::timeout(self.tool_timeout, tool.execute(args, &exec_ctx)).await {
            Ok(result) => result,
            Err(_) => ToolResult::fail(format!(
                "tool `{tool_name}` timed out after {}s",
                self.tool_timeout.as_secs()
            ))
            .with_metadata(json!({"timeout": true})),
        }
    }

    /// Ask one backend for a verdict. Returns `Some(denial)` when the call
    /// must stop here, `None` when it may proceed.
    async fn consult_backend(
        &self,
        backend: Option<&dyn PolicyBackend>,
        label: &str,
        tool_name: &str,
        args: &Value,
        ctx: &RunContext,
    ) -> Option<ToolResult> {
        let backend = backend?;
        let request = PolicyRequest {
            agent_id: ctx.agent_id,
            tool_name: tool_name.to_string(),
            arguments: args.clone(),
            capabilities: ctx.capabilities.clone(),
        };

        match backend.evaluate(&request).await {
            Ok(decision) if decision.allow => None,
            Ok(decision) => {
                let reason = decision.reason.unwrap_or_else(|| "no reason given".into());
                Some(
                    ToolResult::fail(format!(
                        "denied by {label} `{}`: {reason}",
                        backend.name()
                    ))
                    .with_metadata(json!({"denied_by": backend.name()})),
                )
            }
            Err(e) if self.fail_open => {
                warn!(
                    backend = backend.name(),
                    error = %e,
                    "{label} unreachable; fail-open is configured, allowing call"
                );
                None
            }
            Err(e) => Some(
                ToolResult::fail(format!(
                    "{label} `{}` unavailable ({e}); denying by default",
                    backend.name()
                ))
                .with_metadata(json!({"backend_error": true})),
            ),
        }
    }
}
