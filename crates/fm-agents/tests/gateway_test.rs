//! Authorization-pipeline tests for the tool execution gateway: capability
//! checks, policy backends, the approval gate, and the execution timeout.
//! Spy tools verify that a refused call never reaches the tool body.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use fm_agents::approval::ApprovalWorkflow;
use fm_agents::context::{PreApprovedAction, RunContext};
use fm_agents::gateway::ToolGateway;
use fm_bridge::event_bus::EventBus;
use fm_core::store::CoreDb;
use fm_core::types::{ApprovalStatus, CapabilitySet, RunTrigger};
use fm_harness::policy::{PolicyBackend, PolicyDecision, PolicyError, PolicyRequest};
use fm_harness::schema::ParamSchema;
use fm_harness::tools::{ExecContext, Tool, ToolRegistry, ToolResult, ToolSpec};

// ---------------------------------------------------------------------------
// Spies and stubs
// ---------------------------------------------------------------------------

struct SpyTool {
    name: &'static str,
    requires_approval: bool,
    invocations: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl SpyTool {
    fn new(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                name,
                requires_approval: false,
                invocations: invocations.clone(),
                delay: None,
            }),
            invocations,
        )
    }

    fn gated(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                name,
                requires_approval: true,
                invocations: invocations.clone(),
                delay: None,
            }),
            invocations,
        )
    }

    fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            requires_approval: false,
            invocations: Arc::new(AtomicUsize::new(0)),
            delay: Some(delay),
        })
    }
}

#[async_trait::async_trait]
impl Tool for SpyTool {
    fn spec(&self) -> ToolSpec {
        let spec = ToolSpec::new(self.name, "spy tool", ParamSchema::object([]));
        if self.requires_approval {
            spec.with_approval()
        } else {
            spec
        }
    }

    async fn execute(&self, _args: Value, _ctx: &ExecContext) -> ToolResult {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        ToolResult::ok("spy executed")
    }
}

struct StaticPolicy {
    allow: bool,
    error: bool,
}

#[async_trait::async_trait]
impl PolicyBackend for StaticPolicy {
    fn name(&self) -> &str {
        "static-policy"
    }

    async fn evaluate(&self, _request: &PolicyRequest) -> Result<PolicyDecision, PolicyError> {
        if self.error {
            return Err(PolicyError::Timeout);
        }
        Ok(PolicyDecision {
            allow: self.allow,
            reason: (!self.allow).then(|| "blocked for testing".to_string()),
        })
    }
}

async fn build_gateway(registry: ToolRegistry) -> (ToolGateway, Arc<CoreDb>) {
    let store = Arc::new(CoreDb::new_in_memory().await.unwrap());
    let approvals = Arc::new(ApprovalWorkflow::new(
        store.clone(),
        EventBus::new(),
        Duration::from_secs(1800),
    ));
    (ToolGateway::new(Arc::new(registry), approvals), store)
}

fn ctx_with_caps(caps: CapabilitySet) -> RunContext {
    RunContext::new(Uuid::new_v4(), "conv-1", RunTrigger::ChatMessage, caps)
}

// ---------------------------------------------------------------------------
// Capability checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn network_agent_may_call_http_but_not_bash() {
    let (http_tool, http_count) = SpyTool::new("http_request");
    let (bash_tool, bash_count) = SpyTool::new("persistent_bash");
    let mut registry = ToolRegistry::new();
    registry.register(http_tool);
    registry.register(bash_tool);
    let (gateway, _store) = build_gateway(registry).await;

    let mut ctx = ctx_with_caps(CapabilitySet::of(["network"]));

    let allowed = gateway.execute("http_request", json!({}), &mut ctx).await;
    assert!(allowed.success);
    assert_eq!(http_count.load(Ordering::SeqCst), 1);

    let denied = gateway.execute("persistent_bash", json!({}), &mut ctx).await;
    assert!(!denied.success);
    assert!(denied.output.contains("Missing capabilities: shell"));
    assert_eq!(
        denied.metadata.as_ref().unwrap()["missing_capabilities"][0],
        "shell"
    );
    assert_eq!(bash_count.load(Ordering::SeqCst), 0, "body must never run");
}

#[tokio::test]
async fn wildcard_capabilities_pass_everything() {
    let (bash_tool, bash_count) = SpyTool::new("persistent_bash");
    let mut registry = ToolRegistry::new();
    registry.register(bash_tool);
    let (gateway, _store) = build_gateway(registry).await;

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway.execute("persistent_bash", json!({}), &mut ctx).await;
    assert!(result.success);
    assert_eq!(bash_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_tool_is_a_failed_result() {
    let (gateway, _store) = build_gateway(ToolRegistry::new()).await;
    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());

    let result = gateway.execute("nonexistent", json!({}), &mut ctx).await;
    assert!(!result.success);
    assert!(result.output.contains("tool not found"));
}

// ---------------------------------------------------------------------------
// Policy backends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn policy_backend_can_deny_what_capabilities_allow() {
    let (tool, count) = SpyTool::new("http_request");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, _store) = build_gateway(registry).await;
    let gateway = gateway.with_policy_backend(Arc::new(StaticPolicy {
        allow: false,
        error: false,
    }));

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway.execute("http_request", json!({}), &mut ctx).await;
    assert!(!result.success);
    assert!(result.output.contains("denied by policy backend"));
    assert!(result.output.contains("blocked for testing"));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_backend_denies_closed_by_default() {
    let (tool, count) = SpyTool::new("http_request");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, _store) = build_gateway(registry).await;
    let gateway = gateway.with_policy_backend(Arc::new(StaticPolicy {
        allow: true,
        error: true,
    }));

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway.execute("http_request", json!({}), &mut ctx).await;
    assert!(!result.success);
    assert!(result.output.contains("denying by default"));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreachable_backend_allows_when_fail_open() {
    let (tool, count) = SpyTool::new("http_request");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, _store) = build_gateway(registry).await;
    let gateway = gateway
        .with_policy_backend(Arc::new(StaticPolicy {
            allow: true,
            error: true,
        }))
        .with_fail_open(true);

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway.execute("http_request", json!({}), &mut ctx).await;
    assert!(result.success);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn relationship_authorizer_denial_names_itself() {
    let (tool, _count) = SpyTool::new("http_request");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, _store) = build_gateway(registry).await;
    let gateway = gateway.with_relationship_authorizer(Arc::new(StaticPolicy {
        allow: false,
        error: false,
    }));

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway.execute("http_request", json!({}), &mut ctx).await;
    assert!(!result.success);
    assert!(result.output.contains("denied by relationship authorizer"));
}

// ---------------------------------------------------------------------------
// Approval gate + pre-approved token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_required_tool_pauses_without_executing() {
    let (tool, count) = SpyTool::gated("file_write");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, store) = build_gateway(registry).await;

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway
        .execute("file_write", json!({"path": "a.txt"}), &mut ctx)
        .await;

    assert!(result.success);
    assert!(result.is_approval_pending());
    assert_eq!(count.load(Ordering::SeqCst), 0, "body must not run");

    let request_id = result.approval_request_id().unwrap();
    let request = store.get_approval(request_id).await.unwrap().unwrap();
    assert_eq!(request.status, ApprovalStatus::Pending);
    assert_eq!(request.action_payload["tool"], "file_write");
    assert_eq!(request.action_payload["arguments"]["path"], "a.txt");
    assert_eq!(request.action_payload["conversation_id"], "conv-1");
}

#[tokio::test]
async fn matching_token_executes_once_and_is_consumed() {
    let (tool, count) = SpyTool::gated("file_write");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, _store) = build_gateway(registry).await;

    let request_id = Uuid::new_v4();
    let args = json!({"path": "a.txt", "content": "x"});
    let mut ctx = ctx_with_caps(CapabilitySet::wildcard()).with_pre_approved(PreApprovedAction {
        request_id,
        tool_name: "file_write".into(),
        arguments: args.clone(),
    });

    // Structurally equal args with reordered keys must match the token.
    let reordered = json!({"content": "x", "path": "a.txt"});
    let first = gateway.execute("file_write", reordered, &mut ctx).await;
    assert!(first.success);
    assert!(!first.is_approval_pending());
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // The token is single-use: an identical second call goes back to the
    // approval gate.
    let second = gateway.execute("file_write", args, &mut ctx).await;
    assert!(second.is_approval_pending());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn token_with_different_arguments_does_not_match() {
    let (tool, count) = SpyTool::gated("file_write");
    let mut registry = ToolRegistry::new();
    registry.register(tool);
    let (gateway, _store) = build_gateway(registry).await;

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard()).with_pre_approved(PreApprovedAction {
        request_id: Uuid::new_v4(),
        tool_name: "file_write".into(),
        arguments: json!({"path": "a.txt"}),
    });

    let result = gateway
        .execute("file_write", json!({"path": "OTHER.txt"}), &mut ctx)
        .await;
    assert!(result.is_approval_pending());
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(ctx.has_pre_approval(), "non-matching call keeps the token");
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_tool_is_cut_off_by_the_timeout() {
    let mut registry = ToolRegistry::new();
    registry.register(SpyTool::slow("http_request", Duration::from_secs(30)));
    let (gateway, _store) = build_gateway(registry).await;
    let gateway = gateway.with_tool_timeout(Duration::from_millis(50));

    let mut ctx = ctx_with_caps(CapabilitySet::wildcard());
    let result = gateway.execute("http_request", json!({}), &mut ctx).await;
    assert!(!result.success);
    assert!(result.output.contains("timed out"));
    assert_eq!(result.metadata.unwrap()["timeout"], true);
}
