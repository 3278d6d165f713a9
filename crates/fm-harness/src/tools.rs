use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::policy::conventional_capabilities;
use crate::provider::ToolDef;
use crate::schema::ParamSchema;

// ---------------------------------------------------------------------------
// ExecContext
// ---------------------------------------------------------------------------

/// The slice of run identity a tool body is allowed to see.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub agent_id: Uuid,
    pub conversation_id: String,
    pub trace_id: String,
}

// ---------------------------------------------------------------------------
// ToolResult
// ---------------------------------------------------------------------------

/// Outcome of a tool invocation. Always a value, never an error: every
/// failure mode (denial, timeout, tool body error) is reported through
/// `success = false` with a human-readable `output`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            metadata: None,
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// A "the call is parked behind an approval request" result. This is not
    /// a failure: the run pauses and resumes once a human decides.
    pub fn approval_pending(request_id: Uuid, tool_name: &str) -> Self {
        Self {
            success: true,
            output: format!(
                "Tool `{tool_name}` requires human approval; request {request_id} is pending."
            ),
            metadata: Some(json!({
                "approval_pending": true,
                "approval_request_id": request_id.to_string(),
            })),
        }
    }

    pub fn is_approval_pending(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("approval_pending"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn approval_request_id(&self) -> Option<Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("approval_request_id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

// ---------------------------------------------------------------------------
// ToolSpec
// ---------------------------------------------------------------------------

/// Static description of a tool: identity, parameter schema, and the
/// authorization surface the gateway enforces around it.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: ParamSchema,
    /// Sensitive tools pause the run for human approval.
    pub requires_approval: bool,
    /// Explicit capability requirements. `None` falls back to the
    /// name-derived convention.
    pub capabilities: Option<Vec<String>>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ParamSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            requires_approval: false,
            capabilities: None,
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(caps.into_iter().map(Into::into).collect());
        self
    }

    /// Capabilities a caller must hold to invoke this tool.
    pub fn required_capabilities(&self) -> Vec<String> {
        match &self.capabilities {
            Some(explicit) => explicit.clone(),
            None => conventional_capabilities(&self.name),
        }
    }

    /// Render as a provider-facing tool definition.
    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.to_json_schema(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool trait + registry
// ---------------------------------------------------------------------------

/// The contract every tool implements. Bodies must not panic; anything that
/// can go wrong is reported through the returned [`ToolResult`].
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, args: Value, ctx: &ExecContext) -> ToolResult;
}

/// Name-keyed lookup of the tools available to an agent.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its spec name, replacing any previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.spec().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Specs of every registered tool, sorted by name for stable prompts.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Provider-facing definitions for the whole registry.
    pub fn tool_defs(&self) -> Vec<ToolDef> {
        self.specs().iter().map(ToolSpec::to_tool_def).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new(
                "echo",
                "Echo the input back",
                ParamSchema::object([("text", ParamSchema::string("text to echo"), true)]),
            )
        }

        async fn execute(&self, args: Value, _ctx: &ExecContext) -> ToolResult {
            ToolResult::ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn ctx() -> ExecContext {
        ExecContext {
            agent_id: Uuid::new_v4(),
            conversation_id: "conv-1".into(),
            trace_id: "trace-1".into(),
        }
    }

    #[tokio::test]
    async fn registry_resolves_and_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let tool = registry.get("echo").expect("registered");
        let result = tool.execute(json!({"text": "hi"}), &ctx()).await;
        assert!(result.success);
        assert_eq!(result.output, "hi");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn spec_capabilities_fall_back_to_convention() {
        let spec = ToolSpec::new("http_request", "d", ParamSchema::object([]));
        assert_eq!(spec.required_capabilities(), vec!["network".to_string()]);

        let spec = spec.with_capabilities(["external-write"]);
        assert_eq!(
            spec.required_capabilities(),
            vec!["external-write".to_string()]
        );
    }

    #[test]
    fn approval_pending_result_round_trips_request_id() {
        let id = Uuid::new_v4();
        let result = ToolResult::approval_pending(id, "file_write");
        assert!(result.success);
        assert!(result.is_approval_pending());
        assert_eq!(result.approval_request_id(), Some(id));

        let plain = ToolResult::ok("done");
        assert!(!plain.is_approval_pending());
        assert_eq!(plain.approval_request_id(), None);
    }

    #[test]
    fn tool_defs_are_sorted_by_name() {
        struct Named(&'static str);
        #[async_trait::async_trait]
        impl Tool for Named {
            fn spec(&self) -> ToolSpec {
                ToolSpec::new(self.0, "d", ParamSchema::object([]))
            }
            async fn execute(&self, _args: Value, _ctx: &ExecContext) -> ToolResult {
                ToolResult::ok("")
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Named("zeta")));
        registry.register(Arc::new(Named("alpha")));

        let names: Vec<String> = registry.tool_defs().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
