use serde_json::Value;
use uuid::Uuid;

use fm_core::types::{CapabilitySet, RunTrigger};

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialize a JSON value with object keys in sorted order at every level.
///
/// Two structurally equal values (same fields, any key order) canonicalize
/// to the same string, which is what pre-approval matching compares.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(elements) => {
            out.push('[');
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// PreApprovedAction
// ---------------------------------------------------------------------------

/// A single-use authorization for one specific tool call, attached to a
/// resumed run. Matching is by tool name plus structural argument equality.
#[derive(Debug, Clone)]
pub struct PreApprovedAction {
    pub request_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
}

impl PreApprovedAction {
    pub fn matches(&self, tool_name: &str, arguments: &Value) -> bool {
        self.tool_name == tool_name
            && canonical_json(&self.arguments) == canonical_json(arguments)
    }
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Per-invocation state for one run. Created by whatever triggered the run,
/// discarded when the run returns; its durable effects live in conversation
/// history and the task/approval tables.
#[derive(Debug)]
pub struct RunContext {
    pub agent_id: Uuid,
    pub conversation_id: String,
    pub trace_id: String,
    pub trigger: RunTrigger,
    pub capabilities: CapabilitySet,
    pre_approved: Option<PreApprovedAction>,
}

impl RunContext {
    pub fn new(
        agent_id: Uuid,
        conversation_id: impl Into<String>,
        trigger: RunTrigger,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            agent_id,
            conversation_id: conversation_id.into(),
            trace_id: Uuid::new_v4().to_string(),
            trigger,
            capabilities,
            pre_approved: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_pre_approved(mut self, action: PreApprovedAction) -> Self {
        self.pre_approved = Some(action);
        self
    }

    pub fn has_pre_approval(&self) -> bool {
        self.pre_approved.is_some()
    }

    /// Consume the pre-approved token if it matches this exact call.
    ///
    /// The token is linear: once taken it is gone for the rest of the run,
    /// whether or not the call it authorized goes on to succeed. A
    /// non-matching call leaves the token in place.
    pub fn take_pre_approval_for(
        &mut self,
        tool_name: &str,
        arguments: &Value,
    ) -> Option<PreApprovedAction> {
        if self
            .pre_approved
            .as_ref()
            .is_some_and(|p| p.matches(tool_name, arguments))
        {
            self.pre_approved.take()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
