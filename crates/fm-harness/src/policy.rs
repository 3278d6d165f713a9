use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use fm_core::types::CapabilitySet;

// ---------------------------------------------------------------------------
// Capability naming convention
// ---------------------------------------------------------------------------

/// Derive the capabilities a tool needs from its name.
///
/// The convention is deliberately coarse: a tool name either mentions one of
/// the privileged subsystems (network, shell, workspace, delegation, shared
/// memory) or, failing that, its verb suffix classifies it as an external
/// SaaS read or write. Tools matching nothing require no capabilities.
pub fn conventional_capabilities(tool_name: &str) -> Vec<String> {
    const NETWORK: &[&str] = &["http", "web_", "url_", "download", "websocket"];
    const SHELL: &[&str] = &["bash", "shell", "exec", "terminal", "process"];
    const WORKSPACE: &[&str] = &["file_", "_file", "workspace", "directory"];
    const DELEGATION: &[&str] = &["delegate", "spawn_agent", "send_to_agent", "assign_agent"];
    const READ_SUFFIXES: &[&str] = &["_read", "_get", "_list", "_search", "_fetch", "_query"];
    const WRITE_SUFFIXES: &[&str] = &[
        "_write", "_create", "_update", "_delete", "_send", "_post", "_upload",
    ];

    let name = tool_name.to_ascii_lowercase();
    let mut caps = BTreeSet::new();

    if name.starts_with("memory_shared") {
        if WRITE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            caps.insert("memory-shared-write");
        }
    } else {
        if NETWORK.iter().any(|n| name.contains(n)) {
            caps.insert("network");
        }
        if SHELL.iter().any(|n| name.contains(n)) {
            caps.insert("shell");
        }
        if WORKSPACE.iter().any(|n| name.contains(n)) {
            caps.insert("workspace");
        }
        if DELEGATION.iter().any(|n| name.contains(n)) {
            caps.insert("delegation");
        }
        // Verb suffixes only classify tools that hit none of the local
        // subsystems; those are assumed to talk to an external service.
        if caps.is_empty() {
            if READ_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                caps.insert("external-read");
            } else if WRITE_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                caps.insert("external-write");
            }
        }
    }

    caps.into_iter().map(String::from).collect()
}

/// Check a caller's capability set against a tool's requirements.
///
/// Returns the missing capabilities (empty means allowed).
pub fn check_capabilities(held: &CapabilitySet, required: &[String]) -> Vec<String> {
    held.missing_from(required)
}

// ---------------------------------------------------------------------------
// Policy backend seam
// ---------------------------------------------------------------------------

/// What the external backend is asked to judge.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRequest {
    pub agent_id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
    pub capabilities: CapabilitySet,
}

/// The backend's verdict. Absent fields deny-close.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyDecision {
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy backend transport error: {0}")]
    Transport(String),
    #[error("policy backend timed out")]
    Timeout,
    #[error("policy backend error: {0}")]
    Backend(String),
}

/// An external service consulted after the local capability check. It can
/// deny a call the local check would allow, never the reverse.
#[async_trait::async_trait]
pub trait PolicyBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, PolicyError>;
}

// ---------------------------------------------------------------------------
// HttpPolicyBackend
// ---------------------------------------------------------------------------

/// Request/response policy backend over HTTP.
///
/// POSTs the [`PolicyRequest`] as JSON and expects a [`PolicyDecision`]
/// body. Transport failures and timeouts surface as [`PolicyError`]; the
/// caller decides fail-open vs fail-closed.
pub struct HttpPolicyBackend {
    client: reqwest::Client,
    url: String,
    backend_name: String,
}

impl HttpPolicyBackend {
    pub fn new(
        url: impl Into<String>,
        backend_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PolicyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolicyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            backend_name: backend_name.into(),
        })
    }
}

#[async_trait::async_trait]
impl PolicyBackend for HttpPolicyBackend {
    fn name(&self) -> &str {
        &self.backend_name
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<PolicyDecision, PolicyError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PolicyError::Timeout
                } else {
                    PolicyError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(backend = %self.backend_name, %status, "policy backend returned an error");
            return Err(PolicyError::Backend(format!("http {status}")));
        }

        response
            .json::<PolicyDecision>()
            .await
            .map_err(|e| PolicyError::Backend(format!("invalid decision body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convention_maps_network_tools() {
        assert_eq!(conventional_capabilities("http_request"), vec!["network"]);
        assert_eq!(conventional_capabilities("web_search"), vec!["network"]);
    }

    #[test]
    fn convention_maps_shell_tools() {
        assert_eq!(conventional_capabilities("persistent_bash"), vec!["shell"]);
        assert_eq!(conventional_capabilities("exec_command"), vec!["shell"]);
    }

    #[test]
    fn convention_maps_workspace_and_delegation() {
        assert_eq!(conventional_capabilities("file_write"), vec!["workspace"]);
        assert_eq!(
            conventional_capabilities("delegate_task"),
            vec!["delegation"]
        );
    }

    #[test]
    fn convention_maps_external_saas_by_verb() {
        assert_eq!(
            conventional_capabilities("crm_contact_search"),
            vec!["external-read"]
        );
        assert_eq!(
            conventional_capabilities("issue_create"),
            vec!["external-write"]
        );
    }

    #[test]
    fn convention_maps_shared_memory_writes() {
        assert_eq!(
            conventional_capabilities("memory_shared_write"),
            vec!["memory-shared-write"]
        );
        // Reading shared memory is unprivileged.
        assert!(conventional_capabilities("memory_shared_read").is_empty());
    }

    #[test]
    fn unclassified_tools_need_nothing() {
        assert!(conventional_capabilities("calculator").is_empty());
    }

    #[test]
    fn capability_check_reports_missing() {
        let held = CapabilitySet::of(["network"]);
        let missing = check_capabilities(&held, &["network".into(), "shell".into()]);
        assert_eq!(missing, vec!["shell".to_string()]);

        let wildcard = CapabilitySet::wildcard();
        assert!(check_capabilities(&wildcard, &["shell".into()]).is_empty());
    }

    #[test]
    fn policy_decision_denies_by_default() {
        let decision: PolicyDecision = serde_json::from_str("{}").unwrap();
        assert!(!decision.allow);
        assert!(decision.reason.is_none());
    }
}
