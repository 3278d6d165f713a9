use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::CoreEvent;
use fm_core::config::RunnerConfig;
use fm_core::types::AgentProfile;
use fm_harness::provider::{
    Completion, CompletionRequest, FinishReason, LlmProvider, Message, TokenUsage,
};
use fm_harness::tools::ToolRegistry;

use crate::context::RunContext;
use crate::directory::AgentDirectory;
use crate::gateway::ToolGateway;
use crate::memory::{ConversationStore, MemoryRecall};
use crate::state::{RunState, RunStateMachine};

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// The outcome of one run. The run loop's public contract is "always returns
/// a RunResult"; failures are reported in-band, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub response: Option<String>,
    pub tools_used: Vec<String>,
    pub token_usage: TokenUsage,
    pub iterations: u32,
    pub duration_ms: u64,
    /// Non-empty when the run paused behind one approval request. The run
    /// still counts as successful; resumption is a new task dispatch.
    pub approvals_pending: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// RunHook
// ---------------------------------------------------------------------------

/// Post-run extension point, invoked after a successful final response
/// (memory consolidation, metrics, follow-up scheduling live behind this).
#[async_trait::async_trait]
pub trait RunHook: Send + Sync {
    async fn after_run(&self, ctx: &RunContext, result: &RunResult);
}

// ---------------------------------------------------------------------------
// Internal error type, converted to a failed RunResult at the top level.
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum RunnerError {
    #[error("unknown agent: {0}")]
    UnknownAgent(Uuid),
    #[error("provider error: {0}")]
    Provider(#[from] fm_harness::provider::ProviderError),
    #[error("memory error: {0}")]
    Memory(#[from] crate::memory::MemoryError),
    #[error("run state error: {0}")]
    State(#[from] crate::state::StateError),
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

/// The think/act/respond loop.
///
/// Each run: assemble history and recalled memories, persist the user turn,
/// then iterate LLM calls, executing requested tools through the gateway,
/// until the model produces a final answer, an approval pauses the run, or
/// the iteration ceiling trips.
pub struct AgentRunner {
    provider: Arc<dyn LlmProvider>,
    gateway: Arc<ToolGateway>,
    registry: Arc<ToolRegistry>,
    conversations: Arc<dyn ConversationStore>,
    recall: Option<Arc<dyn MemoryRecall>>,
    directory: Arc<dyn AgentDirectory>,
    bus: EventBus,
    settings: RunnerConfig,
    hook: Option<Arc<dyn RunHook>>,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        gateway: Arc<ToolGateway>,
        registry: Arc<ToolRegistry>,
        conversations: Arc<dyn ConversationStore>,
        directory: Arc<dyn AgentDirectory>,
        bus: EventBus,
        settings: RunnerConfig,
    ) -> Self {
        Self {
            provider,
            gateway,
            registry,
            conversations,
            recall: None,
            directory,
            bus,
            settings,
            hook: None,
        }
    }

    pub fn with_recall(mut self, recall: Arc<dyn MemoryRecall>) -> Self {
        self.recall = Some(recall);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn RunHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Execute one run. Never raises: every failure becomes a
    /// `success = false` result with a human-readable message.
    pub async fn run(&self, input: &str, ctx: &mut RunContext) -> RunResult {
        let start = Instant::now();
        let mut stats = RunStats::default();

        self.bus.publish(CoreEvent::RunStarted {
            agent_id: ctx.agent_id,
            conversation_id: ctx.conversation_id.clone(),
            trace_id: ctx.trace_id.clone(),
        });

        let result = match self.run_inner(input, ctx, &mut stats, start).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    agent_id = %ctx.agent_id,
                    conversation_id = %ctx.conversation_id,
                    error = %e,
                    "run failed"
                );
                RunResult {
                    success: false,
                    response: Some(format!("Run failed: {e}")),
                    tools_used: stats.tools_used.clone(),
                    token_usage: stats.usage,
                    iterations: stats.iterations,
                    duration_ms: start.elapsed().as_millis() as u64,
                    approvals_pending: Vec::new(),
                }
            }
        };

        self.bus.publish(CoreEvent::RunFinished {
            agent_id: ctx.agent_id,
            conversation_id: ctx.conversation_id.clone(),
            success: result.success,
            iterations: result.iterations,
        });

        result
    }

    async fn run_inner(
        &self,
        input: &str,
        ctx: &mut RunContext,
        stats: &mut RunStats,
        start: Instant,
    ) -> Result<RunResult, RunnerError> {
        let mut sm = RunStateMachine::new();

        let profile = self
            .directory
            .get(ctx.agent_id)
            .await
            .ok_or(RunnerError::UnknownAgent(ctx.agent_id))?;

        // Assemble the initial message list: system context (trigger +
        // recalled memories), prior turns, then the new input.
        let mut messages = Vec::new();
        messages.push(Message::system(self.build_context_block(input, ctx).await?));
        messages.extend(self.conversations.history(&ctx.conversation_id).await?);
        messages.push(Message::user(input));

        self.conversations
            .append(&ctx.conversation_id, Message::user(input))
            .await?;

        let system_prompt = build_system_prompt(&profile);
        let tool_defs = self.registry.tool_defs();

        for iteration in 1..=self.settings.max_iterations {
            stats.iterations = iteration;
            sm.advance(RunState::Thinking)?;

            let request = CompletionRequest::new(messages.clone())
                .with_system_prompt(system_prompt.clone())
                .with_tools(tool_defs.clone())
                .with_sampling(self.settings.temperature, self.settings.max_tokens);

            let completion = self.provider.complete(request).await?;
            stats.usage.absorb(&completion.usage);

            if completion.tool_calls.is_empty() || completion.finish_reason == FinishReason::Stop {
                return self
                    .finish_responding(completion, ctx, &mut sm, stats, start)
                    .await;
            }

            sm.advance(RunState::ExecutingTool)?;

            let assistant_text = completion.content.clone().unwrap_or_default();
            messages.push(Message::assistant(assistant_text.clone()));

            for call in &completion.tool_calls {
                let args: serde_json::Value = match serde_json::from_str(&call.arguments) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "unparseable tool arguments");
                        messages.push(Message::tool_result(
                            call.name.clone(),
                            call.id.clone(),
                            format!("Tool `{}` failed: arguments were not valid JSON", call.name),
                        ));
                        continue;
                    }
                };

                stats.tools_used.push(call.name.clone());
                let result = self.gateway.execute(&call.name, args, ctx).await;

                if result.is_approval_pending() {
                    // Deliberate short-circuit: remaining tool calls in this
                    // turn are not executed. Approval semantics attach to the
                    // whole turn; after resume the model re-requests whatever
                    // it still needs.
                    let Some(request_id) = result.approval_request_id() else {
                        warn!(tool = %call.name, "approval-pending result without request id");
                        messages.push(Message::tool_result(
                            call.name.clone(),
                            call.id.clone(),
                            format!("Tool `{}` failed: malformed approval marker", call.name),
                        ));
                        continue;
                    };

                    self.conversations
                        .append(
                            &ctx.conversation_id,
                            Message::assistant(if assistant_text.is_empty() {
                                result.output.clone()
                            } else {
                                assistant_text.clone()
                            }),
                        )
                        .await?;

                    sm.advance(RunState::WaitingApproval)?;
                    info!(
                        agent_id = %ctx.agent_id,
                        request_id = %request_id,
                        tool = %call.name,
                        "run paused awaiting approval"
                    );

                    return Ok(RunResult {
                        success: true,
                        response: Some(result.output),
                        tools_used: stats.tools_used.clone(),
                        token_usage: stats.usage,
                        iterations: iteration,
                        duration_ms: start.elapsed().as_millis() as u64,
                        approvals_pending: vec![request_id],
                    });
                }

                let content = if result.success {
                    result.output
                } else {
                    format!("Tool `{}` failed: {}", call.name, result.output)
                };
                messages.push(Message::tool_result(call.name.clone(), call.id.clone(), content));
            }

            // Loop back to Thinking via the next iteration's advance.
        }

        // Iteration ceiling: reported as a failed result, not retried here;
        // retry policy belongs to the task distribution layer.
        warn!(
            agent_id = %ctx.agent_id,
            iterations = self.settings.max_iterations,
            "run exhausted its iteration budget"
        );
        Ok(RunResult {
            success: false,
            response: Some(format!(
                "Maximum iterations reached ({}) without a final answer.",
                self.settings.max_iterations
            )),
            tools_used: stats.tools_used.clone(),
            token_usage: stats.usage,
            iterations: self.settings.max_iterations,
            duration_ms: start.elapsed().as_millis() as u64,
            approvals_pending: Vec::new(),
        })
    }

    async fn finish_responding(
        &self,
        completion: Completion,
        ctx: &RunContext,
        sm: &mut RunStateMachine,
        stats: &mut RunStats,
        start: Instant,
    ) -> Result<RunResult, RunnerError> {
        sm.advance(RunState::Responding)?;

        let text = completion.content.unwrap_or_default();
        self.conversations
            .append(&ctx.conversation_id, Message::assistant(text.clone()))
            .await?;

        let result = RunResult {
            success: true,
            response: Some(text),
            tools_used: stats.tools_used.clone(),
            token_usage: stats.usage,
            iterations: stats.iterations,
            duration_ms: start.elapsed().as_millis() as u64,
            approvals_pending: Vec::new(),
        };

        if let Some(hook) = &self.hook {
            hook.after_run(ctx, &result).await;
        }

        sm.advance(RunState::Idle)?;
        Ok(result)
    }

    /// System context for this invocation: trigger metadata plus recalled
    /// long-term memories. Policy never goes in here.
    async fn build_context_block(
        &self,
        input: &str,
        ctx: &RunContext,
    ) -> Result<String, RunnerError> {
        let mut block = format!("Trigger: {}\nTrace: {}", ctx.trigger, ctx.trace_id);

        if let Some(recall) = &self.recall {
            let memories = recall.recall(input, self.settings.recall_k).await?;
            if !memories.is_empty() {
                block.push_str("\n\nRelevant memories:");
                for memory in memories {
                    block.push_str(&format!("\n- {}", memory.content));
                }
            }
        }

        Ok(block)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunStats {
    iterations: u32,
    usage: TokenUsage,
    tools_used: Vec<String>,
}

/// Assemble the agent's system prompt from its profile. Entirely policy-free
/// text: capabilities and approval rules are enforced by the gateway, never
/// by prompting.
fn build_system_prompt(profile: &AgentProfile) -> String {
    let mut prompt = format!(
        "You are {}, an autonomous agent. Use the available tools when they \
         help, and answer directly when they don't.",
        profile.name
    );

    if let Some(personality) = &profile.personality {
        prompt.push_str(&format!("\n\nPersonality: {personality}"));
    }
    if let Some(role) = &profile.role {
        prompt.push_str(&format!("\nRole: {role}"));
    }
    if let Some(team) = &profile.team {
        prompt.push_str(&format!("\nTeam: {team}"));
    }
    if let Some(reports_to) = &profile.reports_to {
        prompt.push_str(&format!("\nReports to: {reports_to}"));
    }

    prompt.push_str(
        "\n\nTo collaborate with other agents, use the delegation tools if \
         they are available to you.",
    );
    prompt
}
