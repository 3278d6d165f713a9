use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use fm_agents::approval::ApprovalWorkflow;
use fm_agents::directory::InMemoryAgentDirectory;
use fm_agents::gateway::ToolGateway;
use fm_agents::memory::InMemoryConversationStore;
use fm_agents::runner::AgentRunner;
use fm_agents::serializer::RunSerializer;
use fm_bridge::event_bus::EventBus;
use fm_core::config::Config;
use fm_core::store::CoreDb;
use fm_daemon::daemon::Daemon;
use fm_daemon::dispatch::{Dispatcher, HttpWorkflowDispatcher};
use fm_daemon::handlers::{AgentRunHandler, ApprovalResumeHandler, HandlerRegistry};
use fm_daemon::queue::TaskQueue;
use fm_harness::policy::HttpPolicyBackend;
use fm_harness::provider::StubProvider;
use fm_harness::tools::ToolRegistry;
use fm_telemetry::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var("FOREMAN_CONFIG") {
        Ok(path) => Config::load_from(path).context("failed to load config")?,
        Err(_) => Config::load().context("failed to load config")?,
    };

    let format = if config.general.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    fm_telemetry::init_logging(&config.general.service_name, &config.general.log_level, format);

    let store = Arc::new(
        CoreDb::new(&config.store.path)
            .await
            .context("failed to open task store")?,
    );
    let bus = EventBus::new();

    let approvals = Arc::new(ApprovalWorkflow::new(
        store.clone(),
        bus.clone(),
        Duration::from_secs(config.approvals.default_ttl_secs),
    ));

    // Tool and agent registration happens at deployment wiring; the daemon
    // itself starts empty and the embedding process fills these in.
    let registry = Arc::new(ToolRegistry::new());
    let directory = Arc::new(InMemoryAgentDirectory::new());
    let conversations = Arc::new(InMemoryConversationStore::new());

    let policy_timeout = Duration::from_millis(config.policy.timeout_ms);
    let mut gateway = ToolGateway::new(registry.clone(), approvals.clone())
        .with_fail_open(config.policy.fail_open)
        .with_tool_timeout(Duration::from_secs(config.runner.tool_timeout_secs));
    if let Some(url) = &config.policy.backend_url {
        gateway = gateway.with_policy_backend(Arc::new(
            HttpPolicyBackend::new(url.clone(), "policy", policy_timeout)
                .context("failed to build policy backend")?,
        ));
    }
    if let Some(url) = &config.policy.relationship_url {
        gateway = gateway.with_relationship_authorizer(Arc::new(
            HttpPolicyBackend::new(url.clone(), "relationship", policy_timeout)
                .context("failed to build relationship authorizer")?,
        ));
    }

    let runner = Arc::new(AgentRunner::new(
        Arc::new(StubProvider::new("llm")),
        Arc::new(gateway),
        registry,
        conversations,
        directory.clone(),
        bus.clone(),
        config.runner.clone(),
    ));

    let serializer = RunSerializer::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(AgentRunHandler::new(
        runner.clone(),
        directory.clone(),
        serializer.clone(),
    )));
    handlers.register(Arc::new(ApprovalResumeHandler::new(
        store.clone(),
        runner,
        directory,
        serializer,
    )));

    let mut queue = TaskQueue::new(
        store,
        bus.clone(),
        Arc::new(handlers),
        config.queue.clone(),
    );
    if config.workflow.enabled {
        if let Some(url) = &config.workflow.dispatcher_url {
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(
                HttpWorkflowDispatcher::new(url.clone(), Duration::from_secs(5))
                    .context("failed to build workflow dispatcher")?,
            );
            queue = queue.with_dispatcher(dispatcher);
        }
    }

    let daemon = Daemon::new(config, bus, Arc::new(queue), approvals);

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger();
        }
    });

    daemon.run().await;
    Ok(())
}
