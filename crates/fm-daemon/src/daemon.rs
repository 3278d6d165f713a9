use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use fm_agents::approval::ApprovalWorkflow;
use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::CoreEvent;
use fm_core::config::Config;
use fm_core::types::TaskType;

use crate::queue::{EnqueueOptions, TaskQueue};
use crate::shutdown::ShutdownSignal;

/// The foreman background daemon.
///
/// Owns the queue poll loop, the approval expiry sweep, and the bus listener
/// that turns approval decisions into `approval_resume` tasks. Stops
/// gracefully when the shutdown signal fires.
pub struct Daemon {
    config: Config,
    bus: EventBus,
    queue: Arc<TaskQueue>,
    approvals: Arc<ApprovalWorkflow>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(
        config: Config,
        bus: EventBus,
        queue: Arc<TaskQueue>,
        approvals: Arc<ApprovalWorkflow>,
    ) -> Self {
        Self {
            config,
            bus,
            queue,
            approvals,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Handle for triggering shutdown from another task (e.g. ctrl-c).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Spawn all background loops and return immediately.
    pub fn spawn_background_loops(&self) {
        // Queue poll loop.
        {
            let queue = self.queue.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                queue.run(shutdown).await;
            });
        }

        // Approval expiry sweep.
        {
            let approvals = self.approvals.clone();
            let shutdown = self.shutdown.clone();
            let sweep_secs = self.config.approvals.sweep_interval_secs;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(sweep_secs));
                tick.tick().await;
                let mut shutdown_rx = shutdown.subscribe();
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            match approvals.expire_stale().await {
                                Ok(0) => {}
                                Ok(count) => info!(count, "expired stale approval requests"),
                                Err(e) => error!(error = %e, "approval expiry sweep failed"),
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        // Decision listener: every decided approval gets a resume task. The
        // resume handler itself filters out denials and expiries, so one
        // path covers all outcomes.
        {
            let queue = self.queue.clone();
            let shutdown = self.shutdown.clone();
            let events = self.bus.subscribe();
            tokio::spawn(async move {
                let mut shutdown_rx = shutdown.subscribe();
                loop {
                    tokio::select! {
                        event = events.recv_async() => {
                            let Ok(event) = event else { break };
                            if let CoreEvent::ApprovalDecided(decided) = event {
                                let receipt = queue
                                    .enqueue(
                                        decided.agent_id,
                                        TaskType::ApprovalResume,
                                        json!({"request_id": decided.request_id.to_string()}),
                                        EnqueueOptions::default(),
                                    )
                                    .await;
                                match receipt {
                                    Ok(receipt) => info!(
                                        request_id = %decided.request_id,
                                        ?receipt,
                                        "approval decision queued for resume"
                                    ),
                                    Err(e) => warn!(
                                        request_id = %decided.request_id,
                                        error = %e,
                                        "failed to enqueue approval resume"
                                    ),
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&self) {
        self.spawn_background_loops();
        info!(
            service = %self.config.general.service_name,
            "daemon started"
        );
        let mut shutdown_rx = self.shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("daemon stopped");
    }
}
