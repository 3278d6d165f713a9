use dashmap::DashMap;
use uuid::Uuid;

use fm_core::types::AgentProfile;

/// Lookup of agent profiles by id. Backed by real storage in production;
/// the in-memory implementation serves tests and embedded setups.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get(&self, agent_id: Uuid) -> Option<AgentProfile>;
}

#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: DashMap<Uuid, AgentProfile>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: AgentProfile) {
        self.agents.insert(profile.id, profile);
    }
}

#[async_trait::async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn get(&self, agent_id: Uuid) -> Option<AgentProfile> {
        self.agents.get(&agent_id).map(|p| p.clone())
    }
}
