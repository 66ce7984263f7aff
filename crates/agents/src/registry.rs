//! Maps `agent_type` strings to agent implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Agent;

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the agent for `agent_type`.
    pub fn register(&mut self, agent_type: impl Into<String>, agent: Arc<dyn Agent>) -> &mut Self {
        self.agents.insert(agent_type.into(), agent);
        self
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_type).cloned()
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.agents.contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.agents.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry").field("agents", &self.agent_types()).finish()
    }
}
