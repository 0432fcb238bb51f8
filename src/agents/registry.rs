use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;

use crate::models::{AgentConnection, AgentId, AgentStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),
}

/// Registry of reachable agents
///
/// The AgentRegistry keeps every registered connection in registration order
/// and indexes them by capability tag. Workers flip agents between `Online`
/// and `Busy` around each delivery; heartbeats and the health sweep manage
/// `Offline`.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    /// Primary storage indexed by agent id
    agents: HashMap<AgentId, AgentConnection>,

    /// Registration order, used for deterministic listings
    order: Vec<AgentId>,

    /// Lowercased capability tag to agent ids
    capability_to_ids: HashMap<String, BTreeSet<AgentId>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update an agent
    ///
    /// Re-registering an id replaces its fields but keeps its position in
    /// registration order. Returns false only for an empty id.
    pub fn register(&mut self, connection: AgentConnection) -> bool {
        if connection.agent_id.trim().is_empty() {
            return false;
        }

        let agent_id = connection.agent_id.clone();
        if self.agents.contains_key(&agent_id) {
            self.unindex(&agent_id);
        } else {
            self.order.push(agent_id.clone());
        }

        for capability in &connection.capabilities {
            self.capability_to_ids
                .entry(capability.to_lowercase())
                .or_default()
                .insert(agent_id.clone());
        }
        self.agents.insert(agent_id, connection);
        true
    }

    fn unindex(&mut self, agent_id: &str) {
        self.capability_to_ids.retain(|_, ids| {
            ids.remove(agent_id);
            !ids.is_empty()
        });
    }

    pub fn deregister(&mut self, agent_id: &str) -> Option<AgentConnection> {
        let removed = self.agents.remove(agent_id)?;
        self.order.retain(|id| id != agent_id);
        self.unindex(agent_id);
        Some(removed)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentConnection> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All agents in registration order
    pub fn all(&self) -> Vec<AgentConnection> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Find agents advertising a capability (case-insensitive)
    pub fn find_by_capability(&self, tag: &str) -> Vec<AgentConnection> {
        let Some(ids) = self.capability_to_ids.get(&tag.to_lowercase()) else {
            return Vec::new();
        };
        self.order
            .iter()
            .filter(|id| ids.contains(*id))
            .filter_map(|id| self.agents.get(id))
            .cloned()
            .collect()
    }

    /// Record a sign of life. An offline agent comes back online.
    pub fn touch(&mut self, agent_id: &str) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.touch();
                if agent.is_offline() {
                    agent.set_status(AgentStatus::Online);
                }
                true
            }
            None => false,
        }
    }

    pub fn set_status(&mut self, agent_id: &str, status: AgentStatus) -> Result<(), RegistryError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
        agent.set_status(status);
        Ok(())
    }

    pub fn mark_offline(&mut self, agent_id: &str) -> Result<(), RegistryError> {
        self.set_status(agent_id, AgentStatus::Offline)
    }

    /// Mark agents silent for longer than `timeout` as offline
    ///
    /// Returns the ids that changed state. Busy agents are skipped since a
    /// delivery to them is in progress.
    pub fn sweep_stale(&mut self, timeout: Duration, now: DateTime<Utc>) -> Vec<AgentId> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for id in &self.order {
            let Some(agent) = self.agents.get_mut(id) else {
                continue;
            };
            if agent.status == AgentStatus::Online && now - agent.last_seen > timeout {
                agent.set_status(AgentStatus::Offline);
                changed.push(id.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryMethod;

    fn agent(id: &str, capabilities: &[&str]) -> AgentConnection {
        AgentConnection::new(id, id.to_uppercase(), format!("win-{id}"))
            .with_capabilities(capabilities.iter().copied())
    }

    #[test]
    fn registry_new_creates_empty_registry() {
        let registry = AgentRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_rejects_empty_id() {
        let mut registry = AgentRegistry::new();
        assert!(!registry.register(agent("", &[])));
        assert!(!registry.register(agent("  ", &[])));
        assert!(registry.is_empty());
    }

    #[test]
    fn register_is_an_idempotent_upsert() {
        let mut registry = AgentRegistry::new();
        assert!(registry.register(agent("a", &["exec"])));
        assert!(registry.register(agent("b", &[])));
        assert!(registry.register(
            agent("a", &["monitor"]).with_delivery_methods(vec![DeliveryMethod::RemoteProtocol])
        ));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert!(registry.find_by_capability("exec").is_empty());
        assert_eq!(registry.find_by_capability("monitor").len(), 1);
        assert_eq!(
            registry.get("a").unwrap().delivery_methods,
            vec![DeliveryMethod::RemoteProtocol]
        );
    }

    #[test]
    fn find_by_capability_is_case_insensitive() {
        let mut registry = AgentRegistry::new();
        registry.register(agent("a", &["EXEC"]));
        registry.register(agent("b", &["exec", "monitor"]));
        registry.register(agent("c", &["monitor"]));

        let exec: Vec<_> = registry
            .find_by_capability("Exec")
            .into_iter()
            .map(|a| a.agent_id)
            .collect();
        assert_eq!(exec, vec!["a", "b"]);
        assert!(registry.find_by_capability("review").is_empty());
    }

    #[test]
    fn deregister_cleans_up_lookups() {
        let mut registry = AgentRegistry::new();
        registry.register(agent("a", &["exec"]));

        let removed = registry.deregister("a").unwrap();
        assert_eq!(removed.agent_id, "a");
        assert!(!registry.contains("a"));
        assert!(registry.find_by_capability("exec").is_empty());
        assert!(registry.all().is_empty());
        assert!(registry.deregister("a").is_none());
    }

    #[test]
    fn touch_brings_offline_agent_back() {
        let mut registry = AgentRegistry::new();
        registry.register(agent("a", &[]));
        registry.mark_offline("a").unwrap();

        assert!(registry.touch("a"));
        assert_eq!(registry.get("a").unwrap().status, AgentStatus::Online);
        assert!(!registry.touch("missing"));
    }

    #[test]
    fn set_status_on_unknown_agent_fails() {
        let mut registry = AgentRegistry::new();
        assert_eq!(
            registry.set_status("ghost", AgentStatus::Busy),
            Err(RegistryError::AgentNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn sweep_stale_marks_silent_agents_offline() {
        let mut registry = AgentRegistry::new();
        let now = Utc::now();
        let mut silent = agent("silent", &[]);
        silent.last_seen = now - chrono::Duration::seconds(600);
        let mut busy = agent("busy", &[]);
        busy.last_seen = now - chrono::Duration::seconds(600);
        busy.status = AgentStatus::Busy;
        registry.register(silent);
        registry.register(busy);
        registry.register(agent("fresh", &[]));

        let changed = registry.sweep_stale(Duration::from_secs(300), now);
        assert_eq!(changed, vec!["silent"]);
        assert!(registry.get("silent").unwrap().is_offline());
        assert_eq!(registry.get("busy").unwrap().status, AgentStatus::Busy);
        assert_eq!(registry.get("fresh").unwrap().status, AgentStatus::Online);

        assert!(registry.sweep_stale(Duration::from_secs(300), now).is_empty());
    }
}
