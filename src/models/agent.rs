use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::message::{AgentId, DeliveryMethod};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Online,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConnection {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub delivery_methods: Vec<DeliveryMethod>,
    pub target_ref: String,
    pub last_seen: DateTime<Utc>,
}

impl AgentConnection {
    pub fn new(agent_id: impl Into<AgentId>, name: impl Into<String>, target_ref: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            status: AgentStatus::default(),
            capabilities: BTreeSet::new(),
            delivery_methods: Vec::new(),
            target_ref: target_ref.into(),
            last_seen: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delivery_methods(mut self, methods: Vec<DeliveryMethod>) -> Self {
        self.delivery_methods = methods;
        self
    }

    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.status, AgentStatus::Offline)
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }

    /// Whether this agent can be reached with `method`.
    ///
    /// An empty preference list accepts every method. Hybrid is accepted when
    /// listed explicitly or when both underlying methods are listed.
    pub fn supports(&self, method: DeliveryMethod) -> bool {
        if self.delivery_methods.is_empty() || self.delivery_methods.contains(&method) {
            return true;
        }
        method == DeliveryMethod::Hybrid
            && self.delivery_methods.contains(&DeliveryMethod::DirectInjection)
            && self.delivery_methods.contains(&DeliveryMethod::RemoteProtocol)
    }

    pub fn preferred_method(&self) -> Option<DeliveryMethod> {
        self.delivery_methods.first().copied()
    }
}
