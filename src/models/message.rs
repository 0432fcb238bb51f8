use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Target marker for a message any registered agent may take
pub const BROADCAST_TARGET: &str = "*";

/// Unique identifier for messages
pub type MessageId = String;

/// Unique identifier for agents
pub type AgentId = String;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl MessagePriority {
    pub const ALL: [MessagePriority; 5] = [
        MessagePriority::Low,
        MessagePriority::Normal,
        MessagePriority::High,
        MessagePriority::Urgent,
        MessagePriority::Critical,
    ];

    /// Ordinal tier, 0 for `Low` up to 4 for `Critical`
    pub fn rank(self) -> u8 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Urgent => 3,
            MessagePriority::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
            MessagePriority::Critical => "critical",
        }
    }
}

impl std::str::FromStr for MessagePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown priority: {s}"))
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    DirectInjection,
    RemoteProtocol,
    #[default]
    Hybrid,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMethod::DirectInjection => "direct_injection",
            DeliveryMethod::RemoteProtocol => "remote_protocol",
            DeliveryMethod::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for DeliveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "direct_injection" | "direct" => Ok(DeliveryMethod::DirectInjection),
            "remote_protocol" | "remote" => Ok(DeliveryMethod::RemoteProtocol),
            "hybrid" => Ok(DeliveryMethod::Hybrid),
            other => Err(format!("unknown delivery method: {other}")),
        }
    }
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Queued,
    Dispatched,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub source_agent: AgentId,
    pub target_agent: AgentId,
    pub content: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    #[serde(default)]
    pub urgent: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(
        source_agent: impl Into<AgentId>,
        target_agent: impl Into<AgentId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4().simple()),
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            content: content.into(),
            priority: MessagePriority::default(),
            delivery_method: DeliveryMethod::default(),
            urgent: false,
            created_at: Utc::now(),
            expires_at: None,
            status: MessageStatus::default(),
            attempt_count: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    pub fn with_delivery_method(mut self, method: DeliveryMethod) -> Self {
        self.delivery_method = method;
        self
    }

    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        // An out-of-range TTL means the message never expires.
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_agent == BROADCAST_TARGET
    }

    /// Whether `agent_id` may receive this message. A broadcast never goes
    /// back to its own sender.
    pub fn is_addressed_to(&self, agent_id: &str) -> bool {
        self.target_agent == agent_id || (self.is_broadcast() && self.source_agent != agent_id)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Counts one delivery attempt. Backends call this once per attempt they make.
    pub fn record_attempt(&mut self) {
        self.attempt_count += 1;
    }
}
