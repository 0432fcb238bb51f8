mod agent;
mod message;

pub use agent::{AgentConnection, AgentStatus};
pub use message::{
    AgentId, DeliveryMethod, Message, MessageId, MessagePriority, MessageStatus, BROADCAST_TARGET,
};
