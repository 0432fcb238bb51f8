//! Delivery backends: one attempt to place a message into an agent's input.
//!
//! The set of backends is closed. `DirectInjectionBackend` drives OS-level
//! input, `RemoteDebugBackend` evaluates a script over a debugging session,
//! and `HybridBackend` tries remote first with a single direct fallback.

mod cdp;
mod hybrid;
mod injection;
mod remote;
mod tmux;

pub use cdp::CdpSessionProvider;
pub use hybrid::HybridBackend;
pub use injection::{DirectInjectionBackend, InputDriver, SurfaceHeuristics, UiElement, WindowHandle};
pub use remote::{DebugSession, DebugSessionProvider, DebugTarget, RemoteDebugBackend};
pub use tmux::TmuxInputDriver;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::models::{AgentConnection, DeliveryMethod, Message};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("No input surface found in {0}")]
    InputSurfaceNotFound(String),

    #[error("Remote session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Input driver error: {0}")]
    Driver(String),

    #[error("Remote delivery failed ({primary}); direct fallback failed ({fallback})")]
    FallbackExhausted {
        primary: Box<DeliveryError>,
        fallback: Box<DeliveryError>,
    },
}

/// Successful delivery receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub method: DeliveryMethod,
    pub detail: String,
}

impl Ack {
    pub fn new(method: DeliveryMethod, detail: impl Into<String>) -> Self {
        Self {
            method,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    fn method(&self) -> DeliveryMethod;

    /// Make one delivery attempt, counting it on `message.attempt_count`.
    async fn deliver(
        &self,
        message: &mut Message,
        connection: &AgentConnection,
    ) -> Result<Ack, DeliveryError>;
}

/// Picks the backend for a (message, connection) pair.
pub struct DeliveryRouter {
    direct: Arc<dyn DeliveryBackend>,
    remote: Arc<dyn DeliveryBackend>,
    hybrid: HybridBackend,
}

impl DeliveryRouter {
    pub fn new(direct: Arc<dyn DeliveryBackend>, remote: Arc<dyn DeliveryBackend>) -> Self {
        let hybrid = HybridBackend::new(Arc::clone(&remote), Arc::clone(&direct));
        Self {
            direct,
            remote,
            hybrid,
        }
    }

    /// Router over tmux injection and a DevTools endpoint, as configured.
    pub fn from_config(config: &Config) -> Result<Self, regex::Error> {
        let heuristics = SurfaceHeuristics::from_config(&config.injection)?;
        let direct = DirectInjectionBackend::new(
            TmuxInputDriver::new(config.injection.tmux_binary.clone()),
            heuristics.clone(),
        );
        let remote = RemoteDebugBackend::new(
            CdpSessionProvider::new(
                config.remote_debug.endpoint.clone(),
                config.remote_debug.request_timeout(),
            ),
            heuristics,
        )
        .with_close_timeout(config.remote_debug.request_timeout());
        Ok(Self::new(Arc::new(direct), Arc::new(remote)))
    }

    /// The message's method when the connection supports it, else the
    /// connection's first preference, else the message's method.
    pub fn resolve_method(message: &Message, connection: &AgentConnection) -> DeliveryMethod {
        if connection.supports(message.delivery_method) {
            message.delivery_method
        } else {
            connection
                .preferred_method()
                .unwrap_or(message.delivery_method)
        }
    }

    pub fn backend(&self, method: DeliveryMethod) -> &dyn DeliveryBackend {
        match method {
            DeliveryMethod::DirectInjection => self.direct.as_ref(),
            DeliveryMethod::RemoteProtocol => self.remote.as_ref(),
            DeliveryMethod::Hybrid => &self.hybrid,
        }
    }

    pub async fn deliver(
        &self,
        message: &mut Message,
        connection: &AgentConnection,
    ) -> Result<Ack, DeliveryError> {
        let method = Self::resolve_method(message, connection);
        self.backend(method).deliver(message, connection).await
    }
}


#[cfg(test)]
mod tests {
    use super::mock_backend::MockBackend;
    use super::*;

    fn router() -> (Arc<MockBackend>, Arc<MockBackend>, DeliveryRouter) {
        let direct = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let remote = Arc::new(MockBackend::new(DeliveryMethod::RemoteProtocol));
        let router = DeliveryRouter::new(direct.clone(), remote.clone());
        (direct, remote, router)
    }

    #[test]
    fn resolve_method_prefers_message_method_when_supported() {
        let message = Message::new("a", "b", "x").with_delivery_method(DeliveryMethod::RemoteProtocol);
        let open = AgentConnection::new("b", "B", "t");
        assert_eq!(
            DeliveryRouter::resolve_method(&message, &open),
            DeliveryMethod::RemoteProtocol
        );
    }

    #[test]
    fn resolve_method_falls_back_to_connection_preference() {
        let message = Message::new("a", "b", "x");
        let direct_only = AgentConnection::new("b", "B", "t")
            .with_delivery_methods(vec![DeliveryMethod::DirectInjection]);
        assert_eq!(
            DeliveryRouter::resolve_method(&message, &direct_only),
            DeliveryMethod::DirectInjection
        );
    }

    #[tokio::test]
    async fn router_dispatches_to_resolved_backend() {
        let (direct, remote, router) = router();
        let connection = AgentConnection::new("b", "B", "t")
            .with_delivery_methods(vec![DeliveryMethod::DirectInjection]);
        let mut message = Message::new("a", "b", "x").with_delivery_method(DeliveryMethod::RemoteProtocol);

        let ack = router.deliver(&mut message, &connection).await.unwrap();
        assert_eq!(ack.method, DeliveryMethod::DirectInjection);
        assert_eq!(direct.call_count(), 1);
        assert_eq!(remote.call_count(), 0);
    }

    #[test]
    fn fallback_error_names_both_causes() {
        let error = DeliveryError::FallbackExhausted {
            primary: Box::new(DeliveryError::SessionUnavailable("no endpoint".into())),
            fallback: Box::new(DeliveryError::TargetNotFound("win".into())),
        };
        let text = error.to_string();
        assert!(text.contains("no endpoint"));
        assert!(text.contains("win"));
    }
}
