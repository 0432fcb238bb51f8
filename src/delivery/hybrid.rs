use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Ack, DeliveryBackend, DeliveryError};
use crate::models::{AgentConnection, DeliveryMethod, Message};

/// Remote delivery with a single direct-injection fallback.
pub struct HybridBackend {
    primary: Arc<dyn DeliveryBackend>,
    fallback: Arc<dyn DeliveryBackend>,
}

impl HybridBackend {
    pub fn new(primary: Arc<dyn DeliveryBackend>, fallback: Arc<dyn DeliveryBackend>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl DeliveryBackend for HybridBackend {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Hybrid
    }

    async fn deliver(
        &self,
        message: &mut Message,
        connection: &AgentConnection,
    ) -> Result<Ack, DeliveryError> {
        let primary = match self.primary.deliver(message, connection).await {
            Ok(ack) => return Ok(ack),
            Err(e) => e,
        };

        warn!(
            "{} delivery of {} to {} failed: {}; falling back to {}",
            self.primary.method(),
            message.id,
            connection.agent_id,
            primary,
            self.fallback.method()
        );

        match self.fallback.deliver(message, connection).await {
            Ok(ack) => {
                debug!("Fallback delivered {} to {}", message.id, connection.agent_id);
                Ok(ack)
            }
            Err(fallback) => Err(DeliveryError::FallbackExhausted {
                primary: Box::new(primary),
                fallback: Box::new(fallback),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::mock_backend::MockBackend;

    fn connection() -> AgentConnection {
        AgentConnection::new("b", "B", "target")
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let remote = Arc::new(MockBackend::new(DeliveryMethod::RemoteProtocol));
        let direct = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let hybrid = HybridBackend::new(remote.clone(), direct.clone());
        let mut message = Message::new("a", "b", "hi");

        let ack = hybrid.deliver(&mut message, &connection()).await.unwrap();
        assert_eq!(ack.method, DeliveryMethod::RemoteProtocol);
        assert_eq!(direct.call_count(), 0);
        assert_eq!(message.attempt_count, 1);
    }

    #[tokio::test]
    async fn falls_back_exactly_once() {
        let remote = Arc::new(MockBackend::failing(
            DeliveryMethod::RemoteProtocol,
            DeliveryError::NotImplemented("remote".into()),
        ));
        let direct = Arc::new(MockBackend::new(DeliveryMethod::DirectInjection));
        let hybrid = HybridBackend::new(remote.clone(), direct.clone());
        let mut message = Message::new("a", "b", "hi");

        let ack = hybrid.deliver(&mut message, &connection()).await.unwrap();
        assert_eq!(ack.method, DeliveryMethod::DirectInjection);
        assert_eq!(remote.call_count(), 1);
        assert_eq!(direct.call_count(), 1);
        assert_eq!(message.attempt_count, 2);
    }

    #[tokio::test]
    async fn both_failures_are_reported() {
        let remote = Arc::new(MockBackend::failing(
            DeliveryMethod::RemoteProtocol,
            DeliveryError::SessionUnavailable("no endpoint".into()),
        ));
        let direct = Arc::new(MockBackend::failing(
            DeliveryMethod::DirectInjection,
            DeliveryError::InputSurfaceNotFound("window".into()),
        ));
        let hybrid = HybridBackend::new(remote.clone(), direct.clone());
        let mut message = Message::new("a", "b", "hi");

        let err = hybrid.deliver(&mut message, &connection()).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::FallbackExhausted {
                primary: Box::new(DeliveryError::SessionUnavailable("no endpoint".into())),
                fallback: Box::new(DeliveryError::InputSurfaceNotFound("window".into())),
            }
        );
        assert_eq!(remote.call_count(), 1);
        assert_eq!(direct.call_count(), 1);
        assert_eq!(message.attempt_count, 2);
    }
}
