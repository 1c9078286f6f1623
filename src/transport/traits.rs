use crate::coordination::Envelope;
use async_trait::async_trait;
use std::sync::Arc;

/// Receiver side of an endpoint.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Consume one delivered envelope. Failures are the handler's to log.
    async fn on_message(&self, envelope: Envelope);
}

/// Core transport trait — delivers envelopes to named endpoints
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Deliver `envelope` to `envelope.recipient`
    async fn send_message(&self, envelope: Envelope) -> anyhow::Result<()>;

    /// Route envelopes addressed to `endpoint` into `handler`, replacing any
    /// previous registration
    fn register_handler(&self, endpoint: &str, handler: Arc<dyn MessageHandler>);

    /// Whether `endpoint` can currently receive messages
    fn is_reachable(&self, _endpoint: &str) -> bool {
        true
    }
}
