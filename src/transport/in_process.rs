use super::traits::{MessageHandler, Transport};
use crate::coordination::Envelope;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
enum Endpoint {
    Handler(Arc<dyn MessageHandler>),
    Mailbox(mpsc::UnboundedSender<Envelope>),
}

/// Same-process transport.
///
/// Endpoints are either handlers, invoked on a spawned task per envelope, or
/// mailboxes drained by whoever holds the receiver (WebSocket peers, tests).
#[derive(Default)]
pub struct InProcessTransport {
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a mailbox to `endpoint`, replacing any previous registration.
    pub fn register_mailbox(&self, endpoint: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .write()
            .insert(endpoint.to_string(), Endpoint::Mailbox(tx));
        tracing::debug!(endpoint, "mailbox registered");
        rx
    }

    /// Drop `endpoint` if it is a mailbox whose receiver is gone.
    ///
    /// A newer registration under the same name is left alone.
    pub fn prune(&self, endpoint: &str) -> bool {
        let mut endpoints = self.endpoints.write();
        let closed = matches!(
            endpoints.get(endpoint),
            Some(Endpoint::Mailbox(tx)) if tx.is_closed()
        );
        if closed {
            endpoints.remove(endpoint);
            tracing::debug!(endpoint, "mailbox pruned");
        }
        closed
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<_> = self.endpoints.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn send_message(&self, envelope: Envelope) -> anyhow::Result<()> {
        let endpoint = self.endpoints.read().get(&envelope.recipient).cloned();
        match endpoint {
            Some(Endpoint::Handler(handler)) => {
                tokio::spawn(async move { handler.on_message(envelope).await });
                Ok(())
            }
            Some(Endpoint::Mailbox(tx)) => {
                let recipient = envelope.recipient.clone();
                if tx.send(envelope).is_err() {
                    self.prune(&recipient);
                    bail!("endpoint `{recipient}` disconnected");
                }
                Ok(())
            }
            None => bail!("no endpoint registered for `{}`", envelope.recipient),
        }
    }

    fn register_handler(&self, endpoint: &str, handler: Arc<dyn MessageHandler>) {
        self.endpoints
            .write()
            .insert(endpoint.to_string(), Endpoint::Handler(handler));
        tracing::debug!(endpoint, "handler registered");
    }

    fn is_reachable(&self, endpoint: &str) -> bool {
        match self.endpoints.read().get(endpoint) {
            Some(Endpoint::Handler(_)) => true,
            Some(Endpoint::Mailbox(tx)) => !tx.is_closed(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MessageType;
    use serde_json::json;
    use tokio::sync::Notify;

    struct Recorder {
        seen: parking_lot::Mutex<Vec<String>>,
        notify: Notify,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, envelope: Envelope) {
            self.seen.lock().push(envelope.id);
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_handler() {
        let transport = InProcessTransport::new();
        let recorder = Arc::new(Recorder {
            seen: parking_lot::Mutex::new(Vec::new()),
            notify: Notify::new(),
        });
        transport.register_handler("router", recorder.clone());

        let envelope = Envelope::new(MessageType::Heartbeat, "s1", "router", json!({}));
        let id = envelope.id.clone();
        transport.send_message(envelope).await.unwrap();
        recorder.notify.notified().await;

        assert_eq!(*recorder.seen.lock(), vec![id]);
    }

    #[tokio::test]
    async fn delivers_to_mailbox() {
        let transport = InProcessTransport::new();
        let mut rx = transport.register_mailbox("s1");
        transport
            .send_message(Envelope::new(MessageType::Heartbeat, "router", "s1", json!({})))
            .await
            .unwrap();
        let received = rx.recv().await.expect("delivered");
        assert_eq!(received.recipient, "s1");
    }

    #[tokio::test]
    async fn unknown_recipient_is_an_error() {
        let transport = InProcessTransport::new();
        let err = transport
            .send_message(Envelope::new(MessageType::Heartbeat, "router", "ghost", json!({})))
            .await
            .expect_err("no endpoint");
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn dropped_mailbox_is_pruned_on_send() {
        let transport = InProcessTransport::new();
        drop(transport.register_mailbox("s1"));
        assert!(!transport.is_reachable("s1"));
        assert!(transport
            .send_message(Envelope::new(MessageType::Heartbeat, "router", "s1", json!({})))
            .await
            .is_err());
        assert!(transport.endpoints().is_empty());
    }

    #[test]
    fn prune_keeps_newer_registration() {
        let transport = InProcessTransport::new();
        drop(transport.register_mailbox("s1"));
        let _live = transport.register_mailbox("s1");
        assert!(!transport.prune("s1"));
        assert_eq!(transport.endpoints(), vec!["s1".to_string()]);
    }
}
