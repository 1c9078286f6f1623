use super::traits::{MessageHandler, Transport};
use crate::coordination::{
    DeliveryPolicy, Envelope, MessageType, PendingRequests, RouterError, TaskRequest,
    TaskResponse, TraceContext,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Direct request/response over a transport, without supervisor selection.
///
/// The client owns an endpoint on the transport; responses addressed to it
/// are correlated by task id exactly like the router does.
pub struct TaskClient {
    endpoint: String,
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
}

impl TaskClient {
    /// Bind a client to `endpoint`, registering its response inbox.
    pub fn bind(transport: Arc<dyn Transport>, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let pending = PendingRequests::new();
        transport.register_handler(
            &endpoint,
            Arc::new(ClientInbox {
                pending: pending.clone(),
            }),
        );
        Self {
            endpoint,
            transport,
            pending,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `request` to `recipient` and wait up to `timeout_ms` for its response.
    pub async fn send_task_request(
        &self,
        request: TaskRequest,
        recipient: &str,
        timeout_ms: u64,
    ) -> Result<TaskResponse, RouterError> {
        request.validate()?;
        let task_id = request.task_id.clone();
        let payload = serde_json::to_value(&request).map_err(|e| RouterError::Transport {
            task_id: task_id.clone(),
            message: format!("failed to encode task request: {e}"),
        })?;

        let reply = self.pending.insert(&task_id, None)?;
        self.pending
            .arm_watchdog(&task_id, Duration::from_millis(timeout_ms), move |ticket| {
                let task_id = ticket.task_id.clone();
                ticket.resolve(Err(RouterError::Timeout {
                    task_id,
                    timeout_ms,
                }));
            });

        let envelope = Envelope::new(
            MessageType::TaskRequest,
            self.endpoint.clone(),
            recipient,
            payload,
        )
        .with_correlation_id(task_id.clone())
        .with_trace_context(TraceContext::new(timeout_ms))
        .with_delivery(DeliveryPolicy::reliable(
            0,
            0,
            request.priority.unwrap_or(5),
        ));

        if let Err(err) = self.transport.send_message(envelope).await {
            if let Some(ticket) = self.pending.take(&task_id) {
                ticket.resolve(Err(RouterError::Transport {
                    task_id: task_id.clone(),
                    message: format!("{err:#}"),
                }));
            }
        }

        match reply.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RouterError::Shutdown { task_id }),
        }
    }
}

struct ClientInbox {
    pending: PendingRequests,
}

#[async_trait]
impl MessageHandler for ClientInbox {
    async fn on_message(&self, envelope: Envelope) {
        if envelope.message_type != MessageType::TaskResponse {
            tracing::debug!(
                message_type = envelope.message_type.as_str(),
                "client inbox ignored message"
            );
            return;
        }
        let Some(task_id) = envelope.correlation_id.as_deref() else {
            tracing::warn!(message_id = %envelope.id, "task response without correlation id dropped");
            return;
        };
        let Some(ticket) = self.pending.take(task_id) else {
            tracing::warn!(correlation_id = task_id, "response for unknown task");
            return;
        };
        let outcome = TaskResponse::from_payload(&envelope.payload, task_id).map_err(|reason| {
            RouterError::MalformedResponse {
                task_id: task_id.to_string(),
                reason,
            }
        });
        ticket.resolve(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;
    use serde_json::json;

    #[tokio::test]
    async fn request_response_roundtrip() {
        let transport = Arc::new(InProcessTransport::new());
        let mut worker = transport.register_mailbox("worker");
        let client = TaskClient::bind(transport.clone(), "cli");

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let request = worker.recv().await.expect("request delivered");
                let task_id = request.correlation_id.clone().unwrap();
                let response = TaskResponse::completed(task_id, json!({"echo": request.payload["parameters"]}));
                let reply = Envelope::new(
                    MessageType::TaskResponse,
                    "worker",
                    request.sender.clone(),
                    serde_json::to_value(response).unwrap(),
                )
                .with_correlation_id(request.correlation_id.clone().unwrap());
                transport.send_message(reply).await.unwrap();
            })
        };

        let response = client
            .send_task_request(TaskRequest::new("echo", json!({"n": 1})), "worker", 1_000)
            .await
            .expect("response");
        responder.await.unwrap();
        assert_eq!(response.result, Some(json!({"echo": {"n": 1}})));
    }

    #[tokio::test]
    async fn silent_recipient_times_out() {
        let transport = Arc::new(InProcessTransport::new());
        let _worker = transport.register_mailbox("worker");
        let client = TaskClient::bind(transport, "cli");

        let err = client
            .send_task_request(TaskRequest::new("echo", json!({})), "worker", 25)
            .await
            .expect_err("no reply");
        assert_eq!(err.to_string(), "Task timeout after 25ms");
    }

    #[tokio::test]
    async fn unreachable_recipient_fails_immediately() {
        let transport = Arc::new(InProcessTransport::new());
        let client = TaskClient::bind(transport, "cli");

        let err = client
            .send_task_request(TaskRequest::new("echo", json!({})), "nobody", 5_000)
            .await
            .expect_err("unreachable");
        assert_eq!(err.error_code(), "TRANSPORT_ERROR");
    }
}
