use super::error::ValidationError;
use super::task::{MAX_PRIORITY, MIN_PRIORITY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Selects which handler interprets an envelope's payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    Heartbeat,
    AgentRegister,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskRequest => "TASK_REQUEST",
            Self::TaskResponse => "TASK_RESPONSE",
            Self::Heartbeat => "HEARTBEAT",
            Self::AgentRegister => "AGENT_REGISTER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryGuarantee {
    #[default]
    AtLeastOnce,
    AtMostOnce,
}

/// Delivery policy attached to every envelope.
///
/// The router only carries `retry_count`, `retry_delay_ms` and `priority`;
/// enforcing them is up to the transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub guarantee: DeliveryGuarantee,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub require_ack: bool,
    pub priority: u8,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            guarantee: DeliveryGuarantee::AtLeastOnce,
            retry_count: 0,
            retry_delay_ms: 0,
            require_ack: false,
            priority: 5,
        }
    }
}

impl DeliveryPolicy {
    /// Acknowledged, retried delivery used for dispatched tasks.
    pub fn reliable(retry_count: u32, retry_delay_ms: u64, priority: u8) -> Self {
        Self {
            guarantee: DeliveryGuarantee::AtLeastOnce,
            retry_count,
            retry_delay_ms,
            require_ack: true,
            priority,
        }
    }

    /// Best-effort, top-priority delivery used for heartbeat pongs.
    pub fn pong() -> Self {
        Self {
            guarantee: DeliveryGuarantee::AtMostOnce,
            retry_count: 0,
            retry_delay_ms: 0,
            require_ack: false,
            priority: 1,
        }
    }

    /// Unacknowledged notification (registration confirmations).
    pub fn notification() -> Self {
        Self::default()
    }
}

/// Trace identifiers, baggage and deadline propagated with a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub baggage: HashMap<String, String>,
    pub timeout_ms: u64,
}

impl TraceContext {
    /// Start a new trace with the given deadline.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            baggage: HashMap::new(),
            timeout_ms,
        }
    }

    /// Continue this trace in a new span, keeping baggage and deadline.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            baggage: self.baggage.clone(),
            timeout_ms: self.timeout_ms,
        }
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Transport-level message wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub trace_context: TraceContext,
    pub sender: String,
    pub recipient: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub delivery: DeliveryPolicy,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Construct an envelope with a fresh id and trace.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            trace_context: TraceContext::new(0),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            payload,
            delivery: DeliveryPolicy::default(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_trace_context(mut self, trace_context: TraceContext) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Build a reply addressed back to this envelope's sender.
    ///
    /// The reply keeps this envelope's correlation id (the task id on task
    /// traffic), falling back to its message id, and continues its trace.
    pub fn reply(&self, message_type: MessageType, sender: impl Into<String>, payload: Value) -> Self {
        let correlation_id = self
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.id.clone());
        Self::new(message_type, sender, self.sender.clone(), payload)
            .with_correlation_id(correlation_id)
            .with_trace_context(self.trace_context.child())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Validate routing metadata, reporting every violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        errors.require_non_empty("id", &self.id);
        errors.require_non_empty("sender", &self.sender);
        errors.require_non_empty("recipient", &self.recipient);

        if let Some(correlation_id) = &self.correlation_id {
            errors.require_non_empty("correlation_id", correlation_id);
        } else if self.message_type == MessageType::TaskResponse {
            errors.push("correlation_id", "is required on TASK_RESPONSE messages");
        }

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.delivery.priority) {
            errors.push(
                "delivery.priority",
                format!(
                    "must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {}",
                    self.delivery.priority
                ),
            );
        }

        if let Some(expires_at) = self.expires_at {
            if expires_at < self.created_at {
                errors.push("expires_at", "must not precede created_at");
            }
        }

        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn message_type_uses_wire_tags() {
        let encoded = serde_json::to_value(MessageType::TaskResponse).unwrap();
        assert_eq!(encoded, json!("TASK_RESPONSE"));
        let decoded: MessageType = serde_json::from_value(json!("AGENT_DEREGISTER")).unwrap();
        assert_eq!(decoded, MessageType::Unknown);
    }

    #[test]
    fn reply_correlates_and_continues_trace() {
        let request = Envelope::new(
            MessageType::Heartbeat,
            "supervisor-a",
            "router",
            json!({}),
        )
        .with_trace_context(TraceContext::new(500).with_baggage("tenant", "home"));

        let reply = request.reply(MessageType::Heartbeat, "router", json!({"pong": true}));
        assert_eq!(reply.recipient, "supervisor-a");
        assert_eq!(reply.sender, "router");
        assert_eq!(reply.correlation_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(reply.trace_context.trace_id, request.trace_context.trace_id);
        assert_eq!(
            reply.trace_context.parent_span_id.as_deref(),
            Some(request.trace_context.span_id.as_str())
        );
        assert_eq!(reply.trace_context.baggage.get("tenant").map(String::as_str), Some("home"));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn reply_to_task_request_keeps_task_correlation() {
        let request = Envelope::new(MessageType::TaskRequest, "router", "intelligence", json!({}))
            .with_correlation_id("task-9");
        let reply = request.reply(MessageType::TaskResponse, "intelligence", json!({}));
        assert_eq!(reply.correlation_id.as_deref(), Some("task-9"));
        assert_eq!(reply.recipient, "router");
    }

    #[test]
    fn task_response_requires_correlation_id() {
        let envelope = Envelope::new(MessageType::TaskResponse, "worker", "router", json!({}));
        let err = envelope.validate().expect_err("missing correlation id");
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "correlation_id");
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut envelope = Envelope::new(MessageType::TaskRequest, "", "", json!({}))
            .with_delivery(DeliveryPolicy {
                priority: 0,
                ..DeliveryPolicy::default()
            });
        envelope.expires_at = Some(envelope.created_at - Duration::seconds(5));

        let err = envelope.validate().expect_err("invalid envelope");
        let fields: Vec<_> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, ["sender", "recipient", "delivery.priority", "expires_at"]);
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let now = Utc::now();
        let envelope = Envelope::new(MessageType::Heartbeat, "a", "b", Value::Null)
            .with_expires_at(now + Duration::seconds(1));
        assert!(!envelope.is_expired(now));
        assert!(envelope.is_expired(now + Duration::seconds(2)));
    }

    #[test]
    fn pong_policy_is_best_effort() {
        let policy = DeliveryPolicy::pong();
        assert_eq!(policy.guarantee, DeliveryGuarantee::AtMostOnce);
        assert_eq!(policy.priority, 1);
        assert_eq!(policy.retry_count, 0);
        assert!(!policy.require_ack);
    }

    #[test]
    fn json_roundtrip_keeps_envelope_shape() {
        let envelope = Envelope::new(
            MessageType::TaskRequest,
            "router",
            "intelligence",
            json!({"task_id": "t-1"}),
        )
        .with_correlation_id("t-1")
        .with_delivery(DeliveryPolicy::reliable(3, 1000, 5));

        let encoded = serde_json::to_string(&envelope).expect("serialize envelope");
        let decoded: Envelope = serde_json::from_str(&encoded).expect("deserialize envelope");
        assert_eq!(decoded, envelope);
    }
}
