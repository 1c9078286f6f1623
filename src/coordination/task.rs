use super::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Lowest (most urgent) and highest accepted priority values.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Payload carried by `TASK_REQUEST` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// 1..=10, lower is more urgent. Unset means the router default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Relative deadline in milliseconds; replaces the router's default timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl TaskRequest {
    /// Create a request with a freshly generated task id.
    pub fn new(task_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            parameters,
            metadata: HashMap::new(),
            priority: None,
            deadline_ms: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check every field and report all problems at once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        errors.require_non_empty("task_id", &self.task_id);
        errors.require_non_empty("task_type", &self.task_type);
        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                errors.push(
                    "priority",
                    format!("must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"),
                );
            }
        }
        if self.deadline_ms == Some(0) {
            errors.push("deadline_ms", "must be greater than 0");
        }
        errors.into_result()
    }
}

/// Terminal state reported for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Completed,
    Failed,
    Timeout,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// HTTP status code used by request/response adapters.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Completed => 200,
            Self::Timeout => 408,
            Self::Cancelled => 499,
            Self::Failed | Self::Unknown => 500,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Completed
    }
}

/// Execution metrics reported alongside a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskMetrics {
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub queue_time_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

/// Payload carried by `TASK_RESPONSE` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub metrics: TaskMetrics,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl TaskResponse {
    pub fn completed(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Completed,
            result: Some(result),
            error_message: None,
            error_code: None,
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error_message: Some(error_message.into()),
            error_code: Some(error_code.into()),
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: TaskMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Decode a response payload and check it answers `expected_task_id`.
    pub fn from_payload(payload: &Value, expected_task_id: &str) -> Result<Self, String> {
        let response: Self = serde_json::from_value(payload.clone())
            .map_err(|e| format!("payload is not a task response: {e}"))?;
        if response.task_id != expected_task_id {
            return Err(format!(
                "response task_id `{}` does not match correlation id `{expected_task_id}`",
                response.task_id
            ));
        }
        Ok(response)
    }
}
