use super::task::{TaskMetrics, TaskResponse, TaskStatus};
use std::fmt;
use thiserror::Error;

/// A single failed check produced while validating a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.field, self.message)
    }
}

/// Aggregate validation failure listing every violated rule.
#[derive(Debug, Error, Clone, PartialEq, Eq, Default)]
#[error("{} validation error(s): {}", .violations.len(), join_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(FieldViolation::new(field, message));
    }

    /// Record a violation when `value` is blank.
    pub fn require_non_empty(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "must not be empty");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// `Ok(())` when nothing was collected, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the task router and its request/response helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no available supervisor of type `{supervisor_type}` for task `{task_id}`")]
    NoSupervisorAvailable {
        task_id: String,
        supervisor_type: String,
    },
    #[error("no supervisor mapping for task type `{task_type}`")]
    UnknownTaskType { task_type: String },
    #[error("Task timeout after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },
    #[error("task `{task_id}` was cancelled")]
    Cancelled { task_id: String },
    #[error("failed to deliver task `{task_id}`: {message}")]
    Transport { task_id: String, message: String },
    #[error("task `{task_id}` is already in flight")]
    DuplicateTask { task_id: String },
    #[error("malformed response for task `{task_id}`: {reason}")]
    MalformedResponse { task_id: String, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("agent `{agent_id}` is not registered")]
    UnknownAgent { agent_id: String },
    #[error("router shut down before task `{task_id}` settled")]
    Shutdown { task_id: String },
}

impl RouterError {
    /// Stable machine-readable code carried on failed task responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoSupervisorAvailable { .. } => "ROUTING_ERROR",
            Self::UnknownTaskType { .. } => "UNKNOWN_TASK_TYPE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::DuplicateTask { .. } => "DUPLICATE_TASK",
            Self::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::UnknownAgent { .. } => "UNKNOWN_AGENT",
            Self::Shutdown { .. } => "ROUTER_SHUTDOWN",
        }
    }

    pub fn is_routing_error(&self) -> bool {
        matches!(self, Self::NoSupervisorAvailable { .. })
    }

    /// Status a caller-facing adapter should report for this failure.
    ///
    /// The local watchdog maps onto `Timeout` and explicit cancellation onto
    /// `Cancelled`, so adapters answer the same way whether the condition was
    /// detected here or reported by a remote supervisor.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Timeout { .. } => TaskStatus::Timeout,
            Self::Cancelled { .. } => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }

    /// Normalise this error into a failed `TaskResponse` for `task_id`.
    pub fn to_task_response(&self, task_id: &str) -> TaskResponse {
        TaskResponse {
            task_id: task_id.to_string(),
            status: self.task_status(),
            result: None,
            error_message: Some(self.to_string()),
            error_code: Some(self.error_code().to_string()),
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let mut errors = ValidationError::new();
        errors.require_non_empty("agent_id", "");
        errors.require_non_empty("name", "  ");
        errors.require_non_empty("version", "1.0");
        errors.push("capabilities", "must contain at least one entry");

        let err = errors.into_result().expect_err("three violations collected");
        assert_eq!(err.violations.len(), 3);
        let rendered = err.to_string();
        assert!(rendered.starts_with("3 validation error(s)"));
        assert!(rendered.contains("`agent_id` must not be empty"));
        assert!(rendered.contains("`name` must not be empty"));
        assert!(rendered.contains("`capabilities` must contain at least one entry"));

        let wrapped = anyhow::Error::from(err);
        assert!(wrapped.to_string().contains("`agent_id` must not be empty; `name`"));
    }

    #[test]
    fn empty_validation_error_is_ok() {
        assert!(ValidationError::new().into_result().is_ok());
    }

    #[test]
    fn timeout_message_matches_watchdog_format() {
        let err = RouterError::Timeout {
            task_id: "t-1".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Task timeout after 250ms");
        assert_eq!(err.error_code(), "TIMEOUT");
    }

    #[test]
    fn routing_error_becomes_failed_response() {
        let err = RouterError::NoSupervisorAvailable {
            task_id: "t-9".into(),
            supervisor_type: "intelligence".into(),
        };
        assert!(err.is_routing_error());

        let response = err.to_task_response("t-9");
        assert_eq!(response.status, TaskStatus::Failed);
        assert_eq!(response.error_code.as_deref(), Some("ROUTING_ERROR"));
        assert_eq!(response.task_id, "t-9");
        assert!(response.result.is_none());
    }

    #[test]
    fn local_timeout_normalises_to_timeout_status() {
        let response = RouterError::Timeout {
            task_id: "t-2".into(),
            timeout_ms: 10,
        }
        .to_task_response("t-2");
        assert_eq!(response.status, TaskStatus::Timeout);
        assert_eq!(response.status.http_status(), 408);
    }
}
