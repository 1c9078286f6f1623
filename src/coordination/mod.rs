//! Task routing and supervisor coordination.
//!
//! [`TaskRouter`] is the single coordination point: it resolves a task type to
//! a supervisor pool, charges the least-utilized healthy pool, dispatches a
//! `TASK_REQUEST` envelope over a [`crate::transport::Transport`] and parks the
//! caller on a [`PendingRequests`] entry until a correlated `TASK_RESPONSE`,
//! cancellation or the watchdog settles it.

pub mod envelope;
pub mod error;
pub mod pending;
pub mod registry;
pub mod router;
pub mod routes;
pub mod task;

pub use envelope::{DeliveryGuarantee, DeliveryPolicy, Envelope, MessageType, TraceContext};
pub use error::{FieldViolation, RouterError, ValidationError};
pub use pending::{PendingRequests, PendingTicket, Reply};
pub use registry::{
    AgentKind, AgentRegistration, SupervisorOrigin, SupervisorRecord, SupervisorRegistry,
};
pub use router::{AgentStatus, CounterSnapshot, RouterStats, SupervisorUtilization, TaskRouter};
pub use routes::{KnownTaskType, RouteTable, SupervisorType};
pub use task::{TaskMetrics, TaskRequest, TaskResponse, TaskStatus, MAX_PRIORITY, MIN_PRIORITY};
