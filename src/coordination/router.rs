use super::envelope::{DeliveryPolicy, Envelope, MessageType, TraceContext};
use super::error::RouterError;
use super::pending::{PendingRequests, PendingTicket, Reply};
use super::registry::{AgentRegistration, SupervisorRecord, SupervisorRegistry};
use super::routes::{RouteTable, SupervisorType};
use super::task::{TaskRequest, TaskResponse, TaskStatus};
use crate::config::{Config, RouterConfig};
use crate::observability::runtime_trace;
use crate::transport::{MessageHandler, Transport};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::Instrument;

#[derive(Default)]
struct RouterCounters {
    routed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    routing_errors: AtomicU64,
    late_responses: AtomicU64,
    heartbeats: AtomicU64,
    dropped_messages: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RouterCounters {
    fn record_settlement(&self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => bump(&self.completed),
            TaskStatus::Timeout => bump(&self.timed_out),
            TaskStatus::Cancelled => bump(&self.cancelled),
            TaskStatus::Failed | TaskStatus::Unknown => bump(&self.failed),
        }
    }

    fn snapshot(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CounterSnapshot {
            tasks_routed: load(&self.routed),
            tasks_completed: load(&self.completed),
            tasks_failed: load(&self.failed),
            tasks_timed_out: load(&self.timed_out),
            tasks_cancelled: load(&self.cancelled),
            routing_errors: load(&self.routing_errors),
            late_responses: load(&self.late_responses),
            heartbeats: load(&self.heartbeats),
            dropped_messages: load(&self.dropped_messages),
        }
    }
}

/// Lifetime counters since the router started.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub tasks_routed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub routing_errors: u64,
    pub late_responses: u64,
    pub heartbeats: u64,
    pub dropped_messages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorUtilization {
    pub id: String,
    pub supervisor_type: String,
    pub is_healthy: bool,
    pub task_count: u32,
    pub max_concurrent_tasks: u32,
    pub utilization: f64,
}

/// Aggregate view returned by [`TaskRouter::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub router: String,
    pub registered_agents: usize,
    pub supervisors: usize,
    pub healthy_supervisors: usize,
    pub pending_tasks: usize,
    pub in_flight: u32,
    pub capacity: u32,
    pub utilization: f64,
    pub counters: CounterSnapshot,
    pub per_supervisor: Vec<SupervisorUtilization>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub registration: Option<AgentRegistration>,
    pub supervisor: Option<SupervisorRecord>,
}

struct RouterInner {
    settings: RouterConfig,
    routes: RouteTable,
    registry: Mutex<SupervisorRegistry>,
    pending: PendingRequests,
    transport: Arc<dyn Transport>,
    counters: RouterCounters,
}

impl RouterInner {
    /// Final step for every pending task, whichever path claimed it.
    ///
    /// The supervisor slot is released before the caller is woken so the
    /// caller never observes its own task still charged.
    fn settle(&self, ticket: PendingTicket, outcome: Reply) {
        let status = match &outcome {
            Ok(response) => response.status,
            Err(err) => err.task_status(),
        };
        if let Some(supervisor) = &ticket.charged_to {
            self.registry.lock().release(supervisor);
        }
        self.counters.record_settlement(status);

        let elapsed_ms = u64::try_from(ticket.elapsed.as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            task_id = %ticket.task_id,
            status = status.as_str(),
            elapsed_ms,
            "task settled"
        );
        runtime_trace::record_event(
            "task_settled",
            Some(&ticket.task_id),
            ticket.charged_to.as_deref(),
            Some(status.is_success()),
            None,
            json!({ "status": status.as_str(), "elapsed_ms": elapsed_ms }),
        );

        if !ticket.resolve(outcome) {
            tracing::debug!("caller stopped waiting before settlement");
        }
    }
}

/// Tier-0 orchestrator: picks a supervisor for each task, dispatches it
/// and correlates the response back to the waiting caller.
///
/// Cloning is cheap; all clones share one registry and pending table.
#[derive(Clone)]
pub struct TaskRouter {
    inner: Arc<RouterInner>,
}

impl TaskRouter {
    /// Build a router and register it on `transport` under `settings.name`.
    pub fn new(
        settings: RouterConfig,
        seeds: Vec<SupervisorRecord>,
        routes: RouteTable,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let router = Self {
            inner: Arc::new(RouterInner {
                settings,
                routes,
                registry: Mutex::new(SupervisorRegistry::with_seeds(seeds)),
                pending: PendingRequests::new(),
                transport,
                counters: RouterCounters::default(),
            }),
        };
        router
            .inner
            .transport
            .register_handler(&router.inner.settings.name, router.handler());
        router
    }

    /// Router with built-in settings and the three default supervisor pools.
    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(
            RouterConfig::default(),
            SupervisorType::ALL
                .into_iter()
                .map(SupervisorRecord::builtin)
                .collect(),
            RouteTable::new(),
            transport,
        )
    }

    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            config.router.clone(),
            config.supervisors.iter().map(|seed| seed.to_record()).collect(),
            RouteTable::from_overrides(config.task_routes.clone()),
            transport,
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    /// Handler that forwards to this router without keeping it alive.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(RouterHandle {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Dispatch `request` to a supervisor and wait for its response.
    ///
    /// `supervisor_type` bypasses task-type resolution. The returned error
    /// is typed; adapters that need a response shape use
    /// [`RouterError::to_task_response`].
    pub async fn route_task(
        &self,
        request: TaskRequest,
        supervisor_type: Option<&str>,
    ) -> Result<TaskResponse, RouterError> {
        let span = tracing::info_span!(
            "route_task",
            task_id = %request.task_id,
            task_type = %request.task_type,
            supervisor = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        let hint = supervisor_type.map(str::to_string);
        async move {
            let result = self.dispatch_task(request, hint).await;
            if let Err(err) = &result {
                tracing::Span::current().record("error", err.error_code());
                tracing::warn!(code = err.error_code(), "task failed: {err}");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch_task(
        &self,
        request: TaskRequest,
        hint: Option<String>,
    ) -> Result<TaskResponse, RouterError> {
        request.validate()?;
        let inner = &self.inner;
        let task_id = request.task_id.clone();

        let target = match hint {
            Some(hint) => hint,
            None => self.resolve_target(&request.task_type)?,
        };
        let payload = serde_json::to_value(&request).map_err(|e| RouterError::Transport {
            task_id: task_id.clone(),
            message: format!("failed to encode task request: {e}"),
        })?;

        let acquired = inner.registry.lock().acquire(&target);
        let Some(supervisor) = acquired else {
            bump(&inner.counters.routing_errors);
            runtime_trace::record_event(
                "routing_error",
                Some(&task_id),
                None,
                Some(false),
                Some("no supervisor available"),
                json!({ "task_type": request.task_type, "supervisor_type": target }),
            );
            return Err(RouterError::NoSupervisorAvailable {
                task_id,
                supervisor_type: target,
            });
        };
        tracing::Span::current().record("supervisor", supervisor.as_str());

        let reply = match inner.pending.insert(&task_id, Some(supervisor.clone())) {
            Ok(reply) => reply,
            Err(err) => {
                inner.registry.lock().release(&supervisor);
                return Err(err);
            }
        };

        let timeout_ms = request
            .deadline_ms
            .unwrap_or(inner.settings.default_timeout_ms);
        let watchdog = Arc::downgrade(&self.inner);
        inner.pending.arm_watchdog(
            &task_id,
            Duration::from_millis(timeout_ms),
            move |ticket| {
                let err = RouterError::Timeout {
                    task_id: ticket.task_id.clone(),
                    timeout_ms,
                };
                match watchdog.upgrade() {
                    Some(inner) => inner.settle(ticket, Err(err)),
                    None => {
                        ticket.resolve(Err(err));
                    }
                }
            },
        );

        let priority = request.priority.unwrap_or(inner.settings.default_priority);
        let trace = TraceContext::new(timeout_ms)
            .with_baggage("task_type", request.task_type.clone())
            .with_baggage("supervisor", supervisor.clone());
        let envelope = Envelope::new(
            MessageType::TaskRequest,
            inner.settings.name.clone(),
            supervisor.clone(),
            payload,
        )
        .with_correlation_id(task_id.clone())
        .with_trace_context(trace)
        .with_delivery(DeliveryPolicy::reliable(
            inner.settings.retry_count,
            inner.settings.retry_delay_ms,
            priority,
        ));

        bump(&inner.counters.routed);
        tracing::info!(timeout_ms, priority, "task dispatched");
        runtime_trace::record_event(
            "task_routed",
            Some(&task_id),
            Some(&supervisor),
            None,
            None,
            json!({ "task_type": request.task_type, "timeout_ms": timeout_ms }),
        );

        if let Err(err) = inner.transport.send_message(envelope).await {
            if let Some(ticket) = inner.pending.take(&task_id) {
                inner.settle(
                    ticket,
                    Err(RouterError::Transport {
                        task_id: task_id.clone(),
                        message: format!("{err:#}"),
                    }),
                );
            }
        }

        match reply.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RouterError::Shutdown { task_id }),
        }
    }

    /// Runtime routes, then the compiled-in table, then registered capabilities.
    fn resolve_target(&self, task_type: &str) -> Result<String, RouterError> {
        if let Some(target) = self.inner.routes.resolve(task_type) {
            return Ok(target);
        }
        let by_capability = self.inner.registry.lock().type_for_capability(task_type);
        by_capability.ok_or_else(|| {
            bump(&self.inner.counters.routing_errors);
            RouterError::UnknownTaskType {
                task_type: task_type.to_string(),
            }
        })
    }

    /// Settle a pending task as cancelled. `false` if it is not in flight.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let _span = tracing::info_span!("cancel_task", task_id).entered();
        let Some(ticket) = self.inner.pending.take(task_id) else {
            tracing::debug!("no pending task to cancel");
            return false;
        };
        self.inner.settle(
            ticket,
            Err(RouterError::Cancelled {
                task_id: task_id.to_string(),
            }),
        );
        tracing::info!("task cancelled");
        true
    }

    /// Store `registration`; supervisors become routable immediately.
    ///
    /// A confirmation is sent to the registrant in the background.
    pub async fn register_agent(
        &self,
        registration: AgentRegistration,
    ) -> Result<AgentRegistration, RouterError> {
        let span = tracing::info_span!(
            "register_agent",
            agent_id = %registration.agent_id,
            agent_type = ?registration.kind,
        );
        async move {
            if let Err(err) = registration.validate() {
                tracing::warn!(
                    violations = err.violations.len(),
                    "agent registration rejected: {err}"
                );
                return Err(RouterError::from(err));
            }

            let record = self.inner.registry.lock().register(
                registration.clone(),
                self.inner.settings.default_max_concurrent_tasks,
            );
            match &record {
                Some(record) => tracing::info!(
                    supervisor_type = %record.supervisor_type,
                    max_concurrent_tasks = record.max_concurrent_tasks,
                    "supervisor registered"
                ),
                None => tracing::info!("agent registered"),
            }
            runtime_trace::record_event(
                "agent_registered",
                None,
                Some(&registration.agent_id),
                Some(true),
                None,
                json!({
                    "type": registration.kind,
                    "capabilities": registration.capabilities,
                }),
            );

            self.spawn_confirmation(&registration.agent_id);
            Ok(registration)
        }
        .instrument(span)
        .await
    }

    fn spawn_confirmation(&self, agent_id: &str) {
        let envelope = Envelope::new(
            MessageType::AgentRegister,
            self.inner.settings.name.clone(),
            agent_id,
            json!({
                "status": "registered",
                "agent_id": agent_id,
                "registered_at": Utc::now().to_rfc3339(),
            }),
        )
        .with_delivery(DeliveryPolicy::notification());
        let transport = Arc::clone(&self.inner.transport);
        tokio::spawn(
            async move {
                if let Err(err) = transport.send_message(envelope).await {
                    tracing::debug!("registration confirmation not delivered: {err:#}");
                }
            }
            .in_current_span(),
        );
    }

    /// Dispatch one inbound envelope by type. Never fails; problems are logged.
    pub async fn handle_message(&self, envelope: Envelope) {
        let span = tracing::info_span!(
            "handle_message",
            message_id = %envelope.id,
            message_type = envelope.message_type.as_str(),
            sender = %envelope.sender,
            correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
        );
        self.dispatch_message(envelope).instrument(span).await;
    }

    async fn dispatch_message(&self, envelope: Envelope) {
        if envelope.is_expired(Utc::now()) {
            bump(&self.inner.counters.dropped_messages);
            tracing::warn!("dropping expired message");
            return;
        }
        if let Err(violations) = envelope.validate() {
            bump(&self.inner.counters.dropped_messages);
            tracing::warn!("dropping invalid message: {violations}");
            return;
        }

        let result = match envelope.message_type {
            MessageType::TaskResponse => {
                self.on_task_response(&envelope);
                Ok(())
            }
            MessageType::Heartbeat => self.on_heartbeat(&envelope).await,
            MessageType::AgentRegister => {
                tracing::debug!("agent update received; nothing to merge");
                Ok(())
            }
            MessageType::TaskRequest | MessageType::Unknown => {
                bump(&self.inner.counters.dropped_messages);
                tracing::warn!("unsupported message type ignored");
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::error!("failed to handle message: {err:#}");
        }
    }

    fn on_task_response(&self, envelope: &Envelope) {
        let Some(task_id) = envelope.correlation_id.as_deref() else {
            bump(&self.inner.counters.dropped_messages);
            tracing::warn!("task response without correlation id dropped");
            return;
        };
        let Some(ticket) = self.inner.pending.take(task_id) else {
            bump(&self.inner.counters.late_responses);
            tracing::warn!(correlation_id = task_id, "response for unknown task");
            runtime_trace::record_event(
                "late_response",
                Some(task_id),
                Some(&envelope.sender),
                None,
                Some("response for unknown task"),
                serde_json::Value::Null,
            );
            return;
        };

        let outcome = TaskResponse::from_payload(&envelope.payload, task_id).map_err(|reason| {
            RouterError::MalformedResponse {
                task_id: task_id.to_string(),
                reason,
            }
        });
        if let Err(err) = &outcome {
            tracing::warn!("{err}");
        }
        self.inner.settle(ticket, outcome);
    }

    async fn on_heartbeat(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let now = Utc::now();
        let known = self
            .inner
            .registry
            .lock()
            .record_heartbeat(&envelope.sender, now);
        if !known {
            tracing::warn!("heartbeat from unknown sender");
            return Ok(());
        }
        bump(&self.inner.counters.heartbeats);
        tracing::debug!("heartbeat recorded");
        runtime_trace::record_event(
            "heartbeat",
            None,
            Some(&envelope.sender),
            Some(true),
            None,
            serde_json::Value::Null,
        );

        let pong = envelope
            .reply(
                MessageType::Heartbeat,
                self.inner.settings.name.clone(),
                json!({ "type": "pong", "timestamp": now.to_rfc3339() }),
            )
            .with_delivery(DeliveryPolicy::pong());
        self.inner
            .transport
            .send_message(pong)
            .await
            .context("failed to send heartbeat pong")
    }

    pub fn get_agent_status(&self, agent_id: &str) -> Result<AgentStatus, RouterError> {
        let registry = self.inner.registry.lock();
        let registration = registry.agent(agent_id).cloned();
        let supervisor = registry.supervisor(agent_id).cloned();
        if registration.is_none() && supervisor.is_none() {
            return Err(RouterError::UnknownAgent {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(AgentStatus {
            agent_id: agent_id.to_string(),
            registration,
            supervisor,
        })
    }

    pub fn get_registered_agents(&self) -> Vec<AgentRegistration> {
        self.inner.registry.lock().agents()
    }

    pub fn get_supervisors(&self) -> Vec<SupervisorRecord> {
        self.inner.registry.lock().supervisors().to_vec()
    }

    pub fn supervisor(&self, id: &str) -> Option<SupervisorRecord> {
        self.inner.registry.lock().supervisor(id).cloned()
    }

    pub fn get_stats(&self) -> RouterStats {
        let registry = self.inner.registry.lock();
        let supervisors = registry.supervisors();
        let in_flight: u32 = supervisors.iter().map(|s| s.task_count).sum();
        let capacity: u32 = supervisors.iter().map(|s| s.max_concurrent_tasks).sum();
        RouterStats {
            router: self.inner.settings.name.clone(),
            registered_agents: registry.agent_count(),
            supervisors: supervisors.len(),
            healthy_supervisors: supervisors.iter().filter(|s| s.is_healthy).count(),
            pending_tasks: self.inner.pending.len(),
            in_flight,
            capacity,
            utilization: if capacity == 0 {
                0.0
            } else {
                f64::from(in_flight) / f64::from(capacity)
            },
            counters: self.inner.counters.snapshot(),
            per_supervisor: supervisors
                .iter()
                .map(|s| SupervisorUtilization {
                    id: s.id.clone(),
                    supervisor_type: s.supervisor_type.clone(),
                    is_healthy: s.is_healthy,
                    task_count: s.task_count,
                    max_concurrent_tasks: s.max_concurrent_tasks,
                    utilization: s.utilization(),
                })
                .collect(),
        }
    }

    /// Effective task-type routes, runtime overrides applied.
    pub fn routes(&self) -> BTreeMap<String, String> {
        self.inner.routes.effective()
    }

    pub fn set_supervisor_health(&self, id: &str, is_healthy: bool) -> bool {
        self.inner.registry.lock().set_health(id, is_healthy)
    }

    /// Mark supervisors silent for longer than `stale_after` unhealthy.
    pub fn mark_stale_supervisors(&self, stale_after: chrono::Duration) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .mark_stale(Utc::now(), stale_after)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.inner.pending.contains(task_id)
    }

    /// Fail every in-flight task with `ROUTER_SHUTDOWN`; returns how many.
    pub fn shutdown(&self) -> usize {
        let tickets = self.inner.pending.drain();
        let count = tickets.len();
        for ticket in tickets {
            let task_id = ticket.task_id.clone();
            self.inner
                .settle(ticket, Err(RouterError::Shutdown { task_id }));
        }
        if count > 0 {
            tracing::info!(count, "pending tasks failed on shutdown");
        }
        count
    }
}

#[async_trait]
impl MessageHandler for TaskRouter {
    async fn on_message(&self, envelope: Envelope) {
        self.handle_message(envelope).await;
    }
}

struct RouterHandle {
    inner: Weak<RouterInner>,
}

#[async_trait]
impl MessageHandler for RouterHandle {
    async fn on_message(&self, envelope: Envelope) {
        match self.inner.upgrade() {
            Some(inner) => TaskRouter { inner }.handle_message(envelope).await,
            None => tracing::debug!(message_id = %envelope.id, "router gone; message discarded"),
        }
    }
}
