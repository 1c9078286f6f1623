use super::error::ValidationError;
use super::routes::SupervisorType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Role an agent plays once registered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    Supervisor,
    Agent,
    Service,
}

/// Payload of an agent registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Pool this supervisor serves; defaults to `agent_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<u32>,
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".into()
}

fn default_true() -> bool {
    true
}

impl AgentRegistration {
    pub fn supervisor(
        agent_id: impl Into<String>,
        supervisor_type: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            kind: AgentKind::Supervisor,
            version: default_version(),
            capabilities,
            supervisor_type: Some(supervisor_type.into()),
            max_concurrent_tasks: None,
            is_healthy: true,
            metadata: HashMap::new(),
        }
    }

    pub fn agent(agent_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            kind: AgentKind::Agent,
            version: default_version(),
            capabilities,
            supervisor_type: None,
            max_concurrent_tasks: None,
            is_healthy: true,
            metadata: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    pub fn with_health(mut self, is_healthy: bool) -> Self {
        self.is_healthy = is_healthy;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        errors.require_non_empty("agent_id", &self.agent_id);
        errors.require_non_empty("name", &self.name);
        errors.require_non_empty("version", &self.version);
        for (i, capability) in self.capabilities.iter().enumerate() {
            if capability.trim().is_empty() {
                errors.push(format!("capabilities[{i}]"), "must not be empty");
            }
        }
        if let Some(supervisor_type) = &self.supervisor_type {
            errors.require_non_empty("supervisor_type", supervisor_type);
        }
        if self.max_concurrent_tasks == Some(0) {
            errors.push("max_concurrent_tasks", "must be greater than 0");
        }
        if self.kind != AgentKind::Supervisor
            && (self.supervisor_type.is_some() || self.max_concurrent_tasks.is_some())
        {
            errors.push(
                "type",
                "supervisor_type and max_concurrent_tasks require type SUPERVISOR",
            );
        }
        errors.into_result()
    }
}

/// How a supervisor record came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorOrigin {
    Seed,
    Registered,
}

/// Live state for one supervisor pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorRecord {
    pub id: String,
    pub name: String,
    pub supervisor_type: String,
    pub capabilities: Vec<String>,
    pub is_healthy: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeats_received: u64,
    pub task_count: u32,
    pub max_concurrent_tasks: u32,
    pub origin: SupervisorOrigin,
}

impl SupervisorRecord {
    pub fn seed(
        id: impl Into<String>,
        name: impl Into<String>,
        supervisor_type: impl Into<String>,
        capabilities: Vec<String>,
        max_concurrent_tasks: u32,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            supervisor_type: supervisor_type.into(),
            capabilities,
            is_healthy: true,
            last_heartbeat: Utc::now(),
            heartbeats_received: 0,
            task_count: 0,
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            origin: SupervisorOrigin::Seed,
        }
    }

    pub fn builtin(kind: SupervisorType) -> Self {
        Self::seed(
            kind.as_str(),
            kind.display_name(),
            kind.as_str(),
            kind.default_capabilities(),
            kind.default_capacity(),
        )
    }

    fn from_registration(registration: &AgentRegistration, default_capacity: u32) -> Self {
        Self {
            id: registration.agent_id.clone(),
            name: registration.name.clone(),
            supervisor_type: registration
                .supervisor_type
                .clone()
                .unwrap_or_else(|| registration.agent_id.clone()),
            capabilities: registration.capabilities.clone(),
            is_healthy: registration.is_healthy,
            last_heartbeat: Utc::now(),
            heartbeats_received: 0,
            task_count: 0,
            max_concurrent_tasks: registration
                .max_concurrent_tasks
                .unwrap_or(default_capacity)
                .max(1),
            origin: SupervisorOrigin::Registered,
        }
    }

    /// Whether this pool answers to `target` by type, id or name.
    pub fn matches(&self, target: &str) -> bool {
        self.supervisor_type.eq_ignore_ascii_case(target)
            || self.id == target
            || self.name.eq_ignore_ascii_case(target)
    }

    pub fn serves(&self, task_type: &str) -> bool {
        self.capabilities.iter().any(|c| c == task_type)
    }

    pub fn has_capacity(&self) -> bool {
        self.task_count < self.max_concurrent_tasks
    }

    pub fn is_available(&self) -> bool {
        self.is_healthy && self.has_capacity()
    }

    pub fn utilization(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        f64::from(self.task_count) / f64::from(self.max_concurrent_tasks)
    }

    fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.origin == SupervisorOrigin::Seed && self.heartbeats_received == 0 {
            return false;
        }
        now - self.last_heartbeat > stale_after
    }
}

/// Registered agents plus supervisor pools, kept in insertion order so
/// utilization ties resolve to the earliest registered pool.
#[derive(Debug, Clone, Default)]
pub struct SupervisorRegistry {
    agents: HashMap<String, AgentRegistration>,
    supervisors: Vec<SupervisorRecord>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seeds(seeds: impl IntoIterator<Item = SupervisorRecord>) -> Self {
        let mut registry = Self::new();
        for seed in seeds {
            registry.upsert_supervisor(seed);
        }
        registry
    }

    /// Insert or replace a supervisor, keeping its live `task_count`.
    pub fn upsert_supervisor(&mut self, mut record: SupervisorRecord) {
        if let Some(existing) = self.supervisors.iter_mut().find(|s| s.id == record.id) {
            record.task_count = existing.task_count;
            record.heartbeats_received = existing.heartbeats_received;
            *existing = record;
        } else {
            self.supervisors.push(record);
        }
    }

    /// Store a registration; supervisors also get a pool record.
    pub fn register(
        &mut self,
        registration: AgentRegistration,
        default_capacity: u32,
    ) -> Option<SupervisorRecord> {
        let record = (registration.kind == AgentKind::Supervisor)
            .then(|| SupervisorRecord::from_registration(&registration, default_capacity));
        self.agents
            .insert(registration.agent_id.clone(), registration);
        let record = record?;
        let id = record.id.clone();
        self.upsert_supervisor(record);
        self.supervisor(&id).cloned()
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentRegistration> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> Vec<AgentRegistration> {
        let mut agents: Vec<_> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn supervisor(&self, id: &str) -> Option<&SupervisorRecord> {
        self.supervisors.iter().find(|s| s.id == id)
    }

    pub fn supervisors(&self) -> &[SupervisorRecord] {
        &self.supervisors
    }

    /// Supervisor type of the first pool that lists `task_type` as a capability.
    pub fn type_for_capability(&self, task_type: &str) -> Option<String> {
        self.supervisors
            .iter()
            .find(|s| s.serves(task_type))
            .map(|s| s.supervisor_type.clone())
    }

    /// Least-utilized available pool matching `target`.
    pub fn select(&self, target: &str) -> Option<&SupervisorRecord> {
        let mut best: Option<&SupervisorRecord> = None;
        for candidate in self
            .supervisors
            .iter()
            .filter(|s| s.matches(target) && s.is_available())
        {
            match best {
                Some(current) if current.utilization() <= candidate.utilization() => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    /// Select a pool for `target` and charge one task to it.
    pub fn acquire(&mut self, target: &str) -> Option<String> {
        let id = self.select(target)?.id.clone();
        let record = self.supervisors.iter_mut().find(|s| s.id == id)?;
        record.task_count += 1;
        Some(id)
    }

    /// Return one task slot to `id`. `false` when nothing was charged.
    pub fn release(&mut self, id: &str) -> bool {
        match self.supervisors.iter_mut().find(|s| s.id == id) {
            Some(record) if record.task_count > 0 => {
                record.task_count -= 1;
                true
            }
            Some(_) => {
                tracing::warn!(supervisor = id, "release on idle supervisor ignored");
                false
            }
            None => false,
        }
    }

    /// Record a heartbeat from `sender`. `false` when the sender is unknown.
    pub fn record_heartbeat(&mut self, sender: &str, now: DateTime<Utc>) -> bool {
        let mut known = false;
        if let Some(record) = self.supervisors.iter_mut().find(|s| s.id == sender) {
            record.last_heartbeat = now;
            record.heartbeats_received += 1;
            record.is_healthy = true;
            known = true;
        }
        if let Some(agent) = self.agents.get_mut(sender) {
            agent.is_healthy = true;
            known = true;
        }
        known
    }

    pub fn set_health(&mut self, id: &str, is_healthy: bool) -> bool {
        match self.supervisors.iter_mut().find(|s| s.id == id) {
            Some(record) => {
                record.is_healthy = is_healthy;
                true
            }
            None => false,
        }
    }

    /// Mark healthy pools without a recent heartbeat unhealthy; returns their ids.
    pub fn mark_stale(&mut self, now: DateTime<Utc>, stale_after: Duration) -> Vec<String> {
        let mut stale = Vec::new();
        for record in &mut self.supervisors {
            if record.is_healthy && record.is_stale(now, stale_after) {
                record.is_healthy = false;
                stale.push(record.id.clone());
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: &str, kind: &str, busy: u32, max: u32) -> SupervisorRecord {
        let mut record = SupervisorRecord::seed(id, id, kind, vec!["x.y.z".into()], max);
        record.task_count = busy;
        record
    }

    #[test]
    fn selects_least_utilized_pool() {
        let registry = SupervisorRegistry::with_seeds([
            pool("b", "intel", 8, 10),
            pool("a", "intel", 2, 10),
        ]);
        assert_eq!(registry.select("intel").map(|s| s.id.as_str()), Some("a"));
    }

    #[test]
    fn utilization_ties_keep_registration_order() {
        let registry = SupervisorRegistry::with_seeds([
            pool("first", "intel", 1, 4),
            pool("second", "intel", 2, 8),
        ]);
        assert_eq!(
            registry.select("intel").map(|s| s.id.as_str()),
            Some("first")
        );
    }

    #[test]
    fn unhealthy_and_full_pools_are_skipped() {
        let mut registry = SupervisorRegistry::with_seeds([
            pool("full", "intel", 3, 3),
            pool("sick", "intel", 0, 3),
        ]);
        registry.set_health("sick", false);
        assert!(registry.select("intel").is_none());
        assert!(registry.acquire("intel").is_none());
    }

    #[test]
    fn acquire_and_release_balance() {
        let mut registry = SupervisorRegistry::with_seeds([pool("s1", "intel", 0, 2)]);
        assert_eq!(registry.acquire("intel").as_deref(), Some("s1"));
        assert_eq!(registry.acquire("s1").as_deref(), Some("s1"));
        assert!(registry.acquire("intel").is_none());
        assert!(registry.release("s1"));
        assert!(registry.release("s1"));
        assert!(!registry.release("s1"));
        assert_eq!(registry.supervisor("s1").unwrap().task_count, 0);
    }

    #[test]
    fn reregistration_overwrites_fields_but_keeps_load() {
        let mut registry = SupervisorRegistry::new();
        let first = AgentRegistration::supervisor("s1", "intel", vec!["a.b.c".into()])
            .with_max_concurrent_tasks(2);
        registry.register(first, 10);
        registry.acquire("intel");

        let second = AgentRegistration::supervisor("s1", "intel", vec!["d.e.f".into()])
            .with_name("Renamed")
            .with_max_concurrent_tasks(4);
        let record = registry.register(second, 10).expect("supervisor record");

        assert_eq!(registry.supervisors().len(), 1);
        assert_eq!(registry.agent_count(), 1);
        assert_eq!(record.name, "Renamed");
        assert_eq!(record.max_concurrent_tasks, 4);
        assert_eq!(record.capabilities, vec!["d.e.f".to_string()]);
        assert_eq!(record.task_count, 1);
    }

    #[test]
    fn registration_capacity_defaults() {
        let mut registry = SupervisorRegistry::new();
        let record = registry
            .register(AgentRegistration::supervisor("s2", "vision", vec![]), 10)
            .expect("supervisor record");
        assert_eq!(record.max_concurrent_tasks, 10);
        assert_eq!(record.origin, SupervisorOrigin::Registered);

        assert!(registry
            .register(AgentRegistration::agent("worker", vec![]), 10)
            .is_none());
        assert_eq!(registry.supervisors().len(), 1);
    }

    #[test]
    fn registration_validation_collects_all() {
        let mut registration = AgentRegistration::agent("", vec![" ".into()]);
        registration.name = String::new();
        registration.max_concurrent_tasks = Some(0);

        let err = registration.validate().expect_err("invalid registration");
        let fields: Vec<_> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(
            fields,
            ["agent_id", "name", "capabilities[0]", "max_concurrent_tasks", "type"]
        );
    }

    #[test]
    fn registration_decodes_type_field() {
        let registration: AgentRegistration = serde_json::from_value(serde_json::json!({
            "agent_id": "s9",
            "name": "Nine",
            "type": "SUPERVISOR",
            "capabilities": ["a.b.c"],
        }))
        .unwrap();
        assert_eq!(registration.kind, AgentKind::Supervisor);
        assert!(registration.is_healthy);
        assert_eq!(registration.version, "1.0.0");
    }

    #[test]
    fn heartbeat_restores_health() {
        let mut registry = SupervisorRegistry::with_seeds([pool("s1", "intel", 0, 1)]);
        registry.set_health("s1", false);
        let now = Utc::now();
        assert!(registry.record_heartbeat("s1", now));
        let record = registry.supervisor("s1").unwrap();
        assert!(record.is_healthy);
        assert_eq!(record.last_heartbeat, now);
        assert!(!registry.record_heartbeat("ghost", now));
    }

    #[test]
    fn seeds_are_exempt_from_staleness_until_first_heartbeat() {
        let mut registry = SupervisorRegistry::with_seeds([pool("seed", "intel", 0, 1)]);
        registry.register(AgentRegistration::supervisor("dyn", "intel", vec![]), 10);

        let later = Utc::now() + Duration::seconds(120);
        let stale = registry.mark_stale(later, Duration::seconds(90));
        assert_eq!(stale, vec!["dyn".to_string()]);
        assert!(registry.supervisor("seed").unwrap().is_healthy);

        registry.record_heartbeat("seed", Utc::now());
        let stale = registry.mark_stale(later, Duration::seconds(90));
        assert_eq!(stale, vec!["seed".to_string()]);
    }

    #[test]
    fn capability_lookup_finds_serving_pool() {
        let registry = SupervisorRegistry::with_seeds([SupervisorRecord::builtin(
            SupervisorType::Multimodal,
        )]);
        assert_eq!(
            registry.type_for_capability("vision.image.analyze").as_deref(),
            Some("multimodal")
        );
        assert!(registry.type_for_capability("nope").is_none());
    }
}
