use crate::coordination::{SupervisorRecord, SupervisorType, MAX_PRIORITY, MIN_PRIORITY};
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const CONFIG_DIR_ENV: &str = "CARTRITA_CONFIG_DIR";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Cartrita configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` → `CARTRITA_CONFIG_DIR` env → `~/.cartrita/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Workspace directory - computed from the config dir, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from the config dir, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Router identity and dispatch defaults (`[router]`).
    #[serde(default)]
    pub router: RouterConfig,

    /// Supervisor pools seeded at startup (`[[supervisors]]`).
    #[serde(default = "default_supervisors")]
    pub supervisors: Vec<SupervisorSeedConfig>,

    /// Task-type → supervisor-type overrides (`[task_routes]`).
    #[serde(default)]
    pub task_routes: BTreeMap<String, String>,

    /// Supervisor liveness monitoring (`[heartbeat]`).
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// HTTP/WebSocket gateway (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Runtime trace recording (`[observability]`).
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Component restart policy (`[reliability]`).
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".cartrita"));
        Self {
            workspace_dir: config_dir.join("workspace"),
            config_path: config_dir.join("config.toml"),
            router: RouterConfig::default(),
            supervisors: default_supervisors(),
            task_routes: BTreeMap::new(),
            heartbeat: HeartbeatConfig::default(),
            gateway: GatewayConfig::default(),
            observability: ObservabilityConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────

/// Router configuration (`[router]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RouterConfig {
    /// Endpoint name used as sender on outgoing envelopes. Default: `"tier0-orchestrator"`.
    #[serde(default = "default_router_name")]
    pub name: String,
    /// Watchdog timeout for tasks without their own deadline. Default: `30000`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Priority stamped on envelopes when a task has none (1 = most urgent). Default: `5`.
    #[serde(default = "default_priority")]
    pub default_priority: u8,
    /// Retry count advertised to the transport on task envelopes. Default: `3`.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Retry delay advertised to the transport on task envelopes. Default: `1000`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Capacity for registered supervisors that omit one. Default: `10`.
    #[serde(default = "default_max_concurrent_tasks")]
    pub default_max_concurrent_tasks: u32,
}

fn default_router_name() -> String {
    "tier0-orchestrator".into()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_priority() -> u8 {
    5
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_concurrent_tasks() -> u32 {
    10
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: default_router_name(),
            default_timeout_ms: default_timeout_ms(),
            default_priority: default_priority(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            default_max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

// ── Supervisors ───────────────────────────────────────────────────

/// One statically seeded supervisor pool (`[[supervisors]]` entry).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SupervisorSeedConfig {
    /// Endpoint id; envelopes for this pool are addressed to it.
    pub id: String,
    /// Display name. Defaults to `id`.
    #[serde(default)]
    pub name: Option<String>,
    /// Pool type tasks are routed by (e.g. `"intelligence"`).
    pub supervisor_type: String,
    /// Task types this pool serves; consulted for types without a route.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Concurrent task ceiling. Default: `10`.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
}

impl SupervisorSeedConfig {
    pub fn builtin(kind: SupervisorType) -> Self {
        Self {
            id: kind.as_str().into(),
            name: Some(kind.display_name().into()),
            supervisor_type: kind.as_str().into(),
            capabilities: kind.default_capabilities(),
            max_concurrent_tasks: kind.default_capacity(),
        }
    }

    pub fn to_record(&self) -> SupervisorRecord {
        SupervisorRecord::seed(
            self.id.clone(),
            self.name.clone().unwrap_or_else(|| self.id.clone()),
            self.supervisor_type.clone(),
            self.capabilities.clone(),
            self.max_concurrent_tasks,
        )
    }
}

fn default_supervisors() -> Vec<SupervisorSeedConfig> {
    SupervisorType::ALL
        .into_iter()
        .map(SupervisorSeedConfig::builtin)
        .collect()
}

// ── Heartbeat ────────────────────────────────────────────────────

/// Supervisor staleness monitoring (`[heartbeat]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Mark silent supervisors unhealthy. Default: `false`.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between staleness sweeps. Default: `30`.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Seconds without a heartbeat before a supervisor is unhealthy. Default: `90`.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    90
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: default_check_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────

/// Gateway server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Gateway port (default: 42618)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Maximum request body size in bytes (default: 64 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Hard per-request timeout; should exceed the router's task timeout (default: 120)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    42618
}

fn default_max_body_bytes() -> usize {
    65_536
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Observability ─────────────────────────────────────────────────

/// Runtime trace configuration (`[observability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Runtime trace storage mode: "none" | "rolling" | "full".
    /// Controls whether routing events are persisted as JSONL.
    #[serde(default = "default_runtime_trace_mode")]
    pub runtime_trace_mode: String,

    /// Runtime trace file path. Relative paths are resolved under workspace_dir.
    #[serde(default = "default_runtime_trace_path")]
    pub runtime_trace_path: String,

    /// Maximum entries retained when runtime_trace_mode = "rolling".
    #[serde(default = "default_runtime_trace_max_entries")]
    pub runtime_trace_max_entries: usize,
}

fn default_runtime_trace_mode() -> String {
    "none".into()
}

fn default_runtime_trace_path() -> String {
    "state/runtime-trace.jsonl".into()
}

fn default_runtime_trace_max_entries() -> usize {
    200
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            runtime_trace_mode: default_runtime_trace_mode(),
            runtime_trace_path: default_runtime_trace_path(),
            runtime_trace_max_entries: default_runtime_trace_max_entries(),
        }
    }
}

// ── Reliability ───────────────────────────────────────────────────

/// Daemon component restart policy (`[reliability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Initial restart backoff for a failed component. Default: `2`.
    #[serde(default = "default_component_initial_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Upper bound for the doubling restart backoff. Default: `60`.
    #[serde(default = "default_component_max_backoff_secs")]
    pub component_max_backoff_secs: u64,
}

fn default_component_initial_backoff_secs() -> u64 {
    2
}

fn default_component_max_backoff_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            component_initial_backoff_secs: default_component_initial_backoff_secs(),
            component_max_backoff_secs: default_component_max_backoff_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".cartrita"))
}

fn resolve_config_dir(explicit: Option<&Path>) -> Result<(PathBuf, &'static str)> {
    if let Some(dir) = explicit {
        return Ok((dir.to_path_buf(), "flag"));
    }
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok((PathBuf::from(dir), "env"));
        }
    }
    Ok((default_config_dir()?, "default"))
}

impl Config {
    /// Load `config.toml` from `config_dir` (or the resolved default),
    /// writing a default file on first run.
    pub async fn load_or_init_in(config_dir: Option<&Path>) -> Result<Self> {
        let (config_dir, source) = resolve_config_dir(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let workspace_dir = config_dir.join("workspace");

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;
        fs::create_dir_all(&workspace_dir)
            .await
            .context("Failed to create workspace directory")?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path;
            config.workspace_dir = workspace_dir;
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.workspace_dir = workspace_dir;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            workspace = %config.workspace_dir.display(),
            source,
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Router
        if self.router.name.trim().is_empty() {
            anyhow::bail!("router.name must not be empty");
        }
        if self.router.default_timeout_ms == 0 {
            anyhow::bail!("router.default_timeout_ms must be greater than 0");
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.router.default_priority) {
            anyhow::bail!(
                "router.default_priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"
            );
        }
        if self.router.default_max_concurrent_tasks == 0 {
            anyhow::bail!("router.default_max_concurrent_tasks must be greater than 0");
        }

        // Supervisors
        let mut seen = HashSet::new();
        for (i, seed) in self.supervisors.iter().enumerate() {
            if seed.id.trim().is_empty() {
                anyhow::bail!("supervisors[{i}].id must not be empty");
            }
            if seed.supervisor_type.trim().is_empty() {
                anyhow::bail!("supervisors[{i}].supervisor_type must not be empty");
            }
            if seed.max_concurrent_tasks == 0 {
                anyhow::bail!("supervisors[{i}].max_concurrent_tasks must be greater than 0");
            }
            if !seen.insert(seed.id.as_str()) {
                anyhow::bail!("supervisors[{i}].id `{}` is duplicated", seed.id);
            }
        }

        // Task routes
        for (task_type, target) in &self.task_routes {
            if task_type.trim().is_empty() {
                anyhow::bail!("task_routes keys must not be empty");
            }
            if target.trim().is_empty() {
                anyhow::bail!("task_routes.\"{task_type}\" must name a supervisor type");
            }
        }

        // Heartbeat
        if self.heartbeat.check_interval_secs == 0 {
            anyhow::bail!("heartbeat.check_interval_secs must be greater than 0");
        }
        if self.heartbeat.stale_after_secs < self.heartbeat.check_interval_secs {
            anyhow::bail!("heartbeat.stale_after_secs must be >= heartbeat.check_interval_secs");
        }

        // Gateway
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.max_body_bytes == 0 {
            anyhow::bail!("gateway.max_body_bytes must be greater than 0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = lookup("CARTRITA_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = lookup("CARTRITA_GATEWAY_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid CARTRITA_GATEWAY_PORT"),
            }
        }
        if let Some(timeout) = lookup("CARTRITA_TASK_TIMEOUT_MS") {
            match timeout.trim().parse::<u64>() {
                Ok(ms) => self.router.default_timeout_ms = ms,
                Err(_) => {
                    tracing::warn!(value = %timeout, "Ignoring invalid CARTRITA_TASK_TIMEOUT_MS");
                }
            }
        }
        if let Some(enabled) = lookup("CARTRITA_HEARTBEAT_ENABLED") {
            match enabled.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.heartbeat.enabled = true,
                "0" | "false" | "no" | "off" => self.heartbeat.enabled = false,
                _ => tracing::warn!(value = %enabled, "Ignoring invalid CARTRITA_HEARTBEAT_ENABLED"),
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;
        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_seed_three_supervisors() {
        let config = Config::default();
        let seeds: Vec<_> = config
            .supervisors
            .iter()
            .map(|s| (s.id.as_str(), s.max_concurrent_tasks))
            .collect();
        assert_eq!(seeds, [("intelligence", 10), ("multimodal", 5), ("system", 15)]);
        assert_eq!(config.router.name, "tier0-orchestrator");
        assert_eq!(config.router.default_timeout_ms, 30_000);
        assert_eq!(config.gateway.port, 42618);
        assert!(!config.heartbeat.enabled);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[router]
default_timeout_ms = 500

[[supervisors]]
id = "s1"
supervisor_type = "intel"
max_concurrent_tasks = 1

[task_routes]
"writer.content.create" = "intel"
"#,
        )
        .unwrap();

        assert_eq!(config.router.default_timeout_ms, 500);
        assert_eq!(config.router.retry_count, 3);
        assert_eq!(config.supervisors.len(), 1);
        assert_eq!(config.supervisors[0].to_record().name, "s1");
        assert_eq!(config.task_routes["writer.content.create"], "intel");
        assert_eq!(config.heartbeat.stale_after_secs, 90);
        config.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.router.default_priority = 11;
        assert!(config.validate().unwrap_err().to_string().contains("default_priority"));

        let mut config = Config::default();
        config.supervisors.push(config.supervisors[0].clone());
        assert!(config.validate().unwrap_err().to_string().contains("duplicated"));

        let mut config = Config::default();
        config.supervisors[1].max_concurrent_tasks = 0;
        assert!(config.validate().unwrap_err().to_string().contains("supervisors[1]"));

        let mut config = Config::default();
        config.heartbeat.stale_after_secs = 10;
        assert!(config.validate().unwrap_err().to_string().contains("stale_after_secs"));

        let mut config = Config::default();
        config.task_routes.insert("a.b.c".into(), " ".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.host = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("CARTRITA_GATEWAY_HOST", "0.0.0.0"),
            ("CARTRITA_GATEWAY_PORT", "not-a-port"),
            ("CARTRITA_TASK_TIMEOUT_MS", "1500"),
            ("CARTRITA_HEARTBEAT_ENABLED", "yes"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.gateway.port, 42618);
        assert_eq!(config.router.default_timeout_ms, 1500);
        assert!(config.heartbeat.enabled);
    }

    #[test]
    fn schema_lists_sections() {
        let schema = schemars::schema_for!(Config);
        let json = serde_json::to_value(&schema).unwrap();
        let properties = json["properties"].as_object().expect("object schema");
        for section in ["router", "supervisors", "task_routes", "heartbeat", "gateway"] {
            assert!(properties.contains_key(section), "missing {section}");
        }
    }

    #[tokio::test]
    async fn load_or_init_writes_then_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let created = Config::load_or_init_in(Some(dir.path())).await.unwrap();
        assert!(created.config_path.exists());
        assert!(created.workspace_dir.is_dir());

        let mut edited = created.clone();
        edited.router.name = "edge-router".into();
        edited.save().await.unwrap();

        let reloaded = Config::load_or_init_in(Some(dir.path())).await.unwrap();
        assert_eq!(reloaded.router.name, "edge-router");
        assert_eq!(reloaded.supervisors, created.supervisors);
    }
}
