use crate::config::{Config, ReliabilityConfig};
use crate::coordination::TaskRouter;
use crate::gateway::AppState;
use crate::heartbeat::HeartbeatMonitor;
use crate::transport::InProcessTransport;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const STATE_FILE_NAME: &str = "daemon_state.json";
const STATE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Exponential restart delay for a supervised component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RestartPolicy {
    initial_secs: u64,
    max_secs: u64,
}

impl RestartPolicy {
    fn from_config(reliability: &ReliabilityConfig) -> Self {
        Self::new(
            reliability.component_initial_backoff_secs,
            reliability.component_max_backoff_secs,
        )
    }

    fn new(initial_secs: u64, max_secs: u64) -> Self {
        let initial_secs = initial_secs.max(1);
        Self {
            initial_secs,
            max_secs: max_secs.max(initial_secs),
        }
    }

    fn next(&self, current_secs: u64) -> u64 {
        current_secs.saturating_mul(2).min(self.max_secs)
    }
}

/// Run the gateway and heartbeat monitor until Ctrl+C.
///
/// Both components share one transport and one router, so restarts of the
/// gateway keep the registry and in-flight tasks.
pub async fn run(config: Config, host: String, port: u16) -> Result<()> {
    let policy = RestartPolicy::from_config(&config.reliability);
    crate::health::mark_component_ok("daemon");

    let transport = Arc::new(InProcessTransport::new());
    let router = TaskRouter::from_config(&config, transport.clone());
    tracing::info!(
        router = router.name(),
        supervisors = router.get_supervisors().len(),
        "router ready"
    );

    let mut components = vec![spawn_state_writer(state_file_path(&config), router.clone())];

    let gateway_state = AppState::new(router.clone(), transport, config.gateway.clone());
    let bind_host = host.clone();
    components.push(supervise("gateway", policy, move || {
        let state = gateway_state.clone();
        let host = bind_host.clone();
        async move { crate::gateway::run_gateway(&host, port, state).await }
    }));

    if config.heartbeat.enabled {
        let heartbeat = config.heartbeat.clone();
        let monitored = router.clone();
        components.push(supervise("heartbeat", policy, move || {
            let monitor = HeartbeatMonitor::new(heartbeat.clone(), monitored.clone());
            async move { monitor.run().await }
        }));
    } else {
        crate::health::mark_component_ok("heartbeat");
        tracing::info!("Heartbeat disabled; staleness monitor not started");
    }

    println!("🧭 Cartrita daemon on http://{host}:{port} (router: {})", router.name());
    println!("   Supervisors: {}", router.get_supervisors().len());
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    crate::health::mark_component_error("daemon", "shutdown requested");

    for component in &components {
        component.abort();
    }
    for component in components {
        let _ = component.await;
    }

    let failed = router.shutdown();
    tracing::info!(failed_pending = failed, "daemon stopped");
    Ok(())
}

/// `daemon_state.json`, next to the config file.
pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(STATE_FILE_NAME)
}

/// Component health plus router stats, as written to the state file.
fn daemon_state(router: &TaskRouter) -> serde_json::Value {
    let mut state = crate::health::snapshot_json();
    if let Some(fields) = state.as_object_mut() {
        fields.insert("router".into(), json!(router.get_stats()));
        fields.insert("written_at".into(), json!(Utc::now().to_rfc3339()));
    }
    state
}

fn spawn_state_writer(path: PathBuf, router: TaskRouter) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(dir) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                tracing::warn!(dir = %dir.display(), "cannot create state directory: {err}");
            }
        }

        let mut ticker = tokio::time::interval(STATE_FLUSH_INTERVAL);
        loop {
            ticker.tick().await;
            let bytes = match serde_json::to_vec_pretty(&daemon_state(&router)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!("cannot encode daemon state: {err}");
                    continue;
                }
            };
            if let Err(err) = tokio::fs::write(&path, bytes).await {
                tracing::debug!(path = %path.display(), "daemon state write failed: {err}");
            }
        }
    })
}

/// Keep `component` running, restarting it with backoff whenever it returns.
fn supervise<F, Fut>(name: &'static str, policy: RestartPolicy, mut component: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = policy.initial_secs;
        loop {
            crate::health::mark_component_ok(name);
            if let Err(err) = component().await {
                crate::health::mark_component_error(name, format!("{err:#}"));
                tracing::error!(component = name, "component failed: {err:#}");
            } else {
                crate::health::mark_component_error(name, "component exited unexpectedly");
                tracing::warn!(component = name, "component exited unexpectedly");
                delay = policy.initial_secs;
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay = policy.next(delay);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn state_file_sits_beside_config() {
        let tmp = TempDir::new().expect("tempdir");
        let config = Config {
            workspace_dir: tmp.path().join("workspace"),
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        };
        assert_eq!(state_file_path(&config), tmp.path().join(STATE_FILE_NAME));
    }

    #[test]
    fn restart_delay_doubles_up_to_cap() {
        let policy = RestartPolicy::new(0, 5);
        assert_eq!(policy.initial_secs, 1);
        assert_eq!(policy.next(1), 2);
        assert_eq!(policy.next(4), 5);
        assert_eq!(policy.next(5), 5);
        assert_eq!(RestartPolicy::new(10, 3).max_secs, 10);
    }

    #[test]
    fn daemon_state_embeds_router_stats() {
        let router = TaskRouter::with_defaults(Arc::new(InProcessTransport::new()));
        let state = daemon_state(&router);
        assert!(state["router"]["supervisors"].as_u64().unwrap_or(0) > 0);
        assert_eq!(state["router"]["pending_tasks"], 0);
        assert!(state["written_at"].is_string());
        assert!(state["components"].is_object());
    }

    #[tokio::test]
    async fn failing_component_is_marked_and_restarted() {
        let handle = supervise("daemon-test-fail", RestartPolicy::new(1, 1), || async {
            anyhow::bail!("bind refused")
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let snapshot = crate::health::snapshot_json();
        let component = &snapshot["components"]["daemon-test-fail"];
        assert_eq!(component["status"], "error");
        assert!(component["restart_count"].as_u64().unwrap_or(0) >= 1);
        assert!(component["last_error"]
            .as_str()
            .unwrap_or("")
            .contains("bind refused"));
    }

    #[tokio::test]
    async fn clean_exit_counts_as_error() {
        let handle = supervise("daemon-test-exit", RestartPolicy::new(1, 1), || async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let snapshot = crate::health::snapshot_json();
        let component = &snapshot["components"]["daemon-test-exit"];
        assert_eq!(component["status"], "error");
        assert!(component["last_error"]
            .as_str()
            .unwrap_or("")
            .contains("component exited unexpectedly"));
    }
}
