use crate::config::HeartbeatConfig;
use crate::coordination::TaskRouter;
use crate::observability::runtime_trace;
use anyhow::Result;
use tokio::time::{self, Duration};
use tracing::{info, warn};

const COMPONENT: &str = "heartbeat";

/// Periodic sweep that marks supervisors unhealthy once they go quiet.
///
/// A supervisor becomes healthy again on its next heartbeat; that path lives
/// in the router, not here.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    router: TaskRouter,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, router: TaskRouter) -> Self {
        Self { config, router }
    }

    /// Start the sweep loop (runs until cancelled).
    pub async fn run(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Heartbeat disabled");
            return Ok(());
        }

        let interval_secs = self.config.check_interval_secs.max(1);
        info!(
            interval_secs,
            stale_after_secs = self.config.stale_after_secs,
            "Heartbeat monitor started"
        );

        let mut interval = time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let stale = self.tick();
            if !stale.is_empty() {
                info!(count = stale.len(), "Heartbeat: supervisors marked unhealthy");
            }
            crate::health::mark_component_ok(COMPONENT);
        }
    }

    /// One sweep; returns the ids that just went unhealthy.
    pub fn tick(&self) -> Vec<String> {
        let stale_after = chrono::Duration::seconds(
            i64::try_from(self.config.stale_after_secs).unwrap_or(i64::MAX),
        );
        let stale = self.router.mark_stale_supervisors(stale_after);
        for id in &stale {
            warn!(
                supervisor = %id,
                stale_after_secs = self.config.stale_after_secs,
                "supervisor missed heartbeats; marked unhealthy"
            );
            runtime_trace::record_event(
                "supervisor_stale",
                None,
                Some(id),
                Some(false),
                Some("no heartbeat within stale window"),
                serde_json::Value::Null,
            );
        }
        stale
    }
}
