pub mod schema;

pub use schema::{
    Config, GatewayConfig, HeartbeatConfig, ObservabilityConfig, ReliabilityConfig,
    RouterConfig, SupervisorSeedConfig,
};
