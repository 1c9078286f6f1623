//! Config load/save round-trips in isolated temp directories.

use cartrita::config::{Config, HeartbeatConfig, RouterConfig};
use cartrita::coordination::TaskRouter;
use cartrita::transport::InProcessTransport;
use std::fs;
use std::sync::Arc;

// ─────────────────────────────────────────────────────────────────────────────
// First run
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_run_writes_default_config() {
    let tmp = tempfile::TempDir::new().expect("tempdir creation should succeed");

    let config = Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect("first run should initialise config");

    assert_eq!(config.config_path, tmp.path().join("config.toml"));
    assert_eq!(config.workspace_dir, tmp.path().join("workspace"));
    assert!(config.config_path.exists(), "config.toml should be written");
    assert!(config.workspace_dir.is_dir(), "workspace dir should exist");
    assert_eq!(config.router.name, "tier0-orchestrator");
    assert_eq!(config.supervisors.len(), 3);
}

#[tokio::test]
async fn second_run_reads_edited_file() {
    let tmp = tempfile::TempDir::new().expect("tempdir creation should succeed");
    Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect("first run");

    fs::write(
        tmp.path().join("config.toml"),
        r#"
[router]
name = "edge-router"
default_timeout_ms = 1500

[[supervisors]]
id = "intel"
supervisor_type = "intel"
capabilities = ["writer.content.create"]
max_concurrent_tasks = 1

[task_routes]
"writer.content.create" = "intel"
"#,
    )
    .expect("config rewrite should succeed");

    let config = Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect("edited config should load");

    assert_eq!(config.router.name, "edge-router");
    assert_eq!(config.router.default_timeout_ms, 1500);
    assert_eq!(config.router.default_priority, RouterConfig::default().default_priority);
    assert_eq!(config.supervisors.len(), 1);
    assert_eq!(config.heartbeat, HeartbeatConfig::default());

    let router = TaskRouter::from_config(&config, Arc::new(InProcessTransport::new()));
    let routes = router.routes();
    assert_eq!(routes.get("writer.content.create").map(String::as_str), Some("intel"));
    assert_eq!(routes.get("vision.image.analyze").map(String::as_str), Some("multimodal"));
    assert_eq!(router.name(), "edge-router");
    let seeds = router.get_supervisors();
    assert_eq!(seeds.len(), 1);
    assert_eq!(seeds[0].name, "intel");
    assert_eq!(seeds[0].max_concurrent_tasks, 1);
}

#[tokio::test]
async fn invalid_file_is_rejected_on_load() {
    let tmp = tempfile::TempDir::new().expect("tempdir creation should succeed");
    fs::write(
        tmp.path().join("config.toml"),
        "[heartbeat]\ncheck_interval_secs = 60\nstale_after_secs = 10\n",
    )
    .expect("config write should succeed");

    let err = Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect_err("stale window shorter than sweep interval");
    assert!(err.to_string().contains("stale_after_secs"));
}

#[tokio::test]
async fn malformed_toml_reports_parse_failure() {
    let tmp = tempfile::TempDir::new().expect("tempdir creation should succeed");
    fs::write(tmp.path().join("config.toml"), "[router\nname = ").expect("write");

    let err = Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect_err("broken TOML");
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Save
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn save_then_reload_preserves_changes() {
    let tmp = tempfile::TempDir::new().expect("tempdir creation should succeed");
    let mut config = Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect("first run");

    config.heartbeat.enabled = true;
    config
        .task_routes
        .insert("custom.report.build".into(), "intelligence".into());
    config.save().await.expect("save should succeed");

    let reloaded = Config::load_or_init_in(Some(tmp.path()))
        .await
        .expect("reload");
    assert!(reloaded.heartbeat.enabled);
    assert_eq!(
        reloaded.task_routes.get("custom.report.build").map(String::as_str),
        Some("intelligence")
    );

    let leftovers: Vec<_> = fs::read_dir(tmp.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "atomic save must not leave temp files");
}

#[test]
fn serialized_config_omits_computed_paths() {
    let config = Config::default();
    let rendered = toml::to_string(&config).expect("config should serialize");
    assert!(!rendered.contains("workspace_dir"));
    assert!(!rendered.contains("config_path"));
    assert!(rendered.contains("[router]"));
    assert!(rendered.contains("[[supervisors]]"));
}
