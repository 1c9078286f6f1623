//! JSONL recorder for routing events.
//!
//! Disabled unless `[observability] runtime_trace_mode` is `rolling` or
//! `full`. Rolling mode rewrites the file to its newest
//! `runtime_trace_max_entries` lines after every append.

use crate::config::ObservabilityConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use uuid::Uuid;

const DEFAULT_TRACE_REL_PATH: &str = "state/runtime-trace.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Off,
    Rolling,
    Full,
}

impl TraceMode {
    /// Parse a configured mode; unknown values disable recording.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Some(Self::Off),
            "rolling" => Some(Self::Rolling),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// One routing event persisted as a JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeTraceEvent {
    pub id: String,
    pub timestamp: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Filter for [`load_events`].
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub limit: usize,
    pub event_type: Option<String>,
    pub task_id: Option<String>,
}

impl TraceQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn matches(&self, event: &RuntimeTraceEvent) -> bool {
        let type_ok = self
            .event_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .is_none_or(|t| event.event_type.eq_ignore_ascii_case(t));
        let task_ok = self
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .is_none_or(|t| event.task_id.as_deref() == Some(t));
        type_ok && task_ok
    }
}

struct TraceRecorder {
    mode: TraceMode,
    max_entries: usize,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TraceRecorder {
    fn new(mode: TraceMode, max_entries: usize, path: PathBuf) -> Self {
        Self {
            mode,
            max_entries: max_entries.max(1),
            path,
            write_lock: Mutex::new(()),
        }
    }

    fn append(&self, event: &RuntimeTraceEvent) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, event)?;
        file.write_all(b"\n")?;

        if self.mode == TraceMode::Rolling {
            self.keep_newest()?;
        }
        Ok(())
    }

    fn keep_newest(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let excess = lines.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return Ok(());
        }

        let tmp = self
            .path
            .with_extension(format!("jsonl.{}.tmp", Uuid::new_v4().simple()));
        {
            let mut out = BufWriter::new(fs::File::create(&tmp)?);
            for line in &lines[excess..] {
                writeln!(out, "{line}")?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

static RECORDER: LazyLock<RwLock<Option<Arc<TraceRecorder>>>> =
    LazyLock::new(|| RwLock::new(None));

/// Resolve the configured mode, warning on values we do not understand.
pub fn mode_from_config(config: &ObservabilityConfig) -> TraceMode {
    TraceMode::parse(&config.runtime_trace_mode).unwrap_or_else(|| {
        tracing::warn!(
            mode = %config.runtime_trace_mode,
            "Unknown observability.runtime_trace_mode; recording disabled"
        );
        TraceMode::Off
    })
}

/// Trace file location; relative paths live under the workspace.
pub fn resolve_trace_path(config: &ObservabilityConfig, workspace_dir: &Path) -> PathBuf {
    let raw = config.runtime_trace_path.trim();
    let configured = if raw.is_empty() {
        PathBuf::from(DEFAULT_TRACE_REL_PATH)
    } else {
        PathBuf::from(raw)
    };
    if configured.is_absolute() {
        configured
    } else {
        workspace_dir.join(configured)
    }
}

/// Install (or remove) the process-wide recorder.
pub fn init_from_config(config: &ObservabilityConfig, workspace_dir: &Path) {
    let recorder = match mode_from_config(config) {
        TraceMode::Off => None,
        mode => Some(Arc::new(TraceRecorder::new(
            mode,
            config.runtime_trace_max_entries,
            resolve_trace_path(config, workspace_dir),
        ))),
    };
    *RECORDER.write() = recorder;
}

/// Record a routing event. No-op while recording is off.
pub fn record_event(
    event_type: &str,
    task_id: Option<&str>,
    supervisor: Option<&str>,
    success: Option<bool>,
    message: Option<&str>,
    payload: Value,
) {
    let Some(recorder) = RECORDER.read().clone() else {
        return;
    };

    let event = RuntimeTraceEvent {
        id: Uuid::new_v4().to_string(),
        timestamp: Utc::now().to_rfc3339(),
        event_type: event_type.to_string(),
        task_id: task_id.map(str::to_string),
        supervisor: supervisor.map(str::to_string),
        success,
        message: message.map(str::to_string),
        payload,
    };

    if let Err(err) = recorder.append(&event) {
        tracing::warn!(event_type, "failed to write runtime trace event: {err:#}");
    }
}

/// Matching events from `path`, newest first, at most `query.limit` of them.
pub fn load_events(path: &Path, query: &TraceQuery) -> Result<Vec<RuntimeTraceEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let mut events: Vec<RuntimeTraceEvent> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!("skipping malformed runtime trace line: {err}");
                None
            }
        })
        .filter(|event| query.matches(event))
        .collect();

    events.reverse();
    events.truncate(query.limit);
    Ok(events)
}
