//! GT-015: Append-only JSONL provenance event log, one per stack.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};

/// RFC 3339 UTC timestamp with second precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("r-{}", &id[..12])
}

/// Derive the event log path for a stack directory.
pub fn event_log_path(stack_dir: &Path) -> PathBuf {
    stack_dir.join("events.jsonl")
}

/// Append an event to the stack's event log. Each event is written with a
/// single `write_all` so concurrent appenders do not interleave lines.
pub fn append_event(stack_dir: &Path, event: ProvenanceEvent) -> Result<(), String> {
    std::fs::create_dir_all(stack_dir)
        .map_err(|e| format!("cannot create state dir {}: {}", stack_dir.display(), e))?;
    let path = event_log_path(stack_dir);

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let mut line = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| format!("write error: {}", e))
}

/// Read every event back, skipping lines that do not parse.
pub fn read_events(stack_dir: &Path) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(stack_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
