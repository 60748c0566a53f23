//! Append-only structured event stream.
//!
//! One JSON object per line in `LOG_DIR/pipeline.jsonl`. Dashboards tail the
//! file; the engine only ever appends. Each record gets a unix `timestamp`
//! stamped at append time, and writes are single `write` calls so a crash
//! never leaves a partial line.

use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// File name of the event stream inside `LOG_DIR`.
pub const EVENT_LOG_FILE: &str = "pipeline.jsonl";

/// A structured pipeline event.
///
/// Serialized with an `event` tag; field names are part of the contract
/// consumed by dashboards and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A chunk plan was computed for a source.
    Planned {
        job_id: String,
        source: String,
        total_sec: f64,
        chunk_count: usize,
    },
    /// The plan exceeded `CHUNK_MAX` and was truncated.
    PlanTruncated {
        job_id: String,
        source: String,
        chunk_max: usize,
        dropped_sec: f64,
    },
    /// A job completed and its outputs were published.
    Processed {
        job_id: String,
        source: String,
        artist: String,
        album: String,
        title: String,
        duration_sec: f64,
        chunk_count: usize,
        processing_time_sec: f64,
    },
    /// A source failed probing or schema validation and was set aside.
    SkippedCorrupt {
        source: String,
        destination: Option<String>,
        error: String,
    },
    /// One separation attempt on a chunk failed.
    ChunkFailed {
        job_id: String,
        chunk_index: usize,
        attempt: u32,
        error: String,
    },
    /// A job reached a terminal failure.
    Failed {
        job_id: String,
        source: String,
        reason: String,
        error: String,
    },
    /// A manifest was committed.
    ManifestWritten { job_id: String, path: String },
    /// One artifact was transferred by the sync router.
    SyncSuccess {
        job_id: String,
        artifact: String,
        destination: String,
    },
    /// One artifact transfer failed.
    SyncFailed {
        job_id: String,
        artifact: String,
        destination: String,
        error: String,
    },
    /// An artifact or manifest was skipped by the sync router.
    SyncSkipped {
        job_id: String,
        artifact: Option<String>,
        reason: String,
    },
}

impl Event {
    /// Short kind string, used for stdout reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Planned { .. } => "planned",
            Event::PlanTruncated { .. } => "plan_truncated",
            Event::Processed { .. } => "processed",
            Event::SkippedCorrupt { .. } => "skipped_corrupt",
            Event::ChunkFailed { .. } => "chunk_failed",
            Event::Failed { .. } => "failed",
            Event::ManifestWritten { .. } => "manifest_written",
            Event::SyncSuccess { .. } => "sync_success",
            Event::SyncFailed { .. } => "sync_failed",
            Event::SyncSkipped { .. } => "sync_skipped",
        }
    }
}

/// Appender for the event stream.
///
/// Cheap to clone behind an `Arc`; serializes writers so concurrent loops
/// never interleave partial lines.
pub struct EventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Create an event log under the given directory, creating it if needed.
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        Ok(Self {
            path: log_dir.join(EVENT_LOG_FILE),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are logged and swallowed: the event log
    /// must never take down the pipeline.
    pub fn emit(&self, event: &Event) {
        let mut value = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to serialize event: {}", e);
                return;
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::from(chrono::Utc::now().timestamp()),
            );
        }
        let mut line = value.to_string();
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("failed to append event to {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_lines(log: &EventLog) -> Vec<serde_json::Value> {
        let content = fs::read_to_string(log.path()).unwrap();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_emit_one_record_per_line() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        log.emit(&Event::ManifestWritten {
            job_id: "j1".to_string(),
            path: "/outputs/j1/manifest.json".to_string(),
        });
        log.emit(&Event::SyncSkipped {
            job_id: "j1".to_string(),
            artifact: None,
            reason: "invalid_manifest".to_string(),
        });

        let lines = read_lines(&log);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "manifest_written");
        assert_eq!(lines[1]["event"], "sync_skipped");
        assert!(lines[0]["timestamp"].is_i64());
    }

    #[test]
    fn test_emit_tagged_fields() {
        let dir = TempDir::new().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        log.emit(&Event::SkippedCorrupt {
            source: "/q/job_x".to_string(),
            destination: Some("/archive/rejects/job_x".to_string()),
            error: "no usable stream".to_string(),
        });

        let lines = read_lines(&log);
        assert_eq!(lines[0]["event"], "skipped_corrupt");
        assert_eq!(lines[0]["source"], "/q/job_x");
        assert_eq!(lines[0]["destination"], "/archive/rejects/job_x");
    }

    #[test]
    fn test_kind_matches_tag() {
        let event = Event::ChunkFailed {
            job_id: "j".to_string(),
            chunk_index: 2,
            attempt: 1,
            error: "timeout".to_string(),
        };
        assert_eq!(event.kind(), "chunk_failed");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "chunk_failed");
    }
}
