//! Shared fixtures for integration tests.
//!
//! Builds a complete engine configuration rooted in a temp directory and
//! provides bundle/manifest builders plus an event-log reader.

use std::fs;
use std::path::{Path, PathBuf};

use instrumental_engine::config::{
    AppConfig, CorruptDest, ProcessingSettings, QueueRoot, Route, SyncMethod, SyncSettings,
    VariantSettings,
};
use instrumental_engine::events::EventLog;

/// Engine configuration with every root under `base`.
pub fn test_config(base: &Path) -> AppConfig {
    AppConfig {
        incoming: base.join("incoming"),
        working: base.join("working"),
        outputs_dir: base.join("outputs"),
        music_library: base.join("music-library"),
        archive_dir: base.join("archive"),
        quarantine_dir: base.join("quarantine"),
        log_dir: base.join("logs"),
        db_path: base.join("db/engine.sqlite"),
        queues: vec![
            QueueRoot {
                name: "youtube_audio".to_string(),
                root: base.join("queues/youtube_audio"),
            },
            QueueRoot {
                name: "other".to_string(),
                root: base.join("queues/other"),
            },
        ],
        processing: ProcessingSettings::default(),
        variants: VariantSettings::default(),
        corrupt_dest: CorruptDest::Archive,
        sync: SyncSettings {
            method: SyncMethod::Local,
            ..SyncSettings::default()
        },
    }
}

/// Create the directories a running engine would have.
pub fn ensure_dirs(config: &AppConfig) {
    for dir in [
        &config.incoming,
        &config.working,
        &config.outputs_dir,
        &config.archive_dir,
        &config.quarantine_dir,
        &config.log_dir,
    ] {
        fs::create_dir_all(dir).unwrap();
    }
    fs::create_dir_all(config.db_path.parent().unwrap()).unwrap();
    for queue in &config.queues {
        fs::create_dir_all(&queue.root).unwrap();
    }
}

/// Write a bundle directory with the given `job.json` body and an audio
/// payload stub.
pub fn write_bundle(queue_root: &Path, name: &str, job_json: &str) -> PathBuf {
    let dir = queue_root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("job.json"), job_json).unwrap();
    fs::write(dir.join("audio.m4a"), b"stub-audio").unwrap();
    dir
}

/// Write a published job directory with a valid manifest and artifact files.
pub fn write_published_job(
    outputs_dir: &Path,
    job_id: &str,
    artifacts: &[(&str, &str, &str)],
) -> PathBuf {
    let job_dir = outputs_dir.join(job_id);
    let mut artifact_values = Vec::new();
    for (kind, variant, rel_path) in artifacts {
        let file = job_dir.join(rel_path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, format!("{kind}-{variant}-payload")).unwrap();
        artifact_values.push(serde_json::json!({
            "kind": kind,
            "variant": variant,
            "label": format!("{kind}/{variant}"),
            "path": rel_path,
        }));
    }
    let manifest = serde_json::json!({
        "job_id": job_id,
        "source_type": "youtube",
        "processed_at": "2025-11-02T10:00:00Z",
        "artist": "Ch",
        "album": "YTDL",
        "title": "Song",
        "artifacts": artifact_values,
        "stems_generated": false,
        "stems_preserved": false,
    });
    fs::write(
        job_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
    job_dir
}

/// A route matching `(kind, variant)` to a destination template.
pub fn route(kind: Option<&str>, variant: Option<&str>, to: &str) -> Route {
    Route {
        kind: kind.map(String::from),
        variant: variant.map(String::from),
        to: to.to_string(),
    }
}

/// Read all event records from the engine's event log.
pub fn read_events(config: &AppConfig) -> Vec<serde_json::Value> {
    let log = EventLog::new(&config.log_dir).unwrap();
    match fs::read_to_string(log.path()) {
        Ok(content) => content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Events of one kind, in order.
pub fn events_of_kind(config: &AppConfig, kind: &str) -> Vec<serde_json::Value> {
    read_events(config)
        .into_iter()
        .filter(|e| e["event"] == kind)
        .collect()
}
