//! TOML file configuration.
//!
//! Every field is optional; [`super::AppConfig::resolve`] merges the file
//! over CLI arguments and fills defaults.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub incoming: Option<String>,
    pub working: Option<String>,
    pub outputs_dir: Option<String>,
    pub music_library: Option<String>,
    pub archive_dir: Option<String>,
    pub quarantine_dir: Option<String>,
    pub log_dir: Option<String>,
    pub db_path: Option<String>,

    /// Ordered queue roots; names are the queue identifiers.
    pub queues: Option<Vec<QueueEntry>>,

    pub processing: Option<ProcessingFileConfig>,
    pub variants: Option<VariantsFileConfig>,
    pub recovery: Option<RecoveryFileConfig>,
    pub sync: Option<SyncFileConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    pub root: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessingFileConfig {
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u32>,
    pub mp3_encoding: Option<String>,
    pub chunking_enabled: Option<bool>,
    pub chunk_seconds: Option<u32>,
    pub chunk_overlap_sec: Option<f64>,
    pub crossfade_ms: Option<u32>,
    pub chunk_max: Option<usize>,
    pub chunk_overflow: Option<String>,
    pub timeout_sec: Option<u64>,
    pub max_retries: Option<u32>,
    pub ffmpeg_threads: Option<u32>,
    pub separator_device: Option<String>,
    pub separator_jobs: Option<u32>,
    pub library_organize: Option<bool>,
    pub retain_workdir_on_failure: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariantsFileConfig {
    /// Subset of {"instrumental", "no_drums", "drums_only"}.
    pub set: Option<Vec<String>>,
    pub preserve_stems: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryFileConfig {
    /// "archive" or "quarantine".
    pub corrupt_dest: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncFileConfig {
    /// "rsync", "s3", "scp" or "local".
    pub method: Option<String>,
    pub remote_roots: Option<BTreeMap<String, String>>,
    pub routes: Option<Vec<RouteEntry>>,
    pub skip_on_missing_remote: Option<bool>,
    pub dry_run: Option<bool>,
    pub poll_interval_sec: Option<u64>,

    pub rsync_bw_limit_kbps: Option<u64>,
    pub rsync_compress: Option<bool>,

    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,

    pub scp_host: Option<String>,
    pub scp_user: Option<String>,
    pub scp_key: Option<String>,
}

/// A route rule: artifacts matching `kind`/`variant` go to `to`.
/// A missing match field matches anything.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    pub kind: Option<String>,
    pub variant: Option<String>,
    pub to: String,
}

impl FileConfig {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {}: {}", path.display(), e))?;
        let parsed: FileConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse config file {}: {}", path.display(), e))?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cfg: FileConfig = toml::from_str("").unwrap();
        assert!(cfg.incoming.is_none());
        assert!(cfg.sync.is_none());
    }

    #[test]
    fn test_parse_full() {
        let raw = r#"
            incoming = "/data/incoming"
            outputs_dir = "/data/outputs"

            [[queues]]
            name = "youtube_audio"
            root = "/queues/youtube_audio"

            [[queues]]
            name = "other"
            root = "/queues/other"

            [processing]
            model = "htdemucs"
            chunk_seconds = 120
            chunk_overlap_sec = 0.5
            crossfade_ms = 200
            mp3_encoding = "cbr320"

            [variants]
            set = ["instrumental", "no_drums"]
            preserve_stems = true

            [recovery]
            corrupt_dest = "quarantine"

            [sync]
            method = "local"
            skip_on_missing_remote = true

            [sync.remote_roots]
            audio = "/mnt/nas/Instrumentals"

            [[sync.routes]]
            kind = "audio"
            variant = "instrumental"
            to = "${remoteRoots.audio}/Instrumental"
        "#;
        let cfg: FileConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.queues.as_ref().unwrap().len(), 2);
        assert_eq!(cfg.queues.as_ref().unwrap()[0].name, "youtube_audio");
        let processing = cfg.processing.unwrap();
        assert_eq!(processing.model.as_deref(), Some("htdemucs"));
        assert_eq!(processing.mp3_encoding.as_deref(), Some("cbr320"));
        let sync = cfg.sync.unwrap();
        assert_eq!(sync.method.as_deref(), Some("local"));
        assert_eq!(sync.routes.as_ref().unwrap()[0].kind.as_deref(), Some("audio"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<FileConfig, _> = toml::from_str("no_such_key = 1");
        assert!(result.is_err());
    }
}
