//! Engine configuration.
//!
//! Configuration is resolved once at startup into an immutable [`AppConfig`]
//! snapshot that is threaded through every component: TOML file values
//! override CLI arguments, and everything else falls back to the deployment
//! defaults. Components never read the environment on their own.

mod file_config;

pub use file_config::{FileConfig, QueueEntry, RouteEntry};

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// CLI arguments that participate in config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub incoming: Option<PathBuf>,
    pub working: Option<PathBuf>,
    pub outputs_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub dry_run: bool,
}

/// MP3 encoding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mp3Encoding {
    /// VBR -q:a 0.
    V0,
    /// CBR 320 kbps.
    Cbr320,
}

impl Mp3Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mp3Encoding::V0 => "v0",
            Mp3Encoding::Cbr320 => "cbr320",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "v0" => Some(Mp3Encoding::V0),
            "cbr320" => Some(Mp3Encoding::Cbr320),
            _ => None,
        }
    }
}

/// What to do when a chunk plan would exceed `chunk_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOverflow {
    /// Keep the first `chunk_max` chunks and log the dropped tail.
    Truncate,
    /// Fail the job with reason `plan_exceeded`.
    Reject,
}

impl ChunkOverflow {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "truncate" => Some(ChunkOverflow::Truncate),
            "reject" => Some(ChunkOverflow::Reject),
            _ => None,
        }
    }
}

/// Destination class for corrupt inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptDest {
    /// `ARCHIVE_DIR/rejects/`.
    Archive,
    /// `QUARANTINE_DIR/`.
    Quarantine,
}

impl CorruptDest {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "archive" => Some(CorruptDest::Archive),
            "quarantine" => Some(CorruptDest::Quarantine),
            _ => None,
        }
    }
}

/// Output variant of a processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Variant {
    Instrumental,
    NoDrums,
    DrumsOnly,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Instrumental => "instrumental",
            Variant::NoDrums => "no_drums",
            Variant::DrumsOnly => "drums_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instrumental" => Some(Variant::Instrumental),
            "no_drums" => Some(Variant::NoDrums),
            "drums_only" => Some(Variant::DrumsOnly),
            _ => None,
        }
    }

    /// Human label used in manifests and tags.
    pub fn label(&self) -> &'static str {
        match self {
            Variant::Instrumental => "Instrumental",
            Variant::NoDrums => "Instrumental (no drums)",
            Variant::DrumsOnly => "Drums only",
        }
    }
}

/// Sync transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
    Rsync,
    S3,
    Scp,
    Local,
}

impl SyncMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsync" => Some(SyncMethod::Rsync),
            "s3" => Some(SyncMethod::S3),
            "scp" => Some(SyncMethod::Scp),
            "local" => Some(SyncMethod::Local),
            _ => None,
        }
    }
}

/// A named queue root, scanned in declaration order.
#[derive(Debug, Clone)]
pub struct QueueRoot {
    pub name: String,
    pub root: PathBuf,
}

/// Processing knobs for the chunked separation pipeline.
#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    pub model: String,
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub mp3_encoding: Mp3Encoding,
    pub chunking_enabled: bool,
    pub chunk_seconds: u32,
    pub chunk_overlap_sec: f64,
    pub crossfade_ms: u32,
    pub chunk_max: usize,
    pub chunk_overflow: ChunkOverflow,
    /// Per-chunk separation timeout in seconds; 0 disables the bound.
    pub timeout_sec: u64,
    pub max_retries: u32,
    /// ffmpeg `-threads` cap; 0 lets ffmpeg decide.
    pub ffmpeg_threads: u32,
    pub separator_device: String,
    pub separator_jobs: u32,
    pub library_organize: bool,
    pub retain_workdir_on_failure: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            model: "htdemucs".to_string(),
            sample_rate: 44100,
            bit_depth: 16,
            mp3_encoding: Mp3Encoding::V0,
            chunking_enabled: true,
            chunk_seconds: 120,
            chunk_overlap_sec: 0.5,
            crossfade_ms: 200,
            chunk_max: 16,
            chunk_overflow: ChunkOverflow::Truncate,
            timeout_sec: 3600,
            max_retries: 2,
            ffmpeg_threads: 0,
            separator_device: "cpu".to_string(),
            separator_jobs: 1,
            library_organize: false,
            retain_workdir_on_failure: false,
        }
    }
}

/// Variant selection.
#[derive(Debug, Clone)]
pub struct VariantSettings {
    pub set: Vec<Variant>,
    pub preserve_stems: bool,
}

impl Default for VariantSettings {
    fn default() -> Self {
        Self {
            set: vec![Variant::Instrumental],
            preserve_stems: false,
        }
    }
}

impl VariantSettings {
    /// True when any variant beyond `instrumental` is requested, which
    /// forces full 4-stem separation.
    pub fn needs_full_stems(&self) -> bool {
        self.preserve_stems
            || self
                .set
                .iter()
                .any(|v| !matches!(v, Variant::Instrumental))
    }
}

/// A compiled sync route.
#[derive(Debug, Clone)]
pub struct Route {
    pub kind: Option<String>,
    pub variant: Option<String>,
    pub to: String,
}

/// Sync router configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub method: SyncMethod,
    pub remote_roots: BTreeMap<String, String>,
    pub routes: Vec<Route>,
    pub skip_on_missing_remote: bool,
    pub dry_run: bool,
    pub poll_interval_sec: u64,

    pub rsync_bw_limit_kbps: u64,
    pub rsync_compress: bool,

    pub s3_bucket: String,
    pub s3_prefix: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,

    pub scp_host: String,
    pub scp_user: String,
    pub scp_key: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            method: SyncMethod::Local,
            remote_roots: BTreeMap::new(),
            routes: Vec::new(),
            skip_on_missing_remote: true,
            dry_run: false,
            poll_interval_sec: 10,
            rsync_bw_limit_kbps: 0,
            rsync_compress: true,
            s3_bucket: String::new(),
            s3_prefix: "instrumental-engine".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            scp_host: String::new(),
            scp_user: String::new(),
            scp_key: String::new(),
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub incoming: PathBuf,
    pub working: PathBuf,
    pub outputs_dir: PathBuf,
    pub music_library: PathBuf,
    pub archive_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,

    pub queues: Vec<QueueRoot>,
    pub processing: ProcessingSettings,
    pub variants: VariantSettings,
    pub corrupt_dest: CorruptDest,
    pub sync: SyncSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and an optional TOML file.
    /// File values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file: Option<FileConfig>) -> Result<Self> {
        let file = file.unwrap_or_default();

        let incoming = file
            .incoming
            .map(PathBuf::from)
            .or_else(|| cli.incoming.clone())
            .unwrap_or_else(|| PathBuf::from("/data/incoming"));
        let working = file
            .working
            .map(PathBuf::from)
            .or_else(|| cli.working.clone())
            .unwrap_or_else(|| PathBuf::from("/data/working"));
        let outputs_dir = file
            .outputs_dir
            .map(PathBuf::from)
            .or_else(|| cli.outputs_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/data/outputs"));
        let music_library = file
            .music_library
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/data/music-library"));
        let archive_dir = file
            .archive_dir
            .map(PathBuf::from)
            .or_else(|| cli.archive_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/data/archive"));
        let quarantine_dir = file
            .quarantine_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/data/quarantine"));
        let log_dir = file
            .log_dir
            .map(PathBuf::from)
            .or_else(|| cli.log_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/data/logs"));
        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .unwrap_or_else(|| PathBuf::from("/data/db/engine.sqlite"));

        let queues = match file.queues {
            Some(entries) if !entries.is_empty() => entries
                .into_iter()
                .map(|e| QueueRoot {
                    name: e.name,
                    root: PathBuf::from(e.root),
                })
                .collect(),
            _ => default_queues(),
        };

        let pf = file.processing.unwrap_or_default();
        let defaults = ProcessingSettings::default();
        let mp3_encoding = match pf.mp3_encoding {
            Some(raw) => match Mp3Encoding::parse(&raw) {
                Some(mode) => mode,
                None => bail!("invalid mp3_encoding {:?} (expected v0 or cbr320)", raw),
            },
            None => defaults.mp3_encoding,
        };
        let chunk_overflow = match pf.chunk_overflow {
            Some(raw) => match ChunkOverflow::parse(&raw) {
                Some(mode) => mode,
                None => bail!(
                    "invalid chunk_overflow {:?} (expected truncate or reject)",
                    raw
                ),
            },
            None => defaults.chunk_overflow,
        };
        let processing = ProcessingSettings {
            model: pf.model.unwrap_or(defaults.model),
            sample_rate: pf.sample_rate.unwrap_or(defaults.sample_rate),
            bit_depth: pf.bit_depth.unwrap_or(defaults.bit_depth),
            mp3_encoding,
            chunking_enabled: pf.chunking_enabled.unwrap_or(defaults.chunking_enabled),
            chunk_seconds: pf.chunk_seconds.unwrap_or(defaults.chunk_seconds),
            chunk_overlap_sec: pf.chunk_overlap_sec.unwrap_or(defaults.chunk_overlap_sec),
            crossfade_ms: pf.crossfade_ms.unwrap_or(defaults.crossfade_ms),
            chunk_max: pf.chunk_max.unwrap_or(defaults.chunk_max),
            chunk_overflow,
            timeout_sec: pf.timeout_sec.unwrap_or(defaults.timeout_sec),
            max_retries: pf.max_retries.unwrap_or(defaults.max_retries),
            ffmpeg_threads: pf.ffmpeg_threads.unwrap_or(defaults.ffmpeg_threads),
            separator_device: pf.separator_device.unwrap_or(defaults.separator_device),
            separator_jobs: pf.separator_jobs.unwrap_or(defaults.separator_jobs),
            library_organize: pf.library_organize.unwrap_or(defaults.library_organize),
            retain_workdir_on_failure: pf
                .retain_workdir_on_failure
                .unwrap_or(defaults.retain_workdir_on_failure),
        };
        if processing.chunk_seconds == 0 {
            bail!("chunk_seconds must be positive");
        }
        if processing.chunk_max == 0 {
            bail!("chunk_max must be positive");
        }
        if processing.chunk_overlap_sec < 0.0 {
            bail!("chunk_overlap_sec must be non-negative");
        }

        let vf = file.variants.unwrap_or_default();
        let variants = match vf.set {
            Some(raw) => {
                let mut set = Vec::new();
                for name in &raw {
                    match Variant::parse(name) {
                        Some(v) if !set.contains(&v) => set.push(v),
                        Some(_) => {}
                        None => bail!("unknown variant {:?}", name),
                    }
                }
                if set.is_empty() {
                    bail!("variants.set must not be empty");
                }
                VariantSettings {
                    set,
                    preserve_stems: vf.preserve_stems.unwrap_or(false),
                }
            }
            None => VariantSettings {
                preserve_stems: vf.preserve_stems.unwrap_or(false),
                ..VariantSettings::default()
            },
        };

        let corrupt_dest = match file.recovery.and_then(|r| r.corrupt_dest) {
            Some(raw) => match CorruptDest::parse(&raw) {
                Some(dest) => dest,
                None => bail!(
                    "invalid corrupt_dest {:?} (expected archive or quarantine)",
                    raw
                ),
            },
            None => CorruptDest::Archive,
        };

        let sf = file.sync.unwrap_or_default();
        let sync_defaults = SyncSettings::default();
        let method = match sf.method {
            Some(raw) => match SyncMethod::parse(&raw) {
                Some(m) => m,
                None => bail!(
                    "invalid sync method {:?} (expected rsync, s3, scp or local)",
                    raw
                ),
            },
            None => sync_defaults.method,
        };
        let routes = sf
            .routes
            .unwrap_or_default()
            .into_iter()
            .map(|r| Route {
                kind: r.kind,
                variant: r.variant,
                to: r.to,
            })
            .collect();
        let sync = SyncSettings {
            method,
            remote_roots: sf.remote_roots.unwrap_or_default(),
            routes,
            skip_on_missing_remote: sf
                .skip_on_missing_remote
                .unwrap_or(sync_defaults.skip_on_missing_remote),
            dry_run: sf.dry_run.unwrap_or(cli.dry_run),
            poll_interval_sec: sf
                .poll_interval_sec
                .unwrap_or(sync_defaults.poll_interval_sec),
            rsync_bw_limit_kbps: sf
                .rsync_bw_limit_kbps
                .unwrap_or(sync_defaults.rsync_bw_limit_kbps),
            rsync_compress: sf.rsync_compress.unwrap_or(sync_defaults.rsync_compress),
            s3_bucket: sf.s3_bucket.unwrap_or(sync_defaults.s3_bucket),
            s3_prefix: sf.s3_prefix.unwrap_or(sync_defaults.s3_prefix),
            s3_region: sf.s3_region.unwrap_or(sync_defaults.s3_region),
            s3_endpoint: sf.s3_endpoint,
            scp_host: sf.scp_host.unwrap_or(sync_defaults.scp_host),
            scp_user: sf.scp_user.unwrap_or(sync_defaults.scp_user),
            scp_key: sf.scp_key.unwrap_or(sync_defaults.scp_key),
        };
        if sync.method == SyncMethod::S3 && sync.s3_bucket.is_empty() {
            bail!("sync method s3 requires s3_bucket");
        }
        if sync.method == SyncMethod::Scp && (sync.scp_host.is_empty() || sync.scp_user.is_empty())
        {
            bail!("sync method scp requires scp_host and scp_user");
        }

        Ok(Self {
            incoming,
            working,
            outputs_dir,
            music_library,
            archive_dir,
            quarantine_dir,
            log_dir,
            db_path,
            queues,
            processing,
            variants,
            corrupt_dest,
            sync,
        })
    }

    /// Directory holding lock files and other engine state.
    pub fn state_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn singleton_lock_path(&self) -> PathBuf {
        self.state_dir().join("processor.pid")
    }

    /// Destination root for corrupt inputs per `corrupt_dest`.
    pub fn corrupt_dest_root(&self) -> PathBuf {
        match self.corrupt_dest {
            CorruptDest::Archive => self.archive_dir.join("rejects"),
            CorruptDest::Quarantine => self.quarantine_dir.clone(),
        }
    }

    /// The ID3 comment recorded on every encoded artifact.
    pub fn tag_comment(&self) -> String {
        format!(
            "[INST_DBO__model-{}__sr-{}__bit-{}]",
            self.processing.model, self.processing.sample_rate, self.processing.bit_depth
        )
    }
}

fn default_queues() -> Vec<QueueRoot> {
    vec![
        QueueRoot {
            name: "youtube_audio".to_string(),
            root: PathBuf::from("/queues/youtube_audio"),
        },
        QueueRoot {
            name: "youtube_video".to_string(),
            root: PathBuf::from("/queues/youtube_video"),
        },
        QueueRoot {
            name: "other".to_string(),
            root: PathBuf::from("/queues/other"),
        },
    ]
}

/// Ensure all configured directories exist.
pub fn ensure_dirs(config: &AppConfig) -> std::io::Result<()> {
    for dir in [
        &config.incoming,
        &config.working,
        &config.outputs_dir,
        &config.archive_dir,
        &config.quarantine_dir,
        &config.log_dir,
        &config.state_dir(),
    ] {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let config = AppConfig::resolve(&CliConfig::default(), None).unwrap();
        assert_eq!(config.incoming, PathBuf::from("/data/incoming"));
        assert_eq!(config.processing.model, "htdemucs");
        assert_eq!(config.processing.chunk_seconds, 120);
        assert_eq!(config.processing.mp3_encoding, Mp3Encoding::V0);
        assert_eq!(config.variants.set, vec![Variant::Instrumental]);
        assert!(!config.variants.needs_full_stems());
        assert_eq!(config.corrupt_dest, CorruptDest::Archive);
        assert_eq!(config.queues.len(), 3);
        assert_eq!(config.queues[0].name, "youtube_audio");
    }

    #[test]
    fn test_file_overrides_cli() {
        let cli = CliConfig {
            incoming: Some(PathBuf::from("/cli/incoming")),
            ..Default::default()
        };
        let file = FileConfig {
            incoming: Some("/toml/incoming".to_string()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.incoming, PathBuf::from("/toml/incoming"));
    }

    #[test]
    fn test_cli_used_when_file_silent() {
        let cli = CliConfig {
            outputs_dir: Some(PathBuf::from("/cli/outputs")),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(FileConfig::default())).unwrap();
        assert_eq!(config.outputs_dir, PathBuf::from("/cli/outputs"));
    }

    #[test]
    fn test_invalid_mp3_encoding_rejected() {
        let file: FileConfig = toml::from_str(
            r#"
            [processing]
            mp3_encoding = "vbr9"
        "#,
        )
        .unwrap();
        let result = AppConfig::resolve(&CliConfig::default(), Some(file));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_variant_rejected() {
        let file: FileConfig = toml::from_str(
            r#"
            [variants]
            set = ["instrumental", "vocals_only"]
        "#,
        )
        .unwrap();
        let result = AppConfig::resolve(&CliConfig::default(), Some(file));
        assert!(result.is_err());
    }

    #[test]
    fn test_full_stems_needed_for_extra_variants() {
        let file: FileConfig = toml::from_str(
            r#"
            [variants]
            set = ["instrumental", "drums_only"]
        "#,
        )
        .unwrap();
        let config = AppConfig::resolve(&CliConfig::default(), Some(file)).unwrap();
        assert!(config.variants.needs_full_stems());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let file: FileConfig = toml::from_str(
            r#"
            [sync]
            method = "s3"
        "#,
        )
        .unwrap();
        assert!(AppConfig::resolve(&CliConfig::default(), Some(file)).is_err());
    }

    #[test]
    fn test_tag_comment_format() {
        let config = AppConfig::resolve(&CliConfig::default(), None).unwrap();
        assert_eq!(
            config.tag_comment(),
            "[INST_DBO__model-htdemucs__sr-44100__bit-16]"
        );
    }

    #[test]
    fn test_corrupt_dest_root() {
        let file: FileConfig = toml::from_str(
            r#"
            [recovery]
            corrupt_dest = "quarantine"
        "#,
        )
        .unwrap();
        let config = AppConfig::resolve(&CliConfig::default(), Some(file)).unwrap();
        assert_eq!(config.corrupt_dest_root(), PathBuf::from("/data/quarantine"));

        let config = AppConfig::resolve(&CliConfig::default(), None).unwrap();
        assert_eq!(
            config.corrupt_dest_root(),
            PathBuf::from("/data/archive/rejects")
        );
    }
}
