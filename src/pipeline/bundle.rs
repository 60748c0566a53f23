//! Job bundle schema.
//!
//! A bundle is the standardized handoff from retrievers: a directory with a
//! `job.json` plus payload files. Retrievers write bundles under a temporary
//! suffix and rename them into place, so a visible bundle is complete.
//!
//! Unknown `job.json` keys are retriever provenance and are preserved
//! verbatim into the manifest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::Variant;

/// Errors loading or validating a bundle.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("schema: {0}")]
    Schema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed `job.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBundle {
    pub job_id: String,
    pub source_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Single-track audio payload, relative to the bundle directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    /// Ordered track list for album bundles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_path: Option<String>,

    /// Requested variant set; defaults to the engine configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<String>>,

    /// Retriever-specific provenance, preserved verbatim.
    #[serde(flatten)]
    pub provenance: serde_json::Map<String, Value>,
}

impl JobBundle {
    /// Load and validate `job.json` from a bundle directory.
    pub fn load(bundle_dir: &Path) -> Result<Self, BundleError> {
        let job_json = bundle_dir.join("job.json");
        let raw = std::fs::read_to_string(&job_json)?;
        let bundle: JobBundle = serde_json::from_str(&raw)
            .map_err(|e| BundleError::Schema(format!("invalid job.json: {e}")))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.job_id.trim().is_empty() {
            return Err(BundleError::Schema("job_id is empty".to_string()));
        }
        if self.job_id.contains('/') || self.job_id.contains('\0') || self.job_id == ".." {
            return Err(BundleError::Schema(format!(
                "job_id is not filesystem-safe: {:?}",
                self.job_id
            )));
        }
        if self.source_type.trim().is_empty() {
            return Err(BundleError::Schema("source_type is empty".to_string()));
        }
        if self.audio_path.is_none()
            && self.audio_files.as_ref().map(|f| f.is_empty()).unwrap_or(true)
            && self.video_path.is_none()
        {
            return Err(BundleError::Schema(
                "bundle has neither audio_path, audio_files nor video_path".to_string(),
            ));
        }
        if let (Some(_), Some(_)) = (&self.audio_path, &self.audio_files) {
            return Err(BundleError::Schema(
                "audio_path and audio_files are mutually exclusive".to_string(),
            ));
        }
        for rel in self.relative_paths() {
            if Path::new(&rel).is_absolute() || rel.split('/').any(|c| c == "..") {
                return Err(BundleError::Schema(format!(
                    "payload path escapes the bundle: {rel:?}"
                )));
            }
        }
        if let Some(variants) = &self.variants {
            for name in variants {
                if Variant::parse(name).is_none() {
                    return Err(BundleError::Schema(format!("unknown variant {name:?}")));
                }
            }
        }
        Ok(())
    }

    fn relative_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(p) = &self.audio_path {
            paths.push(p.clone());
        }
        if let Some(files) = &self.audio_files {
            paths.extend(files.iter().cloned());
        }
        if let Some(p) = &self.video_path {
            paths.push(p.clone());
        }
        if let Some(p) = &self.cover_path {
            paths.push(p.clone());
        }
        paths
    }

    /// True when this bundle carries an ordered multi-track payload.
    pub fn is_album(&self) -> bool {
        self.audio_files.as_ref().map(|f| f.len() > 1).unwrap_or(false)
    }

    /// Resolve the ordered audio sources against the bundle directory.
    pub fn audio_sources(&self, bundle_dir: &Path) -> Vec<PathBuf> {
        if let Some(files) = &self.audio_files {
            files.iter().map(|f| bundle_dir.join(f)).collect()
        } else if let Some(audio) = &self.audio_path {
            vec![bundle_dir.join(audio)]
        } else {
            Vec::new()
        }
    }

    pub fn video_source(&self, bundle_dir: &Path) -> Option<PathBuf> {
        self.video_path.as_ref().map(|p| bundle_dir.join(p))
    }

    pub fn cover_source(&self, bundle_dir: &Path) -> Option<PathBuf> {
        self.cover_path.as_ref().map(|p| bundle_dir.join(p))
    }

    /// Requested variants, or `None` when the engine default applies.
    pub fn requested_variants(&self) -> Option<Vec<Variant>> {
        self.variants.as_ref().map(|names| {
            let mut set = Vec::new();
            for name in names {
                if let Some(v) = Variant::parse(name) {
                    if !set.contains(&v) {
                        set.push(v);
                    }
                }
            }
            set
        })
    }

    /// Exclusion key for the album lock: bundles of the same album share it.
    pub fn album_key(&self, bundle_dir: &Path) -> String {
        match (&self.artist, &self.album) {
            (Some(artist), Some(album)) if !artist.is_empty() && !album.is_empty() => {
                format!(
                    "{}:{}:{}",
                    self.source_type,
                    artist.to_lowercase(),
                    album.to_lowercase()
                )
            }
            _ => bundle_dir.to_string_lossy().into_owned(),
        }
    }
}
