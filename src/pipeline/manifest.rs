//! Job manifest: the post-processing record of all artifacts.
//!
//! A manifest references only files that exist under the job output root at
//! commit time, is written exactly once, and uses a deterministic encoding
//! (sorted keys, UTF-8, newline-terminated) so downstream consumers can
//! fingerprint it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Errors building or saving a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("artifact path does not resolve to a file: {0}")]
    ArtifactMissing(String),

    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One produced file, classified by `(kind, variant)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// `audio | video | stem | cover | metadata`.
    pub kind: String,
    /// `instrumental | no_drums | drums_only | source | ...`.
    pub variant: String,
    /// Human-readable label.
    pub label: String,
    /// Relative to the job output root.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// The manifest committed after processing one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub source_type: String,
    /// ISO-8601 UTC, second precision.
    pub processed_at: String,
    pub artist: String,
    pub album: String,
    pub title: String,
    pub artifacts: Vec<Artifact>,
    pub stems_generated: bool,
    pub stems_preserved: bool,

    /// Provenance copied verbatim from the bundle.
    #[serde(flatten)]
    pub provenance: serde_json::Map<String, Value>,
}

/// Fields a manifest must carry to be routable.
const REQUIRED_FIELDS: &[&str] = &[
    "job_id",
    "source_type",
    "processed_at",
    "artist",
    "album",
    "title",
    "artifacts",
    "stems_generated",
    "stems_preserved",
];

impl JobManifest {
    /// Current UTC timestamp in the manifest's `processed_at` format.
    pub fn now_timestamp() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    /// Deterministic encoding: keys sorted, UTF-8, newline-terminated.
    ///
    /// serde_json maps are BTree-backed, so converting through `Value`
    /// sorts every object's keys.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        let value = serde_json::to_value(self)?;
        let mut bytes = serde_json::to_vec_pretty(&value)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Verify every artifact resolves to an existing regular file under the
    /// job output root, then write `manifest.json` atomically into it.
    pub fn save(&self, job_dir: &Path) -> Result<std::path::PathBuf, ManifestError> {
        for artifact in &self.artifacts {
            let resolved = job_dir.join(&artifact.path);
            if !resolved.is_file() {
                return Err(ManifestError::ArtifactMissing(artifact.path.clone()));
            }
        }
        let bytes = self.to_canonical_bytes()?;
        let staged = job_dir.join(".manifest.json.tmp");
        fs::write(&staged, &bytes)?;
        let f = fs::File::open(&staged)?;
        f.sync_all()?;
        let final_path = job_dir.join("manifest.json");
        fs::rename(&staged, &final_path)?;
        Ok(final_path)
    }

    /// Validate a parsed manifest against the routing contract.
    ///
    /// Returns the missing or malformed field on failure.
    pub fn validate_value(value: &Value) -> Result<(), String> {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => return Err("manifest is not an object".to_string()),
        };
        for field in REQUIRED_FIELDS {
            if !obj.contains_key(*field) {
                return Err(format!("missing field {field}"));
            }
        }
        let artifacts = match obj["artifacts"].as_array() {
            Some(artifacts) => artifacts,
            None => return Err("artifacts is not an array".to_string()),
        };
        for (i, artifact) in artifacts.iter().enumerate() {
            let a = match artifact.as_object() {
                Some(a) => a,
                None => return Err(format!("artifacts[{i}] is not an object")),
            };
            for field in ["kind", "variant", "path"] {
                if !a.get(field).map(|v| v.is_string()).unwrap_or(false) {
                    return Err(format!("artifacts[{i}] missing {field}"));
                }
            }
        }
        Ok(())
    }
}

/// Streaming sha256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_manifest() -> JobManifest {
        JobManifest {
            job_id: "yt_AAA_audio".to_string(),
            source_type: "youtube".to_string(),
            processed_at: "2025-11-02T10:00:00Z".to_string(),
            artist: "Ch".to_string(),
            album: "YTDL".to_string(),
            title: "Song".to_string(),
            artifacts: vec![Artifact {
                kind: "audio".to_string(),
                variant: "instrumental".to_string(),
                label: "Instrumental".to_string(),
                path: "files/instrumental.mp3".to_string(),
                codec: Some("mp3".to_string()),
                container: Some("mp3".to_string()),
                duration_sec: Some(180.0),
                sha256: None,
            }],
            stems_generated: false,
            stems_preserved: false,
            provenance: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_canonical_encoding_sorted_and_newline_terminated() {
        let bytes = sample_manifest().to_canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with('\n'));

        // Top-level keys appear in sorted order.
        let album_pos = text.find("\"album\"").unwrap();
        let artifacts_pos = text.find("\"artifacts\"").unwrap();
        let job_id_pos = text.find("\"job_id\"").unwrap();
        let title_pos = text.find("\"title\"").unwrap();
        assert!(album_pos < artifacts_pos);
        assert!(artifacts_pos < job_id_pos);
        assert!(job_id_pos < title_pos);
    }

    #[test]
    fn test_canonical_encoding_deterministic() {
        let a = sample_manifest().to_canonical_bytes().unwrap();
        let b = sample_manifest().to_canonical_bytes().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_save_requires_artifacts_to_exist() {
        let dir = TempDir::new().unwrap();
        let manifest = sample_manifest();
        let result = manifest.save(dir.path());
        assert!(matches!(result, Err(ManifestError::ArtifactMissing(_))));

        fs::create_dir_all(dir.path().join("files")).unwrap();
        fs::write(dir.path().join("files/instrumental.mp3"), b"mp3").unwrap();
        let path = manifest.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("manifest.json"));
        assert!(path.exists());
        assert!(!dir.path().join(".manifest.json.tmp").exists());
    }

    #[test]
    fn test_provenance_round_trip() {
        let mut manifest = sample_manifest();
        manifest.provenance.insert(
            "youtube".to_string(),
            serde_json::json!({"video_id": "AAA", "url": "https://example.invalid"}),
        );
        let bytes = manifest.to_canonical_bytes().unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["youtube"]["video_id"], "AAA");
        JobManifest::validate_value(&parsed).unwrap();
    }

    #[test]
    fn test_validate_value_missing_fields() {
        let value = serde_json::json!({"job_id": "x"});
        let err = JobManifest::validate_value(&value).unwrap_err();
        assert!(err.contains("missing field"));

        let mut manifest = serde_json::to_value(sample_manifest()).unwrap();
        manifest["artifacts"][0].as_object_mut().unwrap().remove("path");
        let err = JobManifest::validate_value(&manifest).unwrap_err();
        assert!(err.contains("missing path"));
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
