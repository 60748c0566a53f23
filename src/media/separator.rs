//! Vocal-separation tool adapter.
//!
//! Runs the external separator on one chunk under a wall-clock timeout and
//! locates its outputs. The adapter never retries; retry policy lives in the
//! processor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Accompaniment file names emitted by known separator versions, in
/// preference order. First match wins.
const ACCOMPANIMENT_CANDIDATES: &[&str] = &["no_vocals.wav", "accompaniment.wav", "other.wav"];

/// Errors from a single separation attempt.
#[derive(Debug, Error)]
pub enum SeparatorError {
    #[error("separation timed out after {0}s")]
    SeparationTimeout(u64),

    #[error("separation failed: {0}")]
    SeparationFailed(String),

    #[error("separator produced no acceptable output in {0}")]
    OutputMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The four stems of a full separation.
#[derive(Debug, Clone)]
pub struct StemSet {
    pub vocals: PathBuf,
    pub drums: PathBuf,
    pub bass: PathBuf,
    pub other: PathBuf,
}

impl StemSet {
    /// Stems making up the named combination.
    pub fn instrumental(&self) -> Vec<PathBuf> {
        vec![self.drums.clone(), self.bass.clone(), self.other.clone()]
    }

    pub fn no_drums(&self) -> Vec<PathBuf> {
        vec![self.bass.clone(), self.other.clone()]
    }

    pub fn drums_only(&self) -> Vec<PathBuf> {
        vec![self.drums.clone()]
    }
}

/// Adapter for the external separation tool.
#[derive(Debug, Clone)]
pub struct Separator {
    model: String,
    device: String,
    jobs: u32,
}

impl Separator {
    pub fn new(model: &str, device: &str, jobs: u32) -> Self {
        Self {
            model: model.to_string(),
            device: device.to_string(),
            jobs: jobs.max(1),
        }
    }

    /// Run the tool bounded by `timeout_sec` (0 means no bound).
    async fn run(&self, mut cmd: Command, timeout_sec: u64) -> Result<(), SeparatorError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = if timeout_sec == 0 {
            cmd.output().await?
        } else {
            match tokio::time::timeout(Duration::from_secs(timeout_sec), cmd.output()).await {
                Ok(result) => result?,
                Err(_) => return Err(SeparatorError::SeparationTimeout(timeout_sec)),
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(SeparatorError::SeparationFailed(message));
        }
        Ok(())
    }

    /// Separate one chunk into accompaniment + vocals and return the
    /// accompaniment WAV.
    pub async fn separate(
        &self,
        chunk_wav: &Path,
        out_dir: &Path,
        timeout_sec: u64,
    ) -> Result<PathBuf, SeparatorError> {
        tokio::fs::create_dir_all(out_dir).await?;

        let mut cmd = Command::new("demucs");
        cmd.arg("-n")
            .arg(&self.model)
            .args(["--two-stems", "vocals"])
            .arg("-o")
            .arg(out_dir)
            .args(["--device", &self.device])
            .arg("--jobs")
            .arg(self.jobs.to_string())
            .arg(chunk_wav);

        self.run(cmd, timeout_sec).await?;
        find_accompaniment(out_dir, &self.model)
            .ok_or_else(|| SeparatorError::OutputMissing(out_dir.to_path_buf()))
    }

    /// Separate one chunk into all four stems.
    pub async fn separate_stems(
        &self,
        chunk_wav: &Path,
        out_dir: &Path,
        timeout_sec: u64,
    ) -> Result<StemSet, SeparatorError> {
        tokio::fs::create_dir_all(out_dir).await?;

        let mut cmd = Command::new("demucs");
        cmd.arg("-n")
            .arg(&self.model)
            .arg("-o")
            .arg(out_dir)
            .args(["--device", &self.device])
            .arg("--jobs")
            .arg(self.jobs.to_string())
            .arg(chunk_wav);

        self.run(cmd, timeout_sec).await?;

        let locate = |name: &str| {
            find_named_wav(out_dir, &format!("{name}.wav"))
                .ok_or_else(|| SeparatorError::OutputMissing(out_dir.to_path_buf()))
        };
        Ok(StemSet {
            vocals: locate("vocals")?,
            drums: locate("drums")?,
            bass: locate("bass")?,
            other: locate("other")?,
        })
    }
}

/// Locate the accompaniment stem under `out_dir`.
///
/// Output layout varies by tool version: `out_dir/<model>/<base>/...` or
/// directly under `out_dir`. The model directory is preferred, then the
/// whole tree is searched for each candidate name in order.
fn find_accompaniment(out_dir: &Path, model: &str) -> Option<PathBuf> {
    let model_dir = out_dir.join(model);
    if model_dir.is_dir() {
        for name in ACCOMPANIMENT_CANDIDATES {
            if let Some(found) = find_named_wav(&model_dir, name) {
                debug!("separator output located: {}", found.display());
                return Some(found);
            }
        }
    }
    for name in ACCOMPANIMENT_CANDIDATES {
        if let Some(found) = find_named_wav(out_dir, name) {
            debug!("separator output located: {}", found.display());
            return Some(found);
        }
    }
    None
}

/// Depth-first search for a file with the exact given name.
fn find_named_wav(root: &Path, name: &str) -> Option<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let mut subdirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                subdirs.push(path);
            } else if path.file_name().map(|n| n == name).unwrap_or(false) {
                return Some(path);
            }
        }
        // Deterministic traversal order.
        subdirs.sort();
        stack.extend(subdirs.into_iter().rev());
    }
    None
}
