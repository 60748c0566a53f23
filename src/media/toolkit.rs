//! ffprobe/ffmpeg adapter.
//!
//! Wraps every invocation of the probe/transcode tool behind typed results:
//! duration probing, exact-boundary WAV extraction, crossfaded
//! concatenation, stem mixing, MP3 encoding with ID3v2.3 tags and cover art,
//! and tag reading. Argument order is input-first throughout.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::Mp3Encoding;

/// Upper bound for any single ffmpeg/ffprobe invocation.
const TOOL_TIMEOUT_SEC: u64 = 3600;

/// Errors from the media toolkit.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The source has no usable stream; recoverable by quarantine.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    #[error("chunk extraction failed: {0}")]
    ExtractFailed(String),

    #[error("crossfade concat failed: {0}")]
    ConcatFailed(String),

    #[error("stem mix failed: {0}")]
    MixFailed(String),

    #[error("mp3 encode failed: {0}")]
    EncodeFailed(String),

    #[error("tool timed out after {0}s")]
    ToolTimeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Basic tags carried on a track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
}

impl TagSet {
    pub fn is_complete(&self) -> bool {
        self.artist.is_some() && self.album.is_some() && self.title.is_some()
    }

    /// Fill missing fields from another tag set.
    pub fn merge_missing(&mut self, other: &TagSet) {
        if self.artist.is_none() {
            self.artist = other.artist.clone();
        }
        if self.album.is_none() {
            self.album = other.album.clone();
        }
        if self.title.is_none() {
            self.title = other.title.clone();
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    tags: Option<ProbeTags>,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    artist: Option<String>,
    album: Option<String>,
    title: Option<String>,
}

fn parse_probe_duration(raw: &str) -> Result<f64, MediaError> {
    let probe: ProbeOutput = serde_json::from_str(raw)
        .map_err(|e| MediaError::CorruptInput(format!("unparsable probe output: {e}")))?;
    probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .ok_or_else(|| MediaError::CorruptInput("no usable duration in probe output".to_string()))
}

fn parse_probe_tags(raw: &str) -> TagSet {
    let probe: ProbeOutput = match serde_json::from_str(raw) {
        Ok(p) => p,
        Err(_) => return TagSet::default(),
    };
    let tags = match probe.format.and_then(|f| f.tags) {
        Some(t) => t,
        None => return TagSet::default(),
    };
    let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    TagSet {
        artist: clean(tags.artist),
        album: clean(tags.album),
        title: clean(tags.title),
    }
}

/// Adapter for the probe/transcode tool.
#[derive(Debug, Clone)]
pub struct MediaToolkit {
    sample_rate: u32,
    /// ffmpeg `-threads` cap; 0 lets the tool decide.
    threads: u32,
}

impl MediaToolkit {
    pub fn new(sample_rate: u32, threads: u32) -> Self {
        Self {
            sample_rate,
            threads,
        }
    }

    /// Run a tool invocation bounded by [`TOOL_TIMEOUT_SEC`].
    async fn run(&self, mut cmd: Command) -> Result<std::process::Output, MediaError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        match tokio::time::timeout(Duration::from_secs(TOOL_TIMEOUT_SEC), cmd.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MediaError::ToolTimeout(TOOL_TIMEOUT_SEC)),
        }
    }

    fn thread_args(&self, cmd: &mut Command) {
        if self.threads > 0 {
            cmd.arg("-threads").arg(self.threads.to_string());
        }
    }

    /// Probe a source's duration in seconds.
    pub async fn probe_duration(&self, path: &Path) -> Result<f64, MediaError> {
        let mut cmd = Command::new("ffprobe");
        cmd.args(["-v", "error", "-show_entries", "format=duration", "-of", "json"])
            .arg(path);
        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::CorruptInput(stderr.trim().to_string()));
        }
        parse_probe_duration(&String::from_utf8_lossy(&output.stdout))
    }

    /// Read container-level tags; unreadable files yield an empty set.
    pub async fn read_tags(&self, path: &Path) -> TagSet {
        let mut cmd = Command::new("ffprobe");
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format_tags=artist,album,title",
            "-of",
            "json",
        ])
        .arg(path);
        match self.run(cmd).await {
            Ok(output) if output.status.success() => {
                parse_probe_tags(&String::from_utf8_lossy(&output.stdout))
            }
            _ => TagSet::default(),
        }
    }

    /// Extract an exact-boundary WAV slice.
    pub async fn extract_chunk(
        &self,
        src: &Path,
        out: &Path,
        start_sec: f64,
        duration_sec: f64,
    ) -> Result<(), MediaError> {
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-ss")
            .arg(format!("{start_sec:.3}"))
            .arg("-t")
            .arg(format!("{duration_sec:.3}"))
            .arg("-i")
            .arg(src)
            .args(["-c:a", "pcm_s16le", "-ar"])
            .arg(self.sample_rate.to_string());
        self.thread_args(&mut cmd);
        cmd.arg(out);
        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::ExtractFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Concatenate parts with equal-power crossfades of `fade_ms` at each of
    /// the N−1 joins. Lossless WAV in, WAV out.
    pub async fn crossfade_concat(
        &self,
        parts: &[PathBuf],
        out: &Path,
        fade_ms: u32,
    ) -> Result<(), MediaError> {
        if parts.is_empty() {
            return Err(MediaError::ConcatFailed("no parts to concat".to_string()));
        }
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if parts.len() == 1 {
            tokio::fs::copy(&parts[0], out).await?;
            return Ok(());
        }

        let fade_sec = f64::from(fade_ms) / 1000.0;
        let work_parent = out.parent().unwrap_or_else(|| Path::new("."));
        let mut current = parts[0].clone();
        for (i, next) in parts.iter().enumerate().skip(1) {
            let step_out = work_parent.join(format!("_xf_{i:03}.wav"));
            let mut cmd = Command::new("ffmpeg");
            cmd.arg("-y")
                .arg("-i")
                .arg(&current)
                .arg("-i")
                .arg(next)
                .arg("-filter_complex")
                .arg(format!("acrossfade=d={fade_sec:.3}:c1=qsin:c2=qsin"));
            self.thread_args(&mut cmd);
            cmd.arg(&step_out);
            let output = self.run(cmd).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(MediaError::ConcatFailed(stderr.trim().to_string()));
            }
            current = step_out;
        }
        tokio::fs::rename(&current, out).await?;
        // Intermediate crossfade files are inside the work area and removed
        // with it; delete eagerly anyway to keep peak disk usage down.
        for i in 1..parts.len() - 1 {
            let _ = tokio::fs::remove_file(work_parent.join(format!("_xf_{i:03}.wav"))).await;
        }
        Ok(())
    }

    /// Mix stem WAVs into a single PCM track without normalization.
    pub async fn mix_stems(&self, stems: &[PathBuf], out: &Path) -> Result<(), MediaError> {
        if stems.is_empty() {
            return Err(MediaError::MixFailed("no stems selected".to_string()));
        }
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if stems.len() == 1 {
            tokio::fs::copy(&stems[0], out).await?;
            return Ok(());
        }
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y");
        for stem in stems {
            cmd.arg("-i").arg(stem);
        }
        cmd.arg("-filter_complex")
            .arg(format!("amix=inputs={}:normalize=0", stems.len()))
            .args(["-c:a", "pcm_s16le"]);
        self.thread_args(&mut cmd);
        cmd.arg(out);
        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::MixFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Encode a WAV to MP3 with ID3v2.3 tags, comment and optional cover.
    #[allow(clippy::too_many_arguments)]
    pub async fn encode_mp3(
        &self,
        src_wav: &Path,
        out: &Path,
        mode: Mp3Encoding,
        tags: &TagSet,
        comment: &str,
        cover: Option<&Path>,
    ) -> Result<(), MediaError> {
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let cover = cover.filter(|c| c.exists());

        // Inputs first, then mapping, then encoding and tags.
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y").arg("-i").arg(src_wav);
        if let Some(cover) = cover {
            cmd.arg("-i").arg(cover);
            cmd.args([
                "-map",
                "0:a",
                "-map",
                "1:v",
                "-disposition:v",
                "attached_pic",
                "-metadata:s:v",
                "title=Album cover",
                "-metadata:s:v",
                "comment=Cover (front)",
            ]);
        } else {
            cmd.args(["-map", "0:a"]);
        }
        cmd.args(["-c:a", "libmp3lame"]);
        match mode {
            Mp3Encoding::Cbr320 => {
                cmd.args(["-b:a", "320k"]);
            }
            Mp3Encoding::V0 => {
                cmd.args(["-q:a", "0"]);
            }
        }
        cmd.args(["-id3v2_version", "3"]);
        cmd.arg("-metadata")
            .arg(format!("artist={}", tags.artist.as_deref().unwrap_or("Unknown")));
        cmd.arg("-metadata")
            .arg(format!("album={}", tags.album.as_deref().unwrap_or("Unknown")));
        cmd.arg("-metadata")
            .arg(format!("title={}", tags.title.as_deref().unwrap_or("Unknown")));
        cmd.arg("-metadata").arg(format!("comment={comment}"));
        self.thread_args(&mut cmd);
        cmd.arg(out);

        let output = self.run(cmd).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::EncodeFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    /// Extract the first attached picture from a source, if any.
    pub async fn extract_embedded_art(
        &self,
        src: &Path,
        out_img: &Path,
    ) -> Result<Option<PathBuf>, MediaError> {
        if let Some(parent) = out_img.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(src)
            .args(["-an", "-vcodec", "copy", "-map", "0:v:0"])
            .arg(out_img);
        let output = self.run(cmd).await?;
        let produced = output.status.success()
            && out_img.exists()
            && std::fs::metadata(out_img).map(|m| m.len() > 0).unwrap_or(false);
        if produced {
            Ok(Some(out_img.to_path_buf()))
        } else {
            debug!("no embedded art in {}", src.display());
            let _ = std::fs::remove_file(out_img);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_duration() {
        let raw = r#"{"format": {"duration": "180.480000"}}"#;
        let duration = parse_probe_duration(raw).unwrap();
        assert!((duration - 180.48).abs() < 1e-9);
    }

    #[test]
    fn test_parse_probe_duration_missing_is_corrupt() {
        assert!(matches!(
            parse_probe_duration(r#"{"format": {}}"#),
            Err(MediaError::CorruptInput(_))
        ));
        assert!(matches!(
            parse_probe_duration("{}"),
            Err(MediaError::CorruptInput(_))
        ));
        assert!(matches!(
            parse_probe_duration("not json"),
            Err(MediaError::CorruptInput(_))
        ));
    }

    #[test]
    fn test_parse_probe_duration_zero_is_corrupt() {
        let raw = r#"{"format": {"duration": "0.0"}}"#;
        assert!(matches!(
            parse_probe_duration(raw),
            Err(MediaError::CorruptInput(_))
        ));
    }

    #[test]
    fn test_parse_probe_tags() {
        let raw = r#"{"format": {"tags": {"artist": "Ch", "album": "YTDL", "title": " Song "}}}"#;
        let tags = parse_probe_tags(raw);
        assert_eq!(tags.artist.as_deref(), Some("Ch"));
        assert_eq!(tags.album.as_deref(), Some("YTDL"));
        // Whitespace around tag values is trimmed.
        assert_eq!(tags.title.as_deref(), Some("Song"));
        assert!(tags.is_complete());
    }

    #[test]
    fn test_parse_probe_tags_empty_values_dropped() {
        let raw = r#"{"format": {"tags": {"artist": "", "title": "X"}}}"#;
        let tags = parse_probe_tags(raw);
        assert!(tags.artist.is_none());
        assert_eq!(tags.title.as_deref(), Some("X"));
        assert!(!tags.is_complete());
    }

    #[test]
    fn test_tagset_merge_missing() {
        let mut tags = TagSet {
            artist: Some("A".to_string()),
            album: None,
            title: None,
        };
        tags.merge_missing(&TagSet {
            artist: Some("B".to_string()),
            album: Some("Alb".to_string()),
            title: None,
        });
        assert_eq!(tags.artist.as_deref(), Some("A"));
        assert_eq!(tags.album.as_deref(), Some("Alb"));
        assert!(tags.title.is_none());
    }
}
