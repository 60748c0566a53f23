//! End-to-end job execution.
//!
//! One claimed bundle at a time: resolve metadata, plan chunks, separate,
//! merge with crossfades, encode and tag, publish atomically, commit the
//! manifest and archive the source. Failures map to dispositions; nothing
//! is swallowed below this level.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunk::{plan_chunks, ChunkPlan, PlanError};
use super::manifest::{sha256_file, Artifact, JobManifest};
use super::metadata::{find_cover_in_dir, resolve_tags, ResolvedTags};
use super::queue::{ClaimedJob, Disposition, InvalidBundle, QueueConsumer, QueueError};
use super::variants::{album_output_filename, output_filename, stem_sources};
use crate::config::{AppConfig, Variant};
use crate::events::{Event, EventLog};
use crate::fsutil::{self, FsError, ScopedWorkdir};
use crate::locks::{AlbumLock, LockError};
use crate::media::{MediaError, MediaToolkit, Separator, SeparatorError, StemSet, TagSet};

/// Sleep between queue scans when nothing is claimable.
const IDLE_POLL: Duration = Duration::from_secs(2);

/// Job-level failure, mapped to a disposition by the top-level loop.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Source unreadable or structurally invalid; recovered by moving the
    /// source aside rather than archiving it as failed.
    #[error("corrupt input: {0}")]
    Corrupt(String),

    /// Chunk separation exhausted its retries.
    #[error("separation failed on chunk {chunk_index}: {error}")]
    Separation { chunk_index: usize, error: String },

    #[error("extract failed: {0}")]
    Extract(String),

    #[error("encode failed: {0}")]
    Encode(String),

    /// Atomic publish collided with an existing output of the same job id.
    #[error("duplicate output for job: {0}")]
    Duplicate(String),

    #[error("publish failed: {0}")]
    Publish(String),

    /// Cooperative shutdown: the job stays in the working area.
    #[error("interrupted by shutdown")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Archive disposition reason for this failure.
    fn reason(&self) -> &'static str {
        match self {
            ProcessError::Corrupt(_) => "corrupt",
            ProcessError::Separation { .. } => "separation",
            ProcessError::Extract(_) => "extract",
            ProcessError::Encode(_) => "encode",
            ProcessError::Duplicate(_) => "duplicate",
            ProcessError::Publish(_) => "publish",
            ProcessError::Interrupted => "interrupted",
            ProcessError::Io(_) => "io",
        }
    }
}

/// Artifacts and metadata produced for one track.
struct TrackResult {
    artifacts: Vec<Artifact>,
    resolved: ResolvedTags,
    duration_sec: f64,
    chunk_count: usize,
}

/// The processing engine: claims bundles and runs them to completion.
pub struct Processor {
    config: AppConfig,
    toolkit: MediaToolkit,
    separator: Separator,
    consumer: QueueConsumer,
    events: Arc<EventLog>,
    /// Album key of the most recently finished job; queued siblings of that
    /// album take priority until it is exhausted.
    last_album: std::sync::Mutex<Option<String>>,
}

impl Processor {
    pub fn new(config: AppConfig, events: Arc<EventLog>) -> Self {
        let toolkit = MediaToolkit::new(
            config.processing.sample_rate,
            config.processing.ffmpeg_threads,
        );
        let separator = Separator::new(
            &config.processing.model,
            &config.processing.separator_device,
            config.processing.separator_jobs,
        );
        let consumer = QueueConsumer::new(
            config.queues.clone(),
            &config.working,
            &config.archive_dir,
        );
        Self {
            config,
            toolkit,
            separator,
            consumer,
            events,
            last_album: std::sync::Mutex::new(None),
        }
    }

    /// Long-running processor loop. Stops submitting new work once the
    /// shutdown token fires; the in-flight chunk finishes first.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("processor starting ({} queue roots)", self.config.queues.len());
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let progressed = self.process_next(&shutdown).await?;
            if !progressed {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
        info!("processor stopped");
        Ok(())
    }

    /// Claim and fully process one job. Returns false when nothing was
    /// claimable.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> anyhow::Result<bool> {
        // Jobs left in the working area by a previous run come first.
        if let Some(claimed) = self.consumer.resume_candidates().into_iter().next() {
            info!("resuming in-flight job {}", claimed.bundle.job_id);
            self.execute(claimed, shutdown).await;
            return Ok(true);
        }

        let discovery = self.consumer.discover();
        for invalid in discovery.invalid {
            self.quarantine_invalid(invalid);
        }
        if discovery.ready.is_empty() {
            return Ok(false);
        }

        // Queued siblings of the active album take priority over older
        // unrelated jobs until the album is exhausted. The on-disk lock
        // covers jobs interrupted mid-flight, which is how sequentiality
        // survives restarts.
        let ready = discovery.ready;
        let active_album = AlbumLock::current(&self.config.state_dir())
            .or_else(|| self.last_album.lock().unwrap_or_else(|p| p.into_inner()).clone());
        let start = active_album
            .and_then(|key| {
                ready
                    .iter()
                    .position(|job| job.bundle.album_key(&job.path) == key)
            })
            .unwrap_or(0);

        let (before, from_start) = ready.split_at(start);
        for job in from_start.iter().chain(before.iter()) {
            match self.consumer.claim(job.clone()) {
                Ok(claimed) => {
                    self.execute(claimed, shutdown).await;
                    return Ok(true);
                }
                Err(QueueError::ClaimLost(path)) => {
                    debug!("lost claim race for {}", path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Run one claimed job to a terminal disposition.
    async fn execute(&self, claimed: ClaimedJob, shutdown: &CancellationToken) {
        let job_id = claimed.bundle.job_id.clone();
        let state_dir = self.config.state_dir();
        let album_key = claimed.bundle.album_key(&claimed.path);

        let _album_lock = match AlbumLock::acquire(&state_dir, &album_key) {
            Ok(lock) => lock,
            Err(LockError::AlbumBusy(stale)) => {
                // The selection loop is sequential, so a different held key
                // can only be left over from a crash.
                warn!("replacing stale album lock for {}", stale);
                match AlbumLock::take_over(&state_dir, &album_key) {
                    Ok(lock) => lock,
                    Err(e) => {
                        warn!("cannot acquire album lock: {}", e);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("cannot acquire album lock: {}", e);
                return;
            }
        };

        *self.last_album.lock().unwrap_or_else(|p| p.into_inner()) = Some(album_key.clone());

        info!("processing job {} from queue {}", job_id, claimed.queue);
        let mut work = match ScopedWorkdir::create(&self.config.working.join(".work"), &job_id) {
            Ok(work) => work,
            Err(e) => {
                warn!("cannot create work directory for {}: {}", job_id, e);
                return;
            }
        };
        match self.process_job(&claimed, &work, shutdown).await {
            Ok(()) => {
                if let Err(e) = self.consumer.archive(&claimed, Disposition::Success) {
                    warn!("failed to archive job {}: {}", job_id, e);
                }
            }
            Err(ProcessError::Interrupted) => {
                // Extracted chunks are reused when the job resumes.
                work.retain();
                info!("job {} interrupted; left in working area", job_id);
            }
            Err(ProcessError::Corrupt(error)) => {
                if self.config.processing.retain_workdir_on_failure {
                    work.retain();
                }
                self.remove_stale_tmp(&job_id);
                self.set_aside_corrupt(&claimed.path, &error);
            }
            Err(e) => {
                if self.config.processing.retain_workdir_on_failure {
                    work.retain();
                }
                self.remove_stale_tmp(&job_id);
                let reason = e.reason().to_string();
                let event = Event::Failed {
                    job_id: job_id.clone(),
                    source: claimed.path.to_string_lossy().into_owned(),
                    reason: reason.clone(),
                    error: e.to_string(),
                };
                println!("[engine] {} job={job_id} reason={reason} error={e}", event.kind());
                self.events.emit(&event);
                if let Err(archive_err) = self
                    .consumer
                    .archive(&claimed, Disposition::Failed(reason))
                {
                    warn!("failed to archive job {}: {}", job_id, archive_err);
                }
            }
        }
    }

    /// Drop the staged output directory of a failed job.
    fn remove_stale_tmp(&self, job_id: &str) {
        let tmp = self.config.outputs_dir.join(format!("{job_id}.tmp"));
        if tmp.exists() {
            let _ = std::fs::remove_dir_all(&tmp);
        }
    }

    /// Move a source aside per `CORRUPT_DEST` and emit `skipped_corrupt`.
    fn set_aside_corrupt(&self, source: &Path, error: &str) {
        let dest_root = self.config.corrupt_dest_root();
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let dest = dest_root.join(name);
        let destination = match fsutil::safe_move(source, &dest) {
            Ok(()) => Some(dest.to_string_lossy().into_owned()),
            Err(e) => {
                warn!("failed to move corrupt source {}: {}", source.display(), e);
                None
            }
        };
        let event = Event::SkippedCorrupt {
            source: source.to_string_lossy().into_owned(),
            destination,
            error: error.to_string(),
        };
        println!(
            "[engine] {} source={} error={}",
            event.kind(),
            source.display(),
            error
        );
        self.events.emit(&event);
    }

    fn quarantine_invalid(&self, invalid: InvalidBundle) {
        self.set_aside_corrupt(&invalid.path, &format!("schema: {}", invalid.error));
    }

    /// Steps 1–12 for one claimed bundle.
    async fn process_job(
        &self,
        claimed: &ClaimedJob,
        work: &ScopedWorkdir,
        shutdown: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let bundle = &claimed.bundle;
        let job_id = &bundle.job_id;
        let started = Instant::now();

        let final_dir = self.config.outputs_dir.join(job_id);
        let tmp_dir = self.config.outputs_dir.join(format!("{job_id}.tmp"));
        if final_dir.exists() {
            return Err(ProcessError::Duplicate(job_id.clone()));
        }
        if tmp_dir.exists() {
            // Leftover from an interrupted publish; the job directory is
            // single-writer so rebuilding it is safe.
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        let files_dir = tmp_dir.join("files");
        std::fs::create_dir_all(&files_dir)?;

        debug!("job {}: RESOLVING", job_id);
        let cover = self.resolve_cover(claimed, work.path()).await;

        let variants = bundle
            .requested_variants()
            .unwrap_or_else(|| self.config.variants.set.clone());
        let full_stems = self.config.variants.preserve_stems
            || variants.iter().any(|v| !matches!(v, Variant::Instrumental));

        let sources = bundle.audio_sources(&claimed.path);
        let is_album = bundle.is_album();
        let mut artifacts: Vec<Artifact> = Vec::new();
        let mut first_resolved: Option<ResolvedTags> = None;
        let mut corrupt_errors: Vec<String> = Vec::new();
        let mut stems_preserved = false;

        for (track_index, source) in sources.iter().enumerate() {
            if shutdown.is_cancelled() {
                return Err(ProcessError::Interrupted);
            }
            let track_started = Instant::now();
            let result = self
                .process_track(
                    claimed,
                    source,
                    track_index,
                    is_album,
                    &variants,
                    full_stems,
                    cover.as_deref(),
                    &files_dir,
                    work.path(),
                    shutdown,
                )
                .await;
            match result {
                Ok(track) => {
                    self.events.emit(&Event::Processed {
                        job_id: job_id.clone(),
                        source: source.to_string_lossy().into_owned(),
                        artist: track.resolved.artist.clone(),
                        album: track.resolved.album.clone(),
                        title: track.resolved.title.clone(),
                        duration_sec: track.duration_sec,
                        chunk_count: track.chunk_count,
                        processing_time_sec: track_started.elapsed().as_secs_f64(),
                    });
                    if first_resolved.is_none() {
                        first_resolved = Some(track.resolved.clone());
                    }
                    artifacts.extend(track.artifacts);
                }
                Err(ProcessError::Corrupt(error)) if is_album => {
                    // One bad track does not sink the album; the file is set
                    // aside and the remaining tracks continue.
                    self.set_aside_corrupt(source, &error);
                    corrupt_errors.push(error);
                }
                Err(e) => return Err(e),
            }
        }

        if full_stems && self.config.variants.preserve_stems {
            stems_preserved = artifacts.iter().any(|a| a.kind == "stem");
        }

        // Video payload is carried through unprocessed.
        if let Some(video_src) = bundle.video_source(&claimed.path) {
            if video_src.is_file() {
                let ext = video_src
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mp4".to_string());
                let rel = format!("files/video.{ext}");
                std::fs::copy(&video_src, tmp_dir.join(&rel))?;
                artifacts.push(Artifact {
                    kind: "video".to_string(),
                    variant: "source".to_string(),
                    label: "Source video".to_string(),
                    path: rel.clone(),
                    codec: None,
                    container: Some(ext),
                    duration_sec: None,
                    sha256: sha256_file(&tmp_dir.join(&rel)).ok(),
                });
            }
        }

        if let Some(cover_src) = &cover {
            if cover_src.is_file() {
                let ext = cover_src
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase())
                    .unwrap_or_else(|| "jpg".to_string());
                let rel = format!("files/cover.{ext}");
                std::fs::copy(cover_src, tmp_dir.join(&rel))?;
                artifacts.push(Artifact {
                    kind: "cover".to_string(),
                    variant: "source".to_string(),
                    label: "Cover art".to_string(),
                    path: rel,
                    codec: None,
                    container: None,
                    duration_sec: None,
                    sha256: None,
                });
            }
        }

        if artifacts.is_empty() {
            let error = corrupt_errors
                .pop()
                .unwrap_or_else(|| "bundle produced no artifacts".to_string());
            return Err(ProcessError::Corrupt(error));
        }

        let resolved = first_resolved.unwrap_or_else(|| {
            resolve_tags(
                &TagSet {
                    artist: bundle.artist.clone(),
                    album: bundle.album.clone(),
                    title: bundle.title.clone(),
                },
                &claimed.path,
                None,
            )
        });

        debug!("job {}: PUBLISHING", job_id);
        match fsutil::publish_atomic(&tmp_dir, &final_dir) {
            Ok(()) => {}
            Err(FsError::PublishConflict(path)) => {
                return Err(ProcessError::Duplicate(path.to_string_lossy().into_owned()))
            }
            Err(e) => return Err(ProcessError::Publish(e.to_string())),
        }

        let manifest = JobManifest {
            job_id: job_id.clone(),
            source_type: bundle.source_type.clone(),
            processed_at: JobManifest::now_timestamp(),
            artist: resolved.artist.clone(),
            album: resolved.album.clone(),
            title: resolved.title.clone(),
            artifacts,
            stems_generated: full_stems,
            stems_preserved,
            provenance: bundle.provenance.clone(),
        };
        let manifest_path = manifest
            .save(&final_dir)
            .map_err(|e| ProcessError::Publish(e.to_string()))?;
        self.events.emit(&Event::ManifestWritten {
            job_id: job_id.clone(),
            path: manifest_path.to_string_lossy().into_owned(),
        });

        if self.config.processing.library_organize {
            if let Err(e) = self.organize_into_library(&manifest, &final_dir) {
                warn!("library organize failed for {}: {}", job_id, e);
            }
        }

        info!(
            "job {} published in {:.1}s",
            job_id,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Resolve cover art: bundle's cover, `cover.*` in the bundle directory,
    /// or the first attached picture of the first audio source.
    async fn resolve_cover(&self, claimed: &ClaimedJob, work: &Path) -> Option<PathBuf> {
        if let Some(cover) = claimed.bundle.cover_source(&claimed.path) {
            if cover.is_file() {
                return Some(cover);
            }
        }
        if let Some(found) = find_cover_in_dir(&claimed.path) {
            return Some(found);
        }
        let first_audio = claimed
            .bundle
            .audio_sources(&claimed.path)
            .into_iter()
            .next()?;
        self.toolkit
            .extract_embedded_art(&first_audio, &work.join("embedded_cover.jpg"))
            .await
            .ok()
            .flatten()
    }

    /// Chunk → separate → merge → variants → encode for one track.
    #[allow(clippy::too_many_arguments)]
    async fn process_track(
        &self,
        claimed: &ClaimedJob,
        source: &Path,
        track_index: usize,
        is_album: bool,
        variants: &[Variant],
        full_stems: bool,
        cover: Option<&Path>,
        files_dir: &Path,
        work: &Path,
        shutdown: &CancellationToken,
    ) -> Result<TrackResult, ProcessError> {
        let bundle = &claimed.bundle;
        let job_id = &bundle.job_id;
        let settings = &self.config.processing;

        if !source.is_file() {
            return Err(ProcessError::Corrupt(format!(
                "audio payload missing: {}",
                source.display()
            )));
        }

        // Step 1: metadata. Bundle metadata wins, then container tags, then
        // folder/filename heuristics.
        let mut hints = TagSet {
            artist: bundle.artist.clone(),
            album: bundle.album.clone(),
            title: if is_album { None } else { bundle.title.clone() },
        };
        hints.merge_missing(&self.toolkit.read_tags(source).await);
        let album_root = if is_album { Some(claimed.path.as_path()) } else { None };
        let resolved = resolve_tags(&hints, source, album_root);

        // Step 3: plan.
        let duration_sec = match self.toolkit.probe_duration(source).await {
            Ok(d) => d,
            Err(MediaError::CorruptInput(msg)) => return Err(ProcessError::Corrupt(msg)),
            Err(e) => return Err(ProcessError::Corrupt(e.to_string())),
        };
        let plan = match plan_chunks(duration_sec, settings) {
            Ok(plan) => plan,
            Err(PlanError::PlanExceeded { required, chunk_max }) => {
                return Err(ProcessError::Corrupt(format!(
                    "plan_exceeded: {required} chunks needed, chunk_max is {chunk_max}"
                )))
            }
        };
        self.events.emit(&Event::Planned {
            job_id: job_id.clone(),
            source: source.to_string_lossy().into_owned(),
            total_sec: duration_sec,
            chunk_count: plan.len(),
        });
        if plan.is_truncated() {
            self.events.emit(&Event::PlanTruncated {
                job_id: job_id.clone(),
                source: source.to_string_lossy().into_owned(),
                chunk_max: settings.chunk_max,
                dropped_sec: plan.truncated_sec,
            });
        }

        let track_work = work.join(format!("track_{track_index:03}"));
        debug!("job {}: CHUNKING {} chunks", job_id, plan.len());
        let chunks = self.extract_chunks(source, &plan, &track_work).await?;

        debug!("job {}: SEPARATING", job_id);
        let merged_dir = track_work.join("merged");
        let (instrumental_wav, merged_stems) = if full_stems {
            let stems = self
                .separate_all_stems(job_id, &chunks, &track_work, shutdown)
                .await?;
            let merged = self.merge_stems(&stems, &merged_dir, settings.crossfade_ms).await?;
            let instrumental = merged_dir.join("instrumental.wav");
            self.toolkit
                .mix_stems(&merged.instrumental(), &instrumental)
                .await
                .map_err(|e| ProcessError::Encode(e.to_string()))?;
            (instrumental, Some(merged))
        } else {
            let accompaniments = self
                .separate_accompaniments(job_id, &chunks, &track_work, shutdown)
                .await?;
            debug!("job {}: MERGING {} parts", job_id, accompaniments.len());
            let out = merged_dir.join("instrumental.wav");
            self.toolkit
                .crossfade_concat(&accompaniments, &out, settings.crossfade_ms)
                .await
                .map_err(|e| ProcessError::Encode(e.to_string()))?;
            (out, None)
        };

        // Steps 7–8: variants, encode, tag.
        debug!("job {}: ENCODING", job_id);
        let comment = self.config.tag_comment();
        let tags = resolved.as_tag_set();
        let track_stem = fsutil::sanitize_name(
            &source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| resolved.title.clone()),
        );
        let mut artifacts = Vec::new();

        for &variant in variants {
            let variant_wav = match (&merged_stems, variant) {
                (_, Variant::Instrumental) => instrumental_wav.clone(),
                (Some(stems), other) => {
                    let out = track_work
                        .join("variants")
                        .join(format!("{}.wav", other.as_str()));
                    self.toolkit
                        .mix_stems(&stem_sources(other, stems), &out)
                        .await
                        .map_err(|e| ProcessError::Encode(e.to_string()))?;
                    out
                }
                (None, other) => {
                    // Unreachable by construction: extra variants force
                    // full-stem separation.
                    warn!("variant {} requested without stems", other.as_str());
                    continue;
                }
            };

            let filename = if is_album {
                album_output_filename(&track_stem, variant)
            } else {
                output_filename(variant)
            };
            let out_path = files_dir.join(&filename);
            self.toolkit
                .encode_mp3(
                    &variant_wav,
                    &out_path,
                    settings.mp3_encoding,
                    &tags,
                    &comment,
                    cover,
                )
                .await
                .map_err(|e| ProcessError::Encode(e.to_string()))?;

            artifacts.push(Artifact {
                kind: "audio".to_string(),
                variant: variant.as_str().to_string(),
                label: if is_album {
                    format!("{} ({})", resolved.title, variant.label())
                } else {
                    variant.label().to_string()
                },
                path: format!("files/{filename}"),
                codec: Some("mp3".to_string()),
                container: Some("mp3".to_string()),
                duration_sec: Some(duration_sec),
                sha256: sha256_file(&out_path).ok(),
            });
        }

        // Preserved stems ride along as WAV artifacts.
        if self.config.variants.preserve_stems {
            if let Some(stems) = &merged_stems {
                let stems_dir = files_dir.join("stems");
                std::fs::create_dir_all(&stems_dir)?;
                for (name, path) in [
                    ("vocals", &stems.vocals),
                    ("drums", &stems.drums),
                    ("bass", &stems.bass),
                    ("other", &stems.other),
                ] {
                    let filename = if is_album {
                        format!("{track_stem}__{name}.wav")
                    } else {
                        format!("{name}.wav")
                    };
                    let dest = stems_dir.join(&filename);
                    std::fs::copy(path, &dest)?;
                    artifacts.push(Artifact {
                        kind: "stem".to_string(),
                        variant: name.to_string(),
                        label: format!("{name} stem"),
                        path: format!("files/stems/{filename}"),
                        codec: Some("pcm".to_string()),
                        container: Some("wav".to_string()),
                        duration_sec: Some(duration_sec),
                        sha256: None,
                    });
                }
            }
        }

        Ok(TrackResult {
            artifacts,
            resolved,
            duration_sec,
            chunk_count: plan.len(),
        })
    }

    /// Step 4: extract chunk WAVs, reusing a previous run's chunks when the
    /// persisted plan matches.
    async fn extract_chunks(
        &self,
        source: &Path,
        plan: &ChunkPlan,
        track_work: &Path,
    ) -> Result<Vec<PathBuf>, ProcessError> {
        let chunks_dir = track_work.join("chunks");
        std::fs::create_dir_all(&chunks_dir)?;

        let plan_path = track_work.join("plan.json");
        let reusable = std::fs::read_to_string(&plan_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<ChunkPlan>(&raw).ok())
            .map(|prev| prev == *plan)
            .unwrap_or(false);
        if !reusable {
            std::fs::write(&plan_path, serde_json::to_string(plan).unwrap_or_default())?;
        }

        let mut paths = Vec::with_capacity(plan.len());
        for chunk in &plan.chunks {
            let path = chunks_dir.join(format!("chunk_{:03}.wav", chunk.index));
            let exists = reusable
                && path.is_file()
                && std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
            if !exists {
                self.toolkit
                    .extract_chunk(source, &path, chunk.start_sec, chunk.duration_sec)
                    .await
                    .map_err(|e| ProcessError::Extract(e.to_string()))?;
            } else {
                debug!("reusing chunk {}", path.display());
            }
            paths.push(path);
        }
        Ok(paths)
    }

    /// Step 5, two-stem mode: one accompaniment WAV per chunk.
    async fn separate_accompaniments(
        &self,
        job_id: &str,
        chunks: &[PathBuf],
        track_work: &Path,
        shutdown: &CancellationToken,
    ) -> Result<Vec<PathBuf>, ProcessError> {
        let mut outputs = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let out_dir = track_work.join(format!("sep_{i:03}"));
            let acc = self
                .separate_with_retries(job_id, i, &out_dir, || {
                    self.separator
                        .separate(chunk, &out_dir, self.config.processing.timeout_sec)
                })
                .await?;
            outputs.push(acc);
            if shutdown.is_cancelled() {
                return Err(ProcessError::Interrupted);
            }
        }
        Ok(outputs)
    }

    /// Step 5, full mode: a stem set per chunk.
    async fn separate_all_stems(
        &self,
        job_id: &str,
        chunks: &[PathBuf],
        track_work: &Path,
        shutdown: &CancellationToken,
    ) -> Result<Vec<StemSet>, ProcessError> {
        let mut outputs = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let out_dir = track_work.join(format!("sep_{i:03}"));
            let stems = self
                .separate_with_retries(job_id, i, &out_dir, || {
                    self.separator
                        .separate_stems(chunk, &out_dir, self.config.processing.timeout_sec)
                })
                .await?;
            outputs.push(stems);
            if shutdown.is_cancelled() {
                return Err(ProcessError::Interrupted);
            }
        }
        Ok(outputs)
    }

    /// Bounded retry around one chunk separation. The chunk's output
    /// directory is removed before each retry; the adapter itself never
    /// retries.
    async fn separate_with_retries<T, F, Fut>(
        &self,
        job_id: &str,
        chunk_index: usize,
        out_dir: &Path,
        attempt_fn: F,
    ) -> Result<T, ProcessError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, SeparatorError>>,
    {
        let max_retries = self.config.processing.max_retries;
        let mut last_error = String::new();
        for attempt in 0..=max_retries {
            if attempt > 0 {
                if let Err(e) = std::fs::remove_dir_all(out_dir) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("could not clean {} before retry: {}", out_dir.display(), e);
                    }
                }
            }
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e.to_string();
                    self.events.emit(&Event::ChunkFailed {
                        job_id: job_id.to_string(),
                        chunk_index,
                        attempt: attempt + 1,
                        error: last_error.clone(),
                    });
                    warn!(
                        "job {} chunk {} attempt {}/{} failed: {}",
                        job_id,
                        chunk_index,
                        attempt + 1,
                        max_retries + 1,
                        last_error
                    );
                }
            }
        }
        Err(ProcessError::Separation {
            chunk_index,
            error: last_error,
        })
    }

    /// Merge each stem across chunks with crossfades.
    async fn merge_stems(
        &self,
        per_chunk: &[StemSet],
        merged_dir: &Path,
        crossfade_ms: u32,
    ) -> Result<StemSet, ProcessError> {
        let collect = |pick: fn(&StemSet) -> &PathBuf| -> Vec<PathBuf> {
            per_chunk.iter().map(|s| pick(s).clone()).collect()
        };
        let merge = |name: &'static str, parts: Vec<PathBuf>| {
            let out = merged_dir.join(format!("{name}.wav"));
            async move {
                self.toolkit
                    .crossfade_concat(&parts, &out, crossfade_ms)
                    .await
                    .map(|_| out)
                    .map_err(|e| ProcessError::Encode(e.to_string()))
            }
        };
        Ok(StemSet {
            vocals: merge("vocals", collect(|s| &s.vocals)).await?,
            drums: merge("drums", collect(|s| &s.drums)).await?,
            bass: merge("bass", collect(|s| &s.bass)).await?,
            other: merge("other", collect(|s| &s.other)).await?,
        })
    }

    /// Step 10: legacy-compatible library copy.
    fn organize_into_library(
        &self,
        manifest: &JobManifest,
        final_dir: &Path,
    ) -> std::io::Result<()> {
        let instrumental = manifest
            .artifacts
            .iter()
            .find(|a| a.kind == "audio" && a.variant == "instrumental");
        let artifact = match instrumental {
            Some(a) => a,
            None => return Ok(()),
        };
        let dest = self
            .config
            .music_library
            .join(fsutil::sanitize_name(&manifest.artist))
            .join(fsutil::sanitize_name(&manifest.album))
            .join(format!("{}.mp3", fsutil::sanitize_name(&manifest.title)));
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(final_dir.join(&artifact.path), &dest)?;
        info!("library copy at {}", dest.display());
        Ok(())
    }
}
