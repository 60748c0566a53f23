//! Chunk planning for the separation pipeline.
//!
//! A plan is an ordered list of `(start, duration)` slices covering the whole
//! source; each non-first slice starts `overlap` seconds before the previous
//! slice's logical end so the merge can crossfade across the seam.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ChunkOverflow, ProcessingSettings};

/// One slice of the source audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub start_sec: f64,
    pub duration_sec: f64,
}

/// A complete chunk plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_sec: f64,
    pub chunks: Vec<Chunk>,
    /// Seconds of source dropped when the plan was truncated at `chunk_max`.
    pub truncated_sec: f64,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated_sec > 0.0
    }
}

/// Planning failure.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The source would need more than `chunk_max` chunks and the engine is
    /// configured to reject rather than truncate.
    #[error("plan_exceeded: {required} chunks needed, chunk_max is {chunk_max}")]
    PlanExceeded { required: usize, chunk_max: usize },
}

/// Build the chunk plan for a source of `total_sec` seconds.
///
/// A source no longer than one chunk (or chunking disabled) yields a single
/// full-length chunk and therefore no crossfade.
pub fn plan_chunks(total_sec: f64, settings: &ProcessingSettings) -> Result<ChunkPlan, PlanError> {
    let chunk_sec = f64::from(settings.chunk_seconds);
    let overlap = settings.chunk_overlap_sec;

    if !settings.chunking_enabled || total_sec <= chunk_sec {
        return Ok(ChunkPlan {
            total_sec,
            chunks: vec![Chunk {
                index: 0,
                start_sec: 0.0,
                duration_sec: total_sec,
            }],
            truncated_sec: 0.0,
        });
    }

    let required = (total_sec / chunk_sec).ceil() as usize;
    let (count, truncated_sec) = if required > settings.chunk_max {
        match settings.chunk_overflow {
            ChunkOverflow::Reject => {
                return Err(PlanError::PlanExceeded {
                    required,
                    chunk_max: settings.chunk_max,
                })
            }
            ChunkOverflow::Truncate => {
                let kept = settings.chunk_max as f64 * chunk_sec;
                (settings.chunk_max, total_sec - kept)
            }
        }
    } else {
        (required, 0.0)
    };

    let mut chunks = Vec::with_capacity(count);
    for i in 0..count {
        let logical_start = i as f64 * chunk_sec;
        let logical_end = ((i + 1) as f64 * chunk_sec).min(total_sec);
        let start = if i == 0 {
            0.0
        } else {
            (logical_start - overlap).max(0.0)
        };
        chunks.push(Chunk {
            index: i,
            start_sec: start,
            duration_sec: logical_end - start,
        });
    }

    Ok(ChunkPlan {
        total_sec,
        chunks,
        truncated_sec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProcessingSettings {
        ProcessingSettings {
            chunk_seconds: 120,
            chunk_overlap_sec: 0.5,
            chunk_max: 16,
            chunk_overflow: ChunkOverflow::Truncate,
            ..ProcessingSettings::default()
        }
    }

    #[test]
    fn test_short_source_single_chunk() {
        let plan = plan_chunks(90.0, &settings()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].start_sec, 0.0);
        assert_eq!(plan.chunks[0].duration_sec, 90.0);
    }

    #[test]
    fn test_exactly_chunk_seconds_single_chunk() {
        // Boundary: duration == CHUNK_SECONDS means one chunk, no crossfade.
        let plan = plan_chunks(120.0, &settings()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].duration_sec, 120.0);
    }

    #[test]
    fn test_shorter_than_overlap_single_chunk() {
        let plan = plan_chunks(0.3, &settings()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].duration_sec, 0.3);
    }

    #[test]
    fn test_chunking_disabled() {
        let cfg = ProcessingSettings {
            chunking_enabled: false,
            ..settings()
        };
        let plan = plan_chunks(3000.0, &cfg).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.chunks[0].duration_sec, 3000.0);
    }

    #[test]
    fn test_overlapped_plan() {
        let plan = plan_chunks(300.0, &settings()).unwrap();
        assert_eq!(plan.len(), 3);

        assert_eq!(plan.chunks[0].start_sec, 0.0);
        assert_eq!(plan.chunks[0].duration_sec, 120.0);

        // Non-first chunks start overlap seconds before the prior logical end.
        assert!((plan.chunks[1].start_sec - 119.5).abs() < 1e-9);
        assert!((plan.chunks[1].duration_sec - 120.5).abs() < 1e-9);

        assert!((plan.chunks[2].start_sec - 239.5).abs() < 1e-9);
        assert!((plan.chunks[2].duration_sec - 60.5).abs() < 1e-9);

        // Coverage: last chunk reaches the end of the source.
        let last = plan.chunks.last().unwrap();
        assert!((last.start_sec + last.duration_sec - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_exactly_chunk_max_chunks() {
        // 16 * 120 = 1920 seconds: exactly chunk_max chunks, nothing dropped.
        let plan = plan_chunks(1920.0, &settings()).unwrap();
        assert_eq!(plan.len(), 16);
        assert!(!plan.is_truncated());
    }

    #[test]
    fn test_overflow_truncates_with_remainder() {
        let plan = plan_chunks(2000.0, &settings()).unwrap();
        assert_eq!(plan.len(), 16);
        assert!(plan.is_truncated());
        assert!((plan.truncated_sec - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_overflow_rejects_when_configured() {
        let cfg = ProcessingSettings {
            chunk_overflow: ChunkOverflow::Reject,
            ..settings()
        };
        let result = plan_chunks(2000.0, &cfg);
        assert!(matches!(
            result,
            Err(PlanError::PlanExceeded {
                required: 17,
                chunk_max: 16
            })
        ));
    }

    #[test]
    fn test_plan_round_trips_through_serde() {
        let plan = plan_chunks(300.0, &settings()).unwrap();
        let raw = serde_json::to_string(&plan).unwrap();
        let back: ChunkPlan = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, plan);
    }
}
