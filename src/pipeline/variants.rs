//! Variant definitions: which stems make up each output.
//!
//! Variants are generated by mixing the stems of one separation run, never
//! by re-running separation in a different mode.

use std::path::PathBuf;

use crate::config::Variant;
use crate::media::StemSet;

/// Stems mixed to produce a variant.
pub fn stem_sources(variant: Variant, stems: &StemSet) -> Vec<PathBuf> {
    match variant {
        Variant::Instrumental => stems.instrumental(),
        Variant::NoDrums => stems.no_drums(),
        Variant::DrumsOnly => stems.drums_only(),
    }
}

/// Output file name for a variant of a single-track job.
pub fn output_filename(variant: Variant) -> String {
    format!("{}.mp3", variant.as_str())
}

/// Output file name for a variant of one track of an album job.
pub fn album_output_filename(track_stem: &str, variant: Variant) -> String {
    match variant {
        Variant::Instrumental => format!("{track_stem}.mp3"),
        other => format!("{track_stem}__{}.mp3", other.as_str()),
    }
}
