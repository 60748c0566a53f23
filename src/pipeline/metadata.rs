//! Tag and cover resolution.
//!
//! Resolution order: embedded tags, then the container-level probe, then
//! folder/filename heuristics. Heuristics recognize `Artist - Album`,
//! `Artist – Album` (en dash) and nested `Artist/Album/Track.ext`
//! hierarchies; a title derived from a filename gets its leading track
//! number stripped.

use std::path::{Path, PathBuf};

use crate::media::TagSet;

/// Fully resolved track metadata; fields are never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTags {
    pub artist: String,
    pub album: String,
    pub title: String,
}

impl ResolvedTags {
    pub fn as_tag_set(&self) -> TagSet {
        TagSet {
            artist: Some(self.artist.clone()),
            album: Some(self.album.clone()),
            title: Some(self.title.clone()),
        }
    }
}

/// Album-folder separators, tried in order.
const ALBUM_SEPARATORS: &[&str] = &[" - ", " \u{2013} "];

/// Strip a leading track number plus separator from a filename-derived
/// title, and squeeze runs of whitespace.
pub fn strip_track_number(name: &str) -> String {
    let trimmed = name.trim_start();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    let stripped = if (1..=3).contains(&digits) {
        let rest = &trimmed[digits..];
        let sep_len = rest
            .chars()
            .take_while(|c| matches!(c, '-' | '_' | '.' | ' '))
            .map(|c| c.len_utf8())
            .sum::<usize>();
        if sep_len > 0 {
            &rest[sep_len..]
        } else {
            trimmed
        }
    } else {
        trimmed
    };
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve artist/album/title for a track.
///
/// `hints` carries whatever the bundle metadata and tag reads produced;
/// `album_root` is the album directory for album bundles (folder heuristics
/// only apply there).
pub fn resolve_tags(hints: &TagSet, source: &Path, album_root: Option<&Path>) -> ResolvedTags {
    let mut artist = hints.artist.clone().filter(|s| !s.trim().is_empty());
    let mut album = hints.album.clone().filter(|s| !s.trim().is_empty());
    let mut title = hints.title.clone().filter(|s| !s.trim().is_empty());

    if title.is_none() {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let derived = strip_track_number(&stem);
        if !derived.is_empty() {
            title = Some(derived);
        }
    }

    if let Some(root) = album_root {
        if artist.is_none() || album.is_none() {
            let folder = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut split = None;
            for sep in ALBUM_SEPARATORS {
                if let Some((a, b)) = folder.split_once(sep) {
                    split = Some((a.trim().to_string(), b.trim().to_string()));
                    break;
                }
            }
            match split {
                Some((folder_artist, folder_album)) => {
                    if artist.is_none() && !folder_artist.is_empty() {
                        artist = Some(folder_artist);
                    }
                    if album.is_none() && !folder_album.is_empty() {
                        album = Some(folder_album);
                    }
                }
                None => {
                    // Nested Artist/Album/Track layout: the track's parent is
                    // the album, the album root is the artist.
                    let parent = source
                        .parent()
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if !parent.is_empty() && parent != folder {
                        if artist.is_none() && !folder.is_empty() {
                            artist = Some(folder.clone());
                        }
                        if album.is_none() {
                            album = Some(parent);
                        }
                    } else if album.is_none() && !folder.is_empty() {
                        album = Some(folder);
                    }
                }
            }
        }
    }

    ResolvedTags {
        artist: artist.unwrap_or_else(|| "Unknown".to_string()),
        album: album.unwrap_or_else(|| "Unknown".to_string()),
        title: title.unwrap_or_else(|| "Unknown".to_string()),
    }
}

/// Cover image names preferred in the source directory, matched
/// case-insensitively.
const COVER_STEM: &str = "cover";
const COVER_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Look for a `cover.{jpg,jpeg,png,webp}` in a directory.
pub fn find_cover_in_dir(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let stem_ok = path
            .file_stem()
            .map(|s| s.to_string_lossy().eq_ignore_ascii_case(COVER_STEM))
            .unwrap_or(false);
        if !stem_ok {
            continue;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if let Some(rank) = COVER_EXTS.iter().position(|&e| e == ext) {
            match &best {
                Some((best_rank, _)) if *best_rank <= rank => {}
                _ => best = Some((rank, path)),
            }
        }
    }
    best.map(|(_, p)| p)
}
