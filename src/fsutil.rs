//! Filesystem primitives: atomic publish, cross-device moves, name
//! sanitization and scoped working directories.
//!
//! Every other component assumes that a directory which is *visible* is
//! *complete*; the `.tmp` → final rename in [`publish_atomic`] is the single
//! publish step that provides this.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from filesystem primitives.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("publish target already exists: {0}")]
    PublishConflict(PathBuf),

    #[error("source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Returns true when the error is a cross-device link failure (EXDEV).
fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
    }
    #[cfg(not(unix))]
    {
        err.to_string().contains("cross-device")
    }
}

/// Recursively copy a directory tree, fsyncing each file as it lands.
fn copy_tree_synced(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_synced(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            let f = fs::File::open(&target)?;
            f.sync_all()?;
        }
    }
    Ok(())
}

/// Atomically publish a staged directory to its final location.
///
/// The rename is the publish step: readers never see a partially written
/// directory. Fails with [`FsError::PublishConflict`] when the final path
/// already exists. On cross-device failure, falls back to
/// copy+fsync+rename+remove via a staging sibling of the final path.
pub fn publish_atomic(tmp_dir: &Path, final_dir: &Path) -> Result<(), FsError> {
    if !tmp_dir.exists() {
        return Err(FsError::SourceMissing(tmp_dir.to_path_buf()));
    }
    if final_dir.exists() {
        return Err(FsError::PublishConflict(final_dir.to_path_buf()));
    }
    if let Some(parent) = final_dir.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(tmp_dir, final_dir) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(
                "cross-device publish {} -> {}, falling back to copy",
                tmp_dir.display(),
                final_dir.display()
            );
            let staging = staging_sibling(final_dir);
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            copy_tree_synced(tmp_dir, &staging)?;
            fs::rename(&staging, final_dir)?;
            fs::remove_dir_all(tmp_dir)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn staging_sibling(final_dir: &Path) -> PathBuf {
    let name = final_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staging".to_string());
    final_dir.with_file_name(format!(".{name}.staging"))
}

/// Move a file or directory, copying across filesystems when rename fails
/// with EXDEV.
pub fn safe_move(src: &Path, dst: &Path) -> Result<(), FsError> {
    if !src.exists() {
        return Err(FsError::SourceMissing(src.to_path_buf()));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            if src.is_dir() {
                copy_tree_synced(src, dst)?;
                fs::remove_dir_all(src)?;
            } else {
                fs::copy(src, dst)?;
                fs::remove_file(src)?;
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Sanitize a name for use as a single path component.
///
/// On POSIX only path separators and NUL are removed; punctuation including
/// colon and apostrophe is preserved. On other platforms the characters the
/// target filesystem forbids are replaced with `_`. Whitespace and case are
/// left untouched.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = if cfg!(windows) {
        name.chars()
            .map(|c| match c {
                '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                '\0' => '_',
                c => c,
            })
            .collect()
    } else {
        name.chars().filter(|&c| c != '/' && c != '\0').collect()
    };
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A per-job working directory removed on drop unless explicitly retained.
///
/// The processor calls [`ScopedWorkdir::retain`] when configured to keep
/// failed work areas around for post-mortem.
pub struct ScopedWorkdir {
    path: PathBuf,
    retain: bool,
}

impl ScopedWorkdir {
    /// Create (or reuse) the working directory `root/<job_id>`.
    pub fn create(root: &Path, job_id: &str) -> Result<Self, FsError> {
        let path = root.join(job_id);
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            retain: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the directory on drop.
    pub fn retain(&mut self) {
        self.retain = true;
    }
}

impl Drop for ScopedWorkdir {
    fn drop(&mut self) {
        if self.retain {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove workdir {}: {}", self.path.display(), e);
            }
        }
    }
}
