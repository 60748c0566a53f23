//! Queue discovery, claim and archive.
//!
//! Retrievers publish bundles into named queue roots; the rename into the
//! working root *is* the claim, so two consumers can never both win a
//! bundle. Completed bundles are archived under `success/` or
//! `failed/<reason>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

use super::bundle::{BundleError, JobBundle};
use crate::config::QueueRoot;
use crate::fsutil;

/// Directory-name suffix marking a bundle still being written.
pub const TMP_SUFFIX: &str = ".tmp";

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Another consumer moved the bundle first.
    #[error("claim lost for {0}")]
    ClaimLost(PathBuf),

    #[error("filesystem: {0}")]
    Fs(#[from] fsutil::FsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A discovered, not-yet-claimed bundle.
#[derive(Debug, Clone)]
pub struct ClaimableJob {
    pub queue: String,
    pub path: PathBuf,
    pub bundle: JobBundle,
    /// Oldest modification time of any file in the bundle.
    pub oldest_mtime: SystemTime,
}

/// A bundle whose `job.json` failed to parse or validate.
#[derive(Debug)]
pub struct InvalidBundle {
    pub path: PathBuf,
    pub error: BundleError,
}

/// Result of one discovery scan.
#[derive(Debug, Default)]
pub struct Discovery {
    pub ready: Vec<ClaimableJob>,
    pub invalid: Vec<InvalidBundle>,
}

/// A bundle claimed into the working root.
#[derive(Debug)]
pub struct ClaimedJob {
    pub queue: String,
    pub path: PathBuf,
    pub bundle: JobBundle,
}

/// Final disposition of a claimed bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Success,
    Failed(String),
}

impl Disposition {
    fn archive_subdir(&self) -> PathBuf {
        match self {
            Disposition::Success => PathBuf::from("success"),
            Disposition::Failed(reason) => Path::new("failed").join(reason),
        }
    }
}

/// Consumer over an ordered set of named queue roots.
pub struct QueueConsumer {
    queues: Vec<QueueRoot>,
    working: PathBuf,
    archive: PathBuf,
}

impl QueueConsumer {
    pub fn new(queues: Vec<QueueRoot>, working: &Path, archive: &Path) -> Self {
        Self {
            queues,
            working: working.to_path_buf(),
            archive: archive.to_path_buf(),
        }
    }

    /// Scan all queue roots for claimable bundles.
    ///
    /// Bundles with the temporary suffix or without a `job.json` are
    /// invisible; bundles whose `job.json` does not parse are reported
    /// separately so the processor can quarantine them. Ready jobs are
    /// ordered oldest-first by bundle mtime, ties broken by `job_id`.
    pub fn discover(&self) -> Discovery {
        let mut discovery = Discovery::default();

        for queue in &self.queues {
            let entries = match fs::read_dir(&queue.root) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("queue root {} not readable: {}", queue.root.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(TMP_SUFFIX) {
                    continue;
                }
                if !path.join("job.json").is_file() {
                    continue;
                }
                match JobBundle::load(&path) {
                    Ok(bundle) => discovery.ready.push(ClaimableJob {
                        queue: queue.name.clone(),
                        oldest_mtime: oldest_file_mtime(&path),
                        path,
                        bundle,
                    }),
                    Err(error) => {
                        warn!("invalid bundle {}: {}", path.display(), error);
                        discovery.invalid.push(InvalidBundle { path, error });
                    }
                }
            }
        }

        discovery.ready.sort_by(|a, b| {
            a.oldest_mtime
                .cmp(&b.oldest_mtime)
                .then_with(|| a.bundle.job_id.cmp(&b.bundle.job_id))
        });
        discovery
    }

    /// Bundles left in the working root by a previous run, for resumption.
    pub fn resume_candidates(&self) -> Vec<ClaimedJob> {
        let mut resumed = Vec::new();
        let entries = match fs::read_dir(&self.working) {
            Ok(entries) => entries,
            Err(_) => return resumed,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join("job.json").is_file() {
                continue;
            }
            match JobBundle::load(&path) {
                Ok(bundle) => {
                    debug!("resuming claimed bundle {}", path.display());
                    resumed.push(ClaimedJob {
                        queue: "working".to_string(),
                        path,
                        bundle,
                    });
                }
                Err(e) => warn!("unreadable bundle in working root {}: {}", path.display(), e),
            }
        }
        resumed.sort_by(|a, b| a.bundle.job_id.cmp(&b.bundle.job_id));
        resumed
    }

    /// Claim a bundle by moving it into the working root.
    ///
    /// The move is the claim: when it fails because the bundle vanished,
    /// another consumer won and the caller proceeds to its next candidate.
    pub fn claim(&self, job: ClaimableJob) -> Result<ClaimedJob, QueueError> {
        fs::create_dir_all(&self.working)?;
        let name = job
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.bundle.job_id.clone());
        let dest = self.working.join(&name);

        match fsutil::safe_move(&job.path, &dest) {
            Ok(()) => Ok(ClaimedJob {
                queue: job.queue,
                path: dest,
                bundle: job.bundle,
            }),
            Err(fsutil::FsError::SourceMissing(_)) => Err(QueueError::ClaimLost(job.path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a claimed bundle to its archive location.
    pub fn archive(&self, claimed: &ClaimedJob, disposition: Disposition) -> Result<PathBuf, QueueError> {
        let subdir = self.archive.join(disposition.archive_subdir());
        fs::create_dir_all(&subdir)?;
        let name = claimed
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| claimed.bundle.job_id.clone());
        let dest = subdir.join(name);
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fsutil::safe_move(&claimed.path, &dest)?;
        Ok(dest)
    }
}

/// Oldest mtime of any file in a bundle directory (the directory's own
/// mtime when it has no files).
fn oldest_file_mtime(dir: &Path) -> SystemTime {
    let mut oldest: Option<SystemTime> = None;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    oldest = Some(match oldest {
                        Some(prev) if prev <= mtime => prev,
                        _ => mtime,
                    });
                }
            }
        }
    }
    oldest.unwrap_or_else(|| {
        fs::metadata(dir)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn make_bundle(root: &Path, name: &str, job_id: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("job.json"),
            format!(
                r#"{{"job_id": "{job_id}", "source_type": "youtube", "audio_path": "audio.m4a"}}"#
            ),
        )
        .unwrap();
        File::create(dir.join("audio.m4a")).unwrap();
        dir
    }

    fn consumer(root: &Path) -> QueueConsumer {
        QueueConsumer::new(
            vec![QueueRoot {
                name: "q".to_string(),
                root: root.join("queue"),
            }],
            &root.join("working"),
            &root.join("archive"),
        )
    }

    #[test]
    fn test_discover_skips_tmp_suffix() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        make_bundle(&queue, "job_a", "a");
        make_bundle(&queue, "job_b.tmp", "b");

        let discovery = consumer(dir.path()).discover();
        assert_eq!(discovery.ready.len(), 1);
        assert_eq!(discovery.ready[0].bundle.job_id, "a");
    }

    #[test]
    fn test_discover_skips_missing_job_json() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        fs::create_dir_all(queue.join("job_nojson")).unwrap();

        let discovery = consumer(dir.path()).discover();
        assert!(discovery.ready.is_empty());
        assert!(discovery.invalid.is_empty());
    }

    #[test]
    fn test_discover_reports_invalid_schema() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        let bad = queue.join("job_bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("job.json"), "{not json").unwrap();

        let discovery = consumer(dir.path()).discover();
        assert!(discovery.ready.is_empty());
        assert_eq!(discovery.invalid.len(), 1);
        assert!(matches!(discovery.invalid[0].error, BundleError::Schema(_)));
    }

    #[test]
    fn test_discover_orders_by_mtime_then_job_id() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        let older = make_bundle(&queue, "job_old", "zzz");
        make_bundle(&queue, "job_new", "aaa");

        // Make one bundle's audio distinctly older.
        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = File::options()
            .write(true)
            .open(older.join("audio.m4a"))
            .unwrap();
        file.set_modified(past).unwrap();

        let discovery = consumer(dir.path()).discover();
        assert_eq!(discovery.ready.len(), 2);
        assert_eq!(discovery.ready[0].bundle.job_id, "zzz");
        assert_eq!(discovery.ready[1].bundle.job_id, "aaa");
    }

    #[test]
    fn test_claim_moves_into_working() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        make_bundle(&queue, "job_a", "a");

        let c = consumer(dir.path());
        let discovery = c.discover();
        let claimed = c.claim(discovery.ready.into_iter().next().unwrap()).unwrap();

        assert!(claimed.path.starts_with(dir.path().join("working")));
        assert!(claimed.path.join("job.json").exists());
        assert!(!queue.join("job_a").exists());
    }

    #[test]
    fn test_claim_lost_when_bundle_vanishes() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        make_bundle(&queue, "job_a", "a");

        let c = consumer(dir.path());
        let discovery = c.discover();
        let job = discovery.ready.into_iter().next().unwrap();

        // Simulate another consumer winning the rename race.
        fs::remove_dir_all(&job.path).unwrap();
        assert!(matches!(c.claim(job), Err(QueueError::ClaimLost(_))));
    }

    #[test]
    fn test_archive_success_and_failed() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("queue");
        make_bundle(&queue, "job_a", "a");
        make_bundle(&queue, "job_b", "b");

        let c = consumer(dir.path());
        let discovery = c.discover();
        let mut jobs = discovery.ready.into_iter();

        let first = c.claim(jobs.next().unwrap()).unwrap();
        let dest = c.archive(&first, Disposition::Success).unwrap();
        assert!(dest.starts_with(dir.path().join("archive/success")));
        assert!(dest.join("job.json").exists());

        let second = c.claim(jobs.next().unwrap()).unwrap();
        let dest = c
            .archive(&second, Disposition::Failed("separation".to_string()))
            .unwrap();
        assert!(dest.starts_with(dir.path().join("archive/failed/separation")));
    }

    #[test]
    fn test_resume_candidates() {
        let dir = TempDir::new().unwrap();
        let working = dir.path().join("working");
        make_bundle(&working, "job_left", "left");

        let resumed = consumer(dir.path()).resume_candidates();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].bundle.job_id, "left");
    }
}
