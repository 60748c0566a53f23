//! Process and album exclusion locks.
//!
//! The singleton lock guards against a second processor on the same host;
//! the album lock serializes tracks of one album across processor tasks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance is running (lock held by {holder})")]
    AlreadyRunning { holder: String },

    #[error("album is locked by another job: {0}")]
    AlbumBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Check whether a pid is alive on this host.
fn pid_is_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // EPERM: exists but owned by someone else.
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Parsed contents of a singleton lock file.
#[derive(Debug, PartialEq, Eq)]
struct LockContents {
    host: Option<String>,
    pid: u32,
}

fn parse_lock_contents(raw: &str) -> Option<LockContents> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some((host, pid)) = raw.split_once(':') {
        let pid = pid.trim().parse().ok()?;
        Some(LockContents {
            host: Some(host.trim().to_string()),
            pid,
        })
    } else {
        // Legacy numeric-only contents are interpreted as local.
        raw.parse().ok().map(|pid| LockContents { host: None, pid })
    }
}

/// Singleton process lock: file content is `<hostname>:<pid>`.
///
/// A stale lock from a dead local process is taken over; a lock held by a
/// live local process or by any other host is refused.
pub struct SingletonLock {
    path: PathBuf,
    contents: String,
}

impl SingletonLock {
    /// Try to acquire the lock at `path`.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        Self::acquire_as(path, &host, pid)
    }

    /// Acquisition with explicit identity, for tests.
    pub fn acquire_as(path: &Path, host: &str, pid: u32) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = format!("{host}:{pid}");

        match fs::read_to_string(path) {
            Ok(raw) => {
                if let Some(existing) = parse_lock_contents(&raw) {
                    if let Some(existing_host) = &existing.host {
                        if existing_host != host {
                            // Foreign lock: never kill or take over holders
                            // on other hosts.
                            return Err(LockError::AlreadyRunning {
                                holder: raw.trim().to_string(),
                            });
                        }
                    }
                    if existing.pid == pid {
                        // Our own pid (pid-1 reuse in containers): keep it.
                        return Ok(Self {
                            path: path.to_path_buf(),
                            contents,
                        });
                    }
                    if pid_is_running(existing.pid) {
                        return Err(LockError::AlreadyRunning {
                            holder: raw.trim().to_string(),
                        });
                    }
                    info!(
                        "taking over stale singleton lock from dead pid {}",
                        existing.pid
                    );
                }
                // Unparsable or stale: replace.
                fs::write(path, &contents)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    contents,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(path, &contents)?;
                Ok(Self {
                    path: path.to_path_buf(),
                    contents,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        // Only release a lock we still own.
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim() == self.contents => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!("failed to release singleton lock: {}", e);
                }
            }
            _ => {}
        }
    }
}

/// On-disk album exclusion marker.
///
/// Keyed by the album's source directory; held while any track of that album
/// is being processed and released on final disposition. Advisory among
/// processor tasks in one engine instance.
pub struct AlbumLock {
    path: PathBuf,
    key: String,
}

impl AlbumLock {
    /// Acquire the album lock for `key`, or fail if a different album holds it.
    pub fn acquire(state_dir: &Path, key: &str) -> Result<Self, LockError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join("album_active.txt");
        match fs::read_to_string(&path) {
            Ok(existing) => {
                let existing = existing.trim();
                if !existing.is_empty() && existing != key {
                    return Err(LockError::AlbumBusy(existing.to_string()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::write(&path, key)?;
        Ok(Self {
            path,
            key: key.to_string(),
        })
    }

    /// Replace whatever marker is present. Only valid when the caller knows
    /// the existing holder is stale (e.g. left by a crashed run).
    pub fn take_over(state_dir: &Path, key: &str) -> Result<Self, LockError> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join("album_active.txt");
        fs::write(&path, key)?;
        Ok(Self {
            path,
            key: key.to_string(),
        })
    }

    /// Read the currently held album key, if any.
    pub fn current(state_dir: &Path) -> Option<String> {
        let raw = fs::read_to_string(state_dir.join("album_active.txt")).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock explicitly.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for AlbumLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim() == self.key => {
                let _ = fs::remove_file(&self.path);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_lock_contents() {
        assert_eq!(
            parse_lock_contents("host-a:123"),
            Some(LockContents {
                host: Some("host-a".to_string()),
                pid: 123
            })
        );
        // Legacy numeric-only format is accepted as local.
        assert_eq!(
            parse_lock_contents("4242"),
            Some(LockContents {
                host: None,
                pid: 4242
            })
        );
        assert_eq!(parse_lock_contents(""), None);
        assert_eq!(parse_lock_contents("host-a:notanumber"), None);
    }

    #[test]
    fn test_acquire_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        let lock = SingletonLock::acquire_as(&path, "h", 100).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), "h:100");
    }

    #[test]
    fn test_acquire_refuses_live_local_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        // Our own live pid stands in for "another" live process.
        let live_pid = std::process::id();
        fs::write(&path, format!("h:{live_pid}")).unwrap();

        let result = SingletonLock::acquire_as(&path, "h", live_pid + 1);
        assert!(matches!(result, Err(LockError::AlreadyRunning { .. })));
        // Lock file untouched.
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("h:{live_pid}"));
    }

    #[test]
    fn test_acquire_refuses_foreign_host_even_if_pid_dead() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        fs::write(&path, "other-host:999999").unwrap();

        let result = SingletonLock::acquire_as(&path, "this-host", 100);
        assert!(matches!(result, Err(LockError::AlreadyRunning { .. })));
    }

    #[test]
    fn test_acquire_takes_over_stale_local_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        // Pid (u32::MAX - 1) is effectively guaranteed dead.
        fs::write(&path, "h:4294967294").unwrap();

        let lock = SingletonLock::acquire_as(&path, "h", 77).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), "h:77");
    }

    #[test]
    fn test_acquire_own_pid_reentry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        fs::write(&path, "h:55").unwrap();
        let lock = SingletonLock::acquire_as(&path, "h", 55).unwrap();
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), "h:55");
    }

    #[test]
    fn test_release_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        {
            let _lock = SingletonLock::acquire_as(&path, "h", 100).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_does_not_release_foreign_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("processor.pid");
        {
            let _lock = SingletonLock::acquire_as(&path, "h", 100).unwrap();
            // Simulate a takeover by another process while we hold the lock.
            fs::write(&path, "h:200").unwrap();
        }
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "h:200");
    }

    #[test]
    fn test_album_lock_exclusion() {
        let dir = TempDir::new().unwrap();
        let lock = AlbumLock::acquire(dir.path(), "/queues/other/job_album1").unwrap();
        assert_eq!(
            AlbumLock::current(dir.path()).as_deref(),
            Some("/queues/other/job_album1")
        );

        let second = AlbumLock::acquire(dir.path(), "/queues/other/job_album2");
        assert!(matches!(second, Err(LockError::AlbumBusy(_))));

        // Re-acquiring the same album is allowed.
        drop(AlbumLock::acquire(dir.path(), "/queues/other/job_album1").unwrap());

        lock.release();
        assert!(AlbumLock::current(dir.path()).is_none());
    }
}
