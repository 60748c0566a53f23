//! Singleton lock collision behavior across "processes".

use std::fs;
use tempfile::TempDir;

use instrumental_engine::locks::{LockError, SingletonLock};

#[test]
fn test_second_acquire_on_same_host_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("processor.pid");

    // Stand in for a live processor A with this test's own pid.
    let pid_a = std::process::id();
    let lock_a = SingletonLock::acquire_as(&path, "host-h", pid_a).unwrap();

    // Processor B on the same host must be refused, and the lock file must
    // still name A.
    let result = SingletonLock::acquire_as(&path, "host-h", pid_a + 1);
    assert!(matches!(result, Err(LockError::AlreadyRunning { .. })));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        format!("host-h:{pid_a}")
    );

    drop(lock_a);
    assert!(!path.exists());
}

#[test]
fn test_acquire_after_release_succeeds() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("processor.pid");

    let pid = std::process::id();
    drop(SingletonLock::acquire_as(&path, "h", pid).unwrap());
    let lock = SingletonLock::acquire_as(&path, "h", pid + 1).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), format!("h:{}", pid + 1));
    drop(lock);
}

#[test]
fn test_foreign_host_lock_never_taken_over() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("processor.pid");

    // A lock from another host, with a pid that is certainly dead locally.
    fs::write(&path, "other-box:4294967294").unwrap();

    let result = SingletonLock::acquire_as(&path, "this-box", 42);
    assert!(matches!(result, Err(LockError::AlreadyRunning { .. })));
    assert_eq!(fs::read_to_string(&path).unwrap(), "other-box:4294967294");
}

#[test]
fn test_legacy_numeric_lock_is_local() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("processor.pid");

    // Legacy format: bare pid, interpreted as local. Dead pid means the lock
    // is stale and taken over.
    fs::write(&path, "4294967294").unwrap();
    let lock = SingletonLock::acquire_as(&path, "h", 42).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "h:42");
    drop(lock);

    // A live legacy pid refuses.
    fs::write(&path, format!("{}", std::process::id())).unwrap();
    let result = SingletonLock::acquire_as(&path, "h", 42);
    assert!(matches!(result, Err(LockError::AlreadyRunning { .. })));
}
