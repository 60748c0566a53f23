//! Transfer backends for the sync router.
//!
//! Each backend is one operation: send a local file or directory to a
//! remote destination. rsync, scp and the S3 CLI are subprocess adapters
//! with a wall-clock bound; `local` is an in-process copy used for testing
//! and locally mounted storage. All backends honor dry-run.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::{SyncMethod, SyncSettings};

/// Upper bound for one transfer.
const TRANSFER_TIMEOUT_SEC: u64 = 3600;

/// Transfer failure, split by recoverability.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Worth retrying on a later poll (network, remote busy, timeout).
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help (missing local file, bad configuration).
    #[error("fatal: {0}")]
    Fatal(String),
}

/// A pluggable transfer backend.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Transfer `local` into `remote`, creating intermediate directories
    /// where the transport supports it.
    async fn send(&self, local: &Path, remote: &str, dry_run: bool) -> Result<(), SyncError>;

    fn name(&self) -> &'static str;
}

/// Build the configured backend.
pub fn create_backend(settings: &SyncSettings) -> Arc<dyn SyncBackend> {
    match settings.method {
        SyncMethod::Rsync => Arc::new(RsyncBackend {
            bw_limit_kbps: settings.rsync_bw_limit_kbps,
            compress: settings.rsync_compress,
        }),
        SyncMethod::S3 => Arc::new(S3Backend {
            bucket: settings.s3_bucket.clone(),
            prefix: settings.s3_prefix.trim_end_matches('/').to_string(),
            region: settings.s3_region.clone(),
            endpoint: settings.s3_endpoint.clone(),
        }),
        SyncMethod::Scp => Arc::new(ScpBackend {
            host: settings.scp_host.clone(),
            user: settings.scp_user.clone(),
            key: settings.scp_key.clone(),
        }),
        SyncMethod::Local => Arc::new(LocalBackend),
    }
}

/// Run a transfer subprocess; nonzero exit and timeout are transient.
async fn run_transfer(mut cmd: Command, label: &str) -> Result<(), SyncError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    let output = match tokio::time::timeout(
        Duration::from_secs(TRANSFER_TIMEOUT_SEC),
        cmd.output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(SyncError::Transient(format!("{label}: {e}"))),
        Err(_) => {
            return Err(SyncError::Transient(format!(
                "{label}: timed out after {TRANSFER_TIMEOUT_SEC}s"
            )))
        }
    };
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(SyncError::Transient(format!(
            "{label}: {}",
            stderr.trim()
        )))
    }
}

fn require_local(local: &Path) -> Result<(), SyncError> {
    if local.exists() {
        Ok(())
    } else {
        Err(SyncError::Fatal(format!(
            "local path does not exist: {}",
            local.display()
        )))
    }
}

/// rsync, for local NAS or SSH-mounted paths.
pub struct RsyncBackend {
    pub bw_limit_kbps: u64,
    pub compress: bool,
}

#[async_trait]
impl SyncBackend for RsyncBackend {
    async fn send(&self, local: &Path, remote: &str, dry_run: bool) -> Result<(), SyncError> {
        require_local(local)?;
        let mut cmd = Command::new("rsync");
        cmd.arg("-av").arg("--mkpath");
        if self.compress {
            cmd.arg("-z");
        }
        if self.bw_limit_kbps > 0 {
            cmd.arg("--bwlimit").arg(self.bw_limit_kbps.to_string());
        }
        // Trailing slash on a directory source syncs its contents.
        let mut source = local.to_string_lossy().into_owned();
        if local.is_dir() && !source.ends_with('/') {
            source.push('/');
        }
        let dest = format!("{}/", remote.trim_end_matches('/'));
        if dry_run {
            info!("[dry run] rsync {} -> {}", source, dest);
            return Ok(());
        }
        cmd.arg(&source).arg(&dest);
        run_transfer(cmd, "rsync").await
    }

    fn name(&self) -> &'static str {
        "rsync"
    }
}

/// S3-compatible storage via the `aws` CLI.
pub struct S3Backend {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint: Option<String>,
}

impl S3Backend {
    fn s3_url(&self, remote: &str, local: &Path) -> String {
        let key_dir = remote.trim_matches('/');
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.prefix.is_empty() {
            format!("s3://{}/{}/{}", self.bucket, key_dir, name)
        } else {
            format!("s3://{}/{}/{}/{}", self.bucket, self.prefix, key_dir, name)
        }
    }
}

#[async_trait]
impl SyncBackend for S3Backend {
    async fn send(&self, local: &Path, remote: &str, dry_run: bool) -> Result<(), SyncError> {
        require_local(local)?;
        let url = self.s3_url(remote, local);
        if dry_run {
            info!("[dry run] s3 {} -> {}", local.display(), url);
            return Ok(());
        }
        let mut cmd = Command::new("aws");
        cmd.arg("s3").arg("cp");
        if local.is_dir() {
            cmd.arg("--recursive");
        }
        cmd.arg("--region").arg(&self.region);
        if let Some(endpoint) = &self.endpoint {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        cmd.arg(local).arg(&url);
        run_transfer(cmd, "s3").await
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

/// scp to a remote host.
pub struct ScpBackend {
    pub host: String,
    pub user: String,
    pub key: String,
}

#[async_trait]
impl SyncBackend for ScpBackend {
    async fn send(&self, local: &Path, remote: &str, dry_run: bool) -> Result<(), SyncError> {
        require_local(local)?;
        let target = format!("{}@{}:{}", self.user, self.host, remote);
        if dry_run {
            info!("[dry run] scp {} -> {}", local.display(), target);
            return Ok(());
        }
        let mut cmd = Command::new("scp");
        cmd.arg("-r");
        if !self.key.is_empty() {
            cmd.arg("-i").arg(&self.key);
        }
        cmd.arg(local).arg(&target);
        run_transfer(cmd, "scp").await
    }

    fn name(&self) -> &'static str {
        "scp"
    }
}

/// In-process copy into a local directory, rsync-style (the file lands
/// INSIDE the destination directory).
pub struct LocalBackend;

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl SyncBackend for LocalBackend {
    async fn send(&self, local: &Path, remote: &str, dry_run: bool) -> Result<(), SyncError> {
        require_local(local)?;
        let remote_base = PathBuf::from(remote);
        let target = remote_base.join(
            local
                .file_name()
                .ok_or_else(|| SyncError::Fatal("source has no file name".to_string()))?,
        );
        if dry_run {
            info!("[dry run] copy {} -> {}", local.display(), target.display());
            return Ok(());
        }
        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(&remote_base)?;
            if local.is_dir() {
                if target.exists() {
                    std::fs::remove_dir_all(&target)?;
                }
                copy_tree(local, &target)?;
            } else {
                std::fs::copy(local, &target)?;
            }
            Ok(())
        })();
        result.map_err(|e| {
            error!("local copy failed: {}", e);
            SyncError::Transient(format!("local copy: {e}"))
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
