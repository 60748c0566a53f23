//! Manifest-driven sync router.
//!
//! Polls the outputs root for previously unseen `manifest.json` files,
//! matches each artifact against the route table and drives the configured
//! backend. Transient backend failures defer a manifest to the next poll
//! without blocking later ones; invalid manifests and missing routes (when
//! not skipping) are terminal.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backend::{create_backend, SyncBackend, SyncError};
use super::routes::RouteTable;
use super::seen_store::{SeenStore, StoreError, SyncStatus};
use crate::config::AppConfig;
use crate::events::{Event, EventLog};
use crate::pipeline::JobManifest;

/// Terminal or deferred outcome of one manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// Every artifact was routed and sent (or skipped by configuration).
    Completed,
    /// A transient backend failure; retry on the next poll.
    Deferred,
    /// The manifest does not satisfy the contract.
    Invalid,
    /// A non-retryable failure (missing route without skip, missing file).
    Failed,
}

/// The sync router service.
pub struct SyncRouter {
    outputs_dir: PathBuf,
    table: RouteTable,
    backend: Arc<dyn SyncBackend>,
    store: SeenStore,
    events: Arc<EventLog>,
    poll_interval: Duration,
    skip_on_missing_remote: bool,
    dry_run: bool,
}

impl SyncRouter {
    pub fn new(config: &AppConfig, events: Arc<EventLog>) -> Result<Self, StoreError> {
        let store = SeenStore::open(&config.db_path)?;
        Ok(Self {
            outputs_dir: config.outputs_dir.clone(),
            table: RouteTable::new(
                config.sync.routes.clone(),
                config.sync.remote_roots.clone(),
            ),
            backend: create_backend(&config.sync),
            store,
            events,
            poll_interval: Duration::from_secs(config.sync.poll_interval_sec.max(1)),
            skip_on_missing_remote: config.sync.skip_on_missing_remote,
            dry_run: config.sync.dry_run,
        })
    }

    /// Long-running router loop.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            "sync router starting (backend={}, poll={}s)",
            self.backend.name(),
            self.poll_interval.as_secs()
        );
        loop {
            if let Err(e) = self.poll_once().await {
                warn!("sync poll failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("sync router stopped");
        Ok(())
    }

    /// Manifests under `OUTPUTS_DIR/*/manifest.json`, in discovery order.
    pub fn discover_manifests(&self) -> Vec<PathBuf> {
        let mut manifests = Vec::new();
        let entries = match std::fs::read_dir(&self.outputs_dir) {
            Ok(entries) => entries,
            Err(_) => return manifests,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest = path.join("manifest.json");
            if manifest.is_file() {
                manifests.push(manifest);
            }
        }
        manifests.sort();
        manifests
    }

    /// One poll: process every previously unseen manifest.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let mut handled = 0;
        for manifest_path in self.discover_manifests() {
            let key = manifest_path.to_string_lossy().into_owned();
            if self.store.is_processed(&key)? {
                continue;
            }
            info!("found new manifest: {}", manifest_path.display());
            let outcome = self.sync_manifest(&manifest_path).await?;
            if outcome != ManifestOutcome::Deferred {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Route and transfer one manifest's artifacts.
    pub async fn sync_manifest(&self, manifest_path: &Path) -> anyhow::Result<ManifestOutcome> {
        let key = manifest_path.to_string_lossy().into_owned();
        let value: Value = match std::fs::read_to_string(manifest_path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
        {
            Ok(value) => value,
            Err(error) => {
                return self.reject_invalid(&key, "unknown", &error);
            }
        };
        if let Err(error) = JobManifest::validate_value(&value) {
            let job_id = value["job_id"].as_str().unwrap_or("unknown").to_string();
            return self.reject_invalid(&key, &job_id, &error);
        }

        let job_id = value["job_id"].as_str().unwrap_or_default().to_string();
        let job_dir = manifest_path.parent().unwrap_or(&self.outputs_dir);
        let artifacts = value["artifacts"].as_array().cloned().unwrap_or_default();
        let mut failed = false;

        for artifact in &artifacts {
            let kind = artifact["kind"].as_str().unwrap_or_default();
            let variant = artifact["variant"].as_str().unwrap_or_default();
            let rel_path = artifact["path"].as_str().unwrap_or_default();
            let label = artifact["label"].as_str().unwrap_or(rel_path);

            let destination = match self.table.resolve(kind, variant) {
                Some(dest) => dest,
                None if self.skip_on_missing_remote => {
                    self.events.emit(&Event::SyncSkipped {
                        job_id: job_id.clone(),
                        artifact: Some(rel_path.to_string()),
                        reason: "no_route".to_string(),
                    });
                    warn!("no route for {kind}/{variant} ({label}); skipped");
                    continue;
                }
                None => {
                    self.events.emit(&Event::SyncFailed {
                        job_id: job_id.clone(),
                        artifact: rel_path.to_string(),
                        destination: String::new(),
                        error: format!("no route for {kind}/{variant}"),
                    });
                    failed = true;
                    continue;
                }
            };

            let local = job_dir.join(rel_path);
            match self.backend.send(&local, &destination, self.dry_run).await {
                Ok(()) => {
                    self.events.emit(&Event::SyncSuccess {
                        job_id: job_id.clone(),
                        artifact: rel_path.to_string(),
                        destination: destination.clone(),
                    });
                }
                Err(SyncError::Transient(error)) => {
                    warn!(
                        "transient sync failure for {} ({}); deferring manifest",
                        label, error
                    );
                    return Ok(ManifestOutcome::Deferred);
                }
                Err(SyncError::Fatal(error)) => {
                    self.events.emit(&Event::SyncFailed {
                        job_id: job_id.clone(),
                        artifact: rel_path.to_string(),
                        destination: destination.clone(),
                        error,
                    });
                    failed = true;
                }
            }
        }

        let status = if failed {
            SyncStatus::Failed
        } else {
            SyncStatus::Synced
        };
        self.store.mark(&key, &job_id, status)?;
        Ok(if failed {
            ManifestOutcome::Failed
        } else {
            ManifestOutcome::Completed
        })
    }

    fn reject_invalid(
        &self,
        key: &str,
        job_id: &str,
        error: &str,
    ) -> anyhow::Result<ManifestOutcome> {
        warn!("invalid manifest {}: {}", key, error);
        self.events.emit(&Event::SyncSkipped {
            job_id: job_id.to_string(),
            artifact: None,
            reason: "invalid_manifest".to_string(),
        });
        self.store.mark(key, job_id, SyncStatus::Invalid)?;
        Ok(ManifestOutcome::Invalid)
    }
}
