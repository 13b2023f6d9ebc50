//! Background orphan sweeper
//!
//! Runs periodically to reclaim what a crash can leave behind: blobs written
//! to storage whose metadata never committed, and content objects stranded at
//! zero references. Blobs younger than the grace period are left alone since
//! they may belong to an upload that is still in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::error::VaultResult;
use crate::metadata::{content_repo, MetadataStore};
use crate::service::content_store::ContentStore;
use crate::service::user_context::RequestContext;

/// Sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Enable the background sweeper
    pub enabled: bool,
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Minimum age in seconds before an unreferenced blob is reaped
    pub grace_period_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            grace_period_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub blobs_removed: usize,
    pub objects_purged: usize,
}

pub struct OrphanSweeper {
    metadata: Arc<MetadataStore>,
    content: ContentStore,
    interval: Duration,
    grace_period: Duration,
}

impl OrphanSweeper {
    pub fn new(metadata: Arc<MetadataStore>, content: ContentStore, config: &SweeperConfig) -> Self {
        Self {
            metadata,
            content,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            grace_period: Duration::from_secs(config.grace_period_secs),
        }
    }

    /// Start the sweeper as a background task (non-blocking)
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        info!("Starting orphan sweeper with {}s interval", self.interval.as_secs());

        tokio::spawn(async move {
            let mut interval = time::interval(self.interval);
            let sweeper = Arc::new(self);

            loop {
                interval.tick().await;

                let worker = Arc::clone(&sweeper);
                match tokio::task::spawn_blocking(move || worker.sweep(SystemTime::now())).await {
                    Ok(Ok(report)) if report != SweepReport::default() => {
                        info!(
                            "Sweep removed {} orphaned blobs and purged {} stranded objects",
                            report.blobs_removed, report.objects_purged
                        );
                    }
                    Ok(Ok(_)) => debug!("Sweep found nothing to reclaim"),
                    Ok(Err(e)) => error!("Error sweeping orphans: {}", e),
                    Err(e) => error!("Sweep task failed: {}", e),
                }
            }
        })
    }

    /// One full pass. `now` is the reference point for the grace period.
    pub fn sweep(&self, now: SystemTime) -> VaultResult<SweepReport> {
        let ctx = RequestContext::anonymous();
        let mut report = SweepReport::default();

        // Stranded objects first, so their blobs become orphans in this same pass
        let stranded = self.metadata.read(&ctx, content_repo::find_unreferenced)?;
        for object in stranded {
            let purged = self
                .metadata
                .unit_of_work(&ctx, |uow| content_repo::delete_unreferenced(uow, object.id));
            match purged {
                Ok(true) => {
                    warn!("Purged stranded content object {} with no references", object.id);
                    report.objects_purged += 1;
                }
                Ok(false) => debug!("Content object {} was relinked before purge", object.id),
                Err(e) => error!("Failed to purge stranded content object {}: {}", object.id, e),
            }
        }

        let known: HashSet<String> = self.metadata.read(&ctx, |conn| {
            let mut stmt = conn.prepare("SELECT storage_locator FROM content_objects")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
        })?;

        for blob in self.content.blobs().list_locators()? {
            if known.contains(blob.locator.as_str()) {
                continue;
            }
            let age = now.duration_since(blob.modified).unwrap_or_default();
            if age < self.grace_period {
                debug!("Skipping young unreferenced blob {} ({}s old)", blob.locator, age.as_secs());
                continue;
            }
            // Re-check right before removal; an upload may have committed meanwhile
            if self
                .metadata
                .read(&ctx, |conn| content_repo::find_by_locator(conn, &blob.locator))?
                .is_some()
            {
                continue;
            }
            match self.content.blobs().remove_at_locator(&blob.locator) {
                Ok(true) => {
                    warn!("Removed orphaned blob {} ({}s old)", blob.locator, age.as_secs());
                    report.blobs_removed += 1;
                }
                Ok(false) => {}
                Err(e) => error!("Failed to remove orphaned blob {}: {}", blob.locator, e),
            }
        }

        Ok(report)
    }
}
