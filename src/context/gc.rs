use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    context::types::{BLOB_PREFIX, SweepReport},
    error::GatewayError,
    storage::Storage,
};

/// Deletes content blobs that no row references once they are older than the
/// grace period. The grace period covers the gap between a blob write and
/// its row write.
pub struct OrphanSweeper {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl OrphanSweeper {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    pub async fn sweep_orphans(&self, grace: Duration) -> Result<SweepReport, GatewayError> {
        // List blobs before reading references: a row committed after this
        // point belongs to a blob that is still inside the grace period.
        let blobs = self.storage.blob.list(BLOB_PREFIX).await?;
        let referenced: HashSet<String> = self
            .storage
            .relational
            .referenced_blob_keys()
            .await?
            .into_iter()
            .collect();
        let cutoff = self.clock.now() - grace;

        let mut report = SweepReport::default();
        for blob in blobs {
            report.scanned += 1;
            if referenced.contains(&blob.key) || blob.modified_at > cutoff {
                continue;
            }
            match self.storage.blob.delete(&blob.key).await {
                Ok(()) => {
                    report.deleted += 1;
                    tracing::debug!(target: "context", blob_key = %blob.key, "orphan_blob_deleted");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        target: "context",
                        blob_key = %blob.key,
                        error = %err,
                        "orphan_blob_delete_failed"
                    );
                }
            }
        }

        tracing::info!(
            target: "context",
            scanned = report.scanned,
            deleted = report.deleted,
            failed = report.failed,
            "orphan_sweep_finished"
        );
        Ok(report)
    }
}

pub async fn run_gc_worker(
    sweeper: Arc<OrphanSweeper>,
    interval: Duration,
    grace: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; start sweeping one interval in.
    ticker.tick().await;

    tracing::info!(
        target: "context",
        interval_seconds = interval.as_secs(),
        grace_seconds = grace.as_secs(),
        "gc_worker_started"
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = sweeper.sweep_orphans(grace).await {
                    tracing::warn!(target: "context", error = %err, "orphan_sweep_failed");
                }
            }
        }
    }
    tracing::info!(target: "context", "gc_worker_stopped");
}
