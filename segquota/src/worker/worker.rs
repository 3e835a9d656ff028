use std::sync::Arc;
use std::time::Duration;

use segquota_common::{Metrics, Oid};
use segquota_settings::Settings;
use segquota_store::StorePool;

use crate::error::QuotaResult;
use crate::host::ClusterContext;
use crate::model::QuotaModel;
use crate::types::SchemaVersion;
use crate::worker::{EpochClock, ShutdownFlag};

/// The per-database refresh loop: sleep, pull sizes from the cluster,
/// re-evaluate quotas, advance the epoch, repeat.
pub struct Worker {
    db: Oid,
    ctx: ClusterContext,
    store: StorePool,
    settings: Settings,
    metrics: Metrics,
    epoch: Arc<EpochClock>,
    shutdown: Arc<ShutdownFlag>,
    model: QuotaModel,
}

impl Worker {
    pub fn new(
        db: Oid,
        ctx: ClusterContext,
        store: StorePool,
        settings: Settings,
        metrics: Metrics,
        version: SchemaVersion,
        shutdown: Arc<ShutdownFlag>,
    ) -> Self {
        let epoch = ctx.coordinator.epochs.clock(db);
        Self {
            db,
            ctx,
            store,
            settings,
            metrics,
            epoch,
            shutdown,
            model: QuotaModel::new(db, version),
        }
    }

    pub async fn run(mut self) -> QuotaResult<()> {
        info!("diskquota worker for database {} up", self.db);
        let naptime = Duration::from_secs(self.settings.naptime_secs);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(naptime) => {}
                _ = self.shutdown.wait() => {}
            }
            if self.shutdown.is_set() {
                break;
            }

            if !self.ctx.coordinator.paused.is_paused(self.db) {
                let _timed = self.metrics.refresh_timer(self.db);
                match self.model.refresh(&self.ctx, &self.store, &self.metrics).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        error!("worker for database {} hit a fatal error: {}", self.db, e);
                        return Err(e);
                    }
                    Err(e) => {
                        // Transient trouble: affected relations keep their
                        // last-known sizes, the next tick retries.
                        warn!("refresh failed for database {}: {}", self.db, e);
                        self.metrics.incr("worker.refresh_failed");
                    }
                }
            }

            self.epoch.advance();

            if self.shutdown.is_set() {
                break;
            }
        }

        info!("diskquota worker for database {} down", self.db);
        Ok(())
    }
}
