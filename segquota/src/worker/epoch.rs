use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use segquota_common::Oid;
use tokio::sync::Notify;

/// A per-database monotonically increasing counter, advanced at the end of
/// each refresh cycle. Management commands and tests block on it to observe
/// "the worker looked at the world again".
#[derive(Debug, Default)]
pub struct EpochClock {
    epoch: AtomicU64,
    notify: Notify,
}

impl EpochClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn advance(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until the epoch has advanced past `from`. Returns promptly if
    /// it already has.
    pub async fn wait_past(&self, from: u64) {
        loop {
            let notified = self.notify.notified();
            if self.current() > from {
                return;
            }
            notified.await;
        }
    }
}

/// The coordinator-shared registry of epoch clocks, one per worker.
#[derive(Debug, Default)]
pub struct EpochRegistry {
    clocks: RwLock<HashMap<Oid, Arc<EpochClock>>>,
}

impl EpochRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the clock for a database, creating it on first use so waiters
    /// and the worker agree on one instance regardless of startup order.
    pub fn clock(&self, db: Oid) -> Arc<EpochClock> {
        let mut clocks = self.clocks.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(clocks.entry(db).or_default())
    }

    pub fn get(&self, db: Oid) -> Option<Arc<EpochClock>> {
        self.clocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&db)
            .cloned()
    }

    pub fn remove(&self, db: Oid) {
        self.clocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&db);
    }
}
