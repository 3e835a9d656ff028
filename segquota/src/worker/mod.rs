//! Coordination and lifecycle: the per-database refresh workers, the
//! singleton launcher that supervises them, and the epoch clock management
//! commands synchronize on.

mod epoch;
mod launcher;
#[allow(clippy::module_inception)]
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub use epoch::{EpochClock, EpochRegistry};
pub use launcher::{DdlCommand, DdlResult, ExtensionDdlMailbox, Launcher};
pub use worker::Worker;

/// Cooperative shutdown signal: set once, observed at suspension points.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
