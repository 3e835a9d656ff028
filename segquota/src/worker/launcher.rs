use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use segquota_common::{Metrics, Oid};
use segquota_settings::Settings;
use segquota_store::StorePool;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{QuotaError, QuotaResult};
use crate::host::ClusterContext;
use crate::types::{SchemaVersion, MAX_MONITORED_DATABASES};
use crate::worker::{ShutdownFlag, Worker};

/// What a management backend asks the launcher to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DdlCommand {
    CreateExtension,
    DropExtension,
}

/// The launcher's answer, left in the mailbox slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DdlResult {
    Pending,
    Ok,
    /// The monitored-database set is at capacity.
    ExceedLimit,
    StartWorkerFailed,
}

#[derive(Clone, Copy, Debug)]
struct DdlMessage {
    command: DdlCommand,
    db: Oid,
    result: DdlResult,
}

/// Single-slot mailbox between management backends and the launcher.
///
/// `ddl_lock` serializes requesters (one command in flight at a time);
/// `message` guards the slot fields themselves. The locks are always taken
/// in that order.
#[derive(Debug, Default)]
pub struct ExtensionDdlMailbox {
    ddl_lock: Mutex<()>,
    message: StdMutex<Option<DdlMessage>>,
    launcher_signal: Notify,
    requester_signal: Notify,
    launcher_alive: AtomicBool,
}

impl ExtensionDdlMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launcher_alive(&self) -> bool {
        self.launcher_alive.load(Ordering::SeqCst)
    }

    pub(crate) fn set_launcher_alive(&self, alive: bool) {
        self.launcher_alive.store(alive, Ordering::SeqCst);
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<DdlMessage>> {
        self.message.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Post a command and wait for the launcher's answer.
    pub async fn request(
        &self,
        command: DdlCommand,
        db: Oid,
        wait_timeout: Duration,
    ) -> QuotaResult<DdlResult> {
        if !self.launcher_alive() {
            return Err(QuotaError::launcher_down());
        }

        let _serialize = self.ddl_lock.lock().await;
        *self.slot() = Some(DdlMessage {
            command,
            db,
            result: DdlResult::Pending,
        });
        self.launcher_signal.notify_one();

        let deadline = Instant::now() + wait_timeout;
        loop {
            let notified = self.requester_signal.notified();
            if let Some(result) = self.take_result() {
                return Ok(result);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Withdraw the command so a late launcher does not act on a
                // request nobody is waiting for.
                self.slot().take();
                return Err(QuotaError::mailbox_timeout());
            }
        }
    }

    fn take_result(&self) -> Option<DdlResult> {
        let mut slot = self.slot();
        match *slot {
            Some(message) if message.result != DdlResult::Pending => {
                *slot = None;
                Some(message.result)
            }
            _ => None,
        }
    }

    pub(crate) async fn launcher_wait(&self) {
        self.launcher_signal.notified().await;
    }

    pub(crate) fn take_pending(&self) -> Option<(DdlCommand, Oid)> {
        let slot = self.slot();
        match *slot {
            Some(message) if message.result == DdlResult::Pending => {
                Some((message.command, message.db))
            }
            _ => None,
        }
    }

    pub(crate) fn complete(&self, result: DdlResult) {
        let mut slot = self.slot();
        if let Some(message) = slot.as_mut() {
            message.result = result;
        }
        drop(slot);
        self.requester_signal.notify_waiters();
    }
}

struct WorkerHandle {
    shutdown: Arc<ShutdownFlag>,
    supervisor: JoinHandle<()>,
}

/// The singleton process supervising one worker per monitored database.
pub struct Launcher {
    ctx: ClusterContext,
    store: StorePool,
    settings: Settings,
    metrics: Metrics,
    version: SchemaVersion,
    workers: StdMutex<HashMap<Oid, WorkerHandle>>,
    shutdown: Arc<ShutdownFlag>,
}

impl Launcher {
    pub fn new(
        ctx: ClusterContext,
        store: StorePool,
        settings: Settings,
        metrics: Metrics,
        version: SchemaVersion,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            store,
            settings,
            metrics,
            version,
            workers: StdMutex::new(HashMap::new()),
            shutdown: Arc::new(ShutdownFlag::new()),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<ShutdownFlag> {
        Arc::clone(&self.shutdown)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_monitoring(&self, db: Oid) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&db)
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let launcher = Arc::clone(self);
        tokio::spawn(async move { launcher.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mailbox = &self.ctx.coordinator.ddl_mailbox;
        mailbox.set_launcher_alive(true);

        // Cold start: resume every database persisted as monitored.
        match self.store.list_monitored_databases().await {
            Ok(dbs) => {
                for db in dbs {
                    self.ctx.set_monitored(db, true);
                    self.start_worker(db);
                }
            }
            Err(e) => {
                warn!("could not read monitored database list: {}", e);
            }
        }
        info!("launcher up, supervising {} workers", self.worker_count());

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = mailbox.launcher_wait() => {
                    if let Some((command, db)) = mailbox.take_pending() {
                        let result = self.handle_command(command, db).await;
                        mailbox.complete(result);
                    }
                }
            }
        }

        let handles: Vec<(Oid, WorkerHandle)> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in &handles {
            handle.shutdown.trigger();
        }
        for (db, handle) in handles {
            if handle.supervisor.await.is_err() {
                warn!("worker supervisor for database {} panicked", db);
            }
        }
        mailbox.set_launcher_alive(false);
        info!("launcher down");
    }

    async fn handle_command(&self, command: DdlCommand, db: Oid) -> DdlResult {
        debug!("launcher handling {:?} for database {}", command, db);
        match command {
            DdlCommand::CreateExtension => {
                if self.worker_count() >= MAX_MONITORED_DATABASES {
                    return DdlResult::ExceedLimit;
                }
                if let Err(e) = self.store.add_monitored_database(db).await {
                    warn!("could not persist monitored database {}: {}", db, e);
                    return DdlResult::StartWorkerFailed;
                }
                self.ctx.set_monitored(db, true);
                self.start_worker(db);
                self.metrics.incr_with_tag("launcher.extension", "op", "create");
                DdlResult::Ok
            }
            DdlCommand::DropExtension => {
                self.stop_worker(db).await;
                self.ctx.set_monitored(db, false);
                self.ctx.coordinator.blocklist.clear_db(db);
                self.ctx.coordinator.paused.resume(db);
                self.ctx.coordinator.epochs.remove(db);
                if let Err(e) = self.store.remove_monitored_database(db).await {
                    warn!("could not unpersist monitored database {}: {}", db, e);
                }
                self.metrics.incr_with_tag("launcher.extension", "op", "drop");
                DdlResult::Ok
            }
        }
    }

    fn start_worker(&self, db: Oid) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.contains_key(&db) {
            return;
        }

        let worker_shutdown = Arc::new(ShutdownFlag::new());
        let supervisor = {
            let ctx = self.ctx.clone();
            let store = self.store.clone();
            let settings = self.settings.clone();
            let metrics = self.metrics.clone();
            let version = self.version;
            let shutdown = Arc::clone(&worker_shutdown);
            let backoff = Duration::from_secs(self.settings.worker_restart_backoff_secs);
            tokio::spawn(async move {
                loop {
                    let worker = Worker::new(
                        db,
                        ctx.clone(),
                        store.clone(),
                        settings.clone(),
                        metrics.clone(),
                        version,
                        Arc::clone(&shutdown),
                    );
                    match worker.run().await {
                        Ok(()) => break,
                        Err(e) => {
                            if shutdown.is_set() {
                                break;
                            }
                            warn!(
                                "worker for database {} died: {}; restarting in {:?}",
                                db, e, backoff
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown.wait() => break,
                            }
                        }
                    }
                }
            })
        };

        workers.insert(
            db,
            WorkerHandle {
                shutdown: worker_shutdown,
                supervisor,
            },
        );
    }

    async fn stop_worker(&self, db: Oid) {
        let handle = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&db);
        if let Some(handle) = handle {
            handle.shutdown.trigger();
            if handle.supervisor.await.is_err() {
                warn!("worker supervisor for database {} panicked", db);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mailbox_round_trip() {
        let mailbox = Arc::new(ExtensionDdlMailbox::new());
        mailbox.set_launcher_alive(true);

        let server = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move {
                loop {
                    mailbox.launcher_wait().await;
                    if let Some((command, db)) = mailbox.take_pending() {
                        assert_eq!(command, DdlCommand::CreateExtension);
                        assert_eq!(db, 5);
                        mailbox.complete(DdlResult::Ok);
                        break;
                    }
                }
            })
        };

        let result = mailbox
            .request(DdlCommand::CreateExtension, 5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, DdlResult::Ok);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn mailbox_withdraws_the_command_on_timeout() {
        let mailbox = ExtensionDdlMailbox::new();
        mailbox.set_launcher_alive(true);

        let err = mailbox
            .request(DdlCommand::DropExtension, 5, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_mailbox_timeout());
        // A late launcher must not find a request nobody waits for.
        assert!(mailbox.take_pending().is_none());
    }

    #[tokio::test]
    async fn request_fails_fast_when_launcher_is_down() {
        let mailbox = ExtensionDdlMailbox::new();
        let err = mailbox
            .request(DdlCommand::CreateExtension, 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_launcher_down());
    }
}
