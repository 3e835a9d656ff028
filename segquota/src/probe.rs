//! Storage-event probes: the write-path listeners that keep the shared
//! active-table map current.
//!
//! These run synchronously inside the host's storage manager, so they do
//! bounded work under a short lock and never propagate a failure back into
//! the caller. Dropping an event is acceptable; a further modification of
//! the same relation re-registers it next epoch.

use std::sync::{Arc, PoisonError, RwLock};

use segquota_common::{Metrics, Oid, FIRST_NORMAL_OID};

use crate::host::{Catalog, NodeRole, NodeShmem};
use crate::shmem::InsertOutcome;
use crate::types::RelFileNode;

/// Host object classes surfaced by the post-create probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectClass {
    Relation,
    Other,
}

/// The subscription interface the host's storage manager drives. One
/// callback per storage-file event plus the post-object-create probe.
pub trait StorageEventObserver: Send + Sync {
    fn on_create(&self, node: RelFileNode, backend: Option<i32>);
    fn on_extend(&self, node: RelFileNode, backend: Option<i32>);
    fn on_truncate(&self, node: RelFileNode, backend: Option<i32>);
    fn on_unlink(&self, node: RelFileNode, backend: Option<i32>);
    fn on_object_create(&self, class: ObjectClass, object: Oid, sub_id: u32);
}

/// Fan-out point the host exposes; registering never displaces previously
/// registered observers, it chains after them.
#[derive(Default)]
pub struct StorageEventRegistry {
    observers: RwLock<Vec<Arc<dyn StorageEventObserver>>>,
}

impl StorageEventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn StorageEventObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn snapshot(&self) -> Vec<Arc<dyn StorageEventObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn dispatch_create(&self, node: RelFileNode, backend: Option<i32>) {
        for observer in self.snapshot() {
            observer.on_create(node, backend);
        }
    }

    pub fn dispatch_extend(&self, node: RelFileNode, backend: Option<i32>) {
        for observer in self.snapshot() {
            observer.on_extend(node, backend);
        }
    }

    pub fn dispatch_truncate(&self, node: RelFileNode, backend: Option<i32>) {
        for observer in self.snapshot() {
            observer.on_truncate(node, backend);
        }
    }

    pub fn dispatch_unlink(&self, node: RelFileNode, backend: Option<i32>) {
        for observer in self.snapshot() {
            observer.on_unlink(node, backend);
        }
    }

    pub fn dispatch_object_create(&self, class: ObjectClass, object: Oid, sub_id: u32) {
        for observer in self.snapshot() {
            observer.on_object_create(class, object, sub_id);
        }
    }
}

/// The engine's observer: records changed storage files into the node's
/// shared active-table map and keeps the relation cache warm.
pub struct ActiveTableProbe {
    role: NodeRole,
    shmem: Arc<NodeShmem>,
    catalog: Arc<dyn Catalog>,
    metrics: Metrics,
}

impl ActiveTableProbe {
    pub fn new(
        role: NodeRole,
        shmem: Arc<NodeShmem>,
        catalog: Arc<dyn Catalog>,
        metrics: Metrics,
    ) -> Self {
        Self {
            role,
            shmem,
            catalog,
            metrics,
        }
    }

    fn record(&self, node: RelFileNode) {
        // Sizes are accounted where the bytes live: only primary segments
        // capture file events.
        if self.role != NodeRole::Segment {
            return;
        }
        if !self.shmem.is_monitored(node.db) {
            return;
        }
        match self.shmem.active_tables.insert(node, ()) {
            InsertOutcome::Inserted | InsertOutcome::AlreadyPresent => {}
            InsertOutcome::Full => {
                self.metrics.incr("probe.active_table_overflow");
                warn!(
                    "active table map full ({} slots), dropping entry {}; \
                     it will be re-registered on the next write",
                    self.shmem.active_tables.capacity(),
                    node
                );
            }
        }
    }
}

impl StorageEventObserver for ActiveTableProbe {
    fn on_create(&self, node: RelFileNode, _backend: Option<i32>) {
        self.record(node);
    }

    fn on_extend(&self, node: RelFileNode, _backend: Option<i32>) {
        self.record(node);
    }

    fn on_truncate(&self, node: RelFileNode, _backend: Option<i32>) {
        self.record(node);
    }

    fn on_unlink(&self, node: RelFileNode, _backend: Option<i32>) {
        self.record(node);
        // The file is gone; whatever cache entry pointed at it is stale.
        self.shmem.relation_cache.evict_by_relfilenode(&node);
    }

    fn on_object_create(&self, class: ObjectClass, object: Oid, sub_id: u32) {
        // Skip anything that is not a whole relation-class object.
        if class != ObjectClass::Relation || sub_id != 0 {
            return;
        }
        if object < FIRST_NORMAL_OID {
            return;
        }
        let Some(row) = self.catalog.relation(object) else {
            return;
        };
        if !self.shmem.is_monitored(row.db) {
            return;
        }
        // File probes only see relfilenodes, which cannot be inverted before
        // the catalog row commits; capture the mapping at create time.
        self.shmem.relation_cache.update(&*self.catalog, object);
    }
}
