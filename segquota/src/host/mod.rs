//! Seams onto the host database. The engine never parses SQL or reads
//! catalogs itself; the host implements these traits and hands them in.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use segquota_common::{Oid, SegId};
use segquota_settings::Settings;

use crate::{
    blocklist::Blocklist,
    error::QuotaResult,
    relcache::RelationCache,
    shmem::ShmemMap,
    types::{FetchMode, RelFileNode, SchemaVersion, StorageKind, TableStat, MAX_MONITORED_DATABASES},
    worker::{EpochRegistry, ExtensionDdlMailbox},
};

/// Which part a process plays in the cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeRole {
    Coordinator,
    Segment,
    /// A replica trailing a segment; never accounts storage.
    Mirror,
}

/// A snapshot of one relation's catalog row, as the host sees it.
#[derive(Clone, Debug)]
pub struct CatalogRelation {
    pub relation: Oid,
    pub owner: Oid,
    pub namespace: Oid,
    pub tablespace: Oid,
    pub db: Oid,
    pub relfilenode: Oid,
    /// Owning backend for temp relations, `None` for persistent ones.
    pub backend: Option<i32>,
    pub storage_kind: StorageKind,
    /// The primary relation this one augments (toast parent, index parent,
    /// append-optimized block-directory parent). `None` when primary.
    pub parent: Option<Oid>,
    pub auxiliaries: Vec<Oid>,
}

/// Catalog access the host exposes to the engine. Implementations answer
/// from the node-local catalog; lookups may race concurrent DDL, which the
/// engine tolerates by re-resolving next epoch.
pub trait Catalog: Send + Sync {
    fn relation(&self, relation: Oid) -> Option<CatalogRelation>;

    fn relation_exists(&self, relation: Oid) -> bool {
        self.relation(relation).is_some()
    }

    /// Invert a storage-file id back to its relation, if the catalog row is
    /// already committed.
    fn resolve_relfilenode(&self, node: &RelFileNode) -> Option<Oid>;

    /// Every user-visible primary relation of a database; drives the bulk
    /// size recompute and the dropped-relation expiry pass.
    fn user_relations(&self, db: Oid) -> Vec<Oid>;

    fn namespace_oid(&self, name: &str) -> Option<Oid>;
    fn role_oid(&self, name: &str) -> Option<Oid>;
    fn tablespace_oid(&self, name: &str) -> Option<Oid>;
    fn database_oid(&self, name: &str) -> Option<Oid>;

    fn namespace_name(&self, oid: Oid) -> Option<String>;
    fn role_name(&self, oid: Oid) -> Option<String>;
    fn tablespace_name(&self, oid: Oid) -> Option<String>;
}

/// One segment's RPC endpoint, as dispatched to by the coordinator. No
/// shared-memory lock may be held across these calls.
#[async_trait]
pub trait SegmentClient: Send + Sync {
    fn seg_id(&self) -> SegId;

    /// The `fetch_table_stat` RPC. `FetchMode::ActiveOids` ignores `oids`
    /// and answers (relation, 0, seg) rows for the drained active set;
    /// `FetchMode::ActiveSizes` sizes each given relation. Row shape
    /// follows `version`.
    async fn fetch_table_stat(
        &self,
        db: Oid,
        mode: FetchMode,
        oids: Vec<Oid>,
        version: SchemaVersion,
    ) -> QuotaResult<Vec<TableStat>>;

    /// Stat one relation shard's files on this segment's disk.
    async fn relation_file_size(
        &self,
        node: RelFileNode,
        backend: Option<i32>,
    ) -> QuotaResult<i64>;
}

/// The shared region every process on one node maps.
#[derive(Debug)]
pub struct NodeShmem {
    pub active_tables: ShmemMap<RelFileNode, ()>,
    pub relation_cache: RelationCache,
    pub monitored_dbs: ShmemMap<Oid, ()>,
}

impl NodeShmem {
    pub fn new(settings: &Settings) -> Self {
        Self {
            active_tables: ShmemMap::new("active_tables", settings.max_active_tables),
            relation_cache: RelationCache::new(settings.relation_cache_capacity),
            monitored_dbs: ShmemMap::new("monitored_dbs", MAX_MONITORED_DATABASES),
        }
    }

    pub fn is_monitored(&self, db: Oid) -> bool {
        self.monitored_dbs.contains(&db)
    }
}

/// Per-database paused flags; enforcement reads them on every check.
#[derive(Debug)]
pub struct PausedFlags {
    flags: ShmemMap<Oid, ()>,
}

impl PausedFlags {
    pub fn new() -> Self {
        Self {
            flags: ShmemMap::new("paused_flags", MAX_MONITORED_DATABASES),
        }
    }

    pub fn pause(&self, db: Oid) {
        self.flags.insert(db, ());
    }

    pub fn resume(&self, db: Oid) {
        self.flags.remove(&db);
    }

    pub fn is_paused(&self, db: Oid) -> bool {
        self.flags.contains(&db)
    }
}

impl Default for PausedFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// The coordinator's shared region: the node-local maps plus everything the
/// worker fleet and the enforcement gate coordinate through.
#[derive(Debug)]
pub struct CoordinatorShmem {
    pub node: Arc<NodeShmem>,
    pub blocklist: Blocklist,
    pub paused: PausedFlags,
    pub epochs: EpochRegistry,
    pub ddl_mailbox: ExtensionDdlMailbox,
}

impl CoordinatorShmem {
    pub fn new(settings: &Settings) -> Self {
        Self {
            node: Arc::new(NodeShmem::new(settings)),
            blocklist: Blocklist::new(settings.max_active_tables),
            paused: PausedFlags::new(),
            epochs: EpochRegistry::new(),
            ddl_mailbox: ExtensionDdlMailbox::new(),
        }
    }
}

/// One segment as the coordinator reaches it: the RPC client plus, for the
/// parts of the engine that run on that node, its shared region.
#[derive(Clone)]
pub struct SegmentHandle {
    pub client: Arc<dyn SegmentClient>,
    pub shmem: Arc<NodeShmem>,
}

/// Everything the coordinator-side engine needs to reach the cluster.
#[derive(Clone)]
pub struct ClusterContext {
    pub catalog: Arc<dyn Catalog>,
    pub coordinator: Arc<CoordinatorShmem>,
    pub segments: Vec<SegmentHandle>,
    /// The coordinator's own file-stat endpoint, so `relation_size` can sum
    /// coordinator-resident files too. It never answers `fetch_table_stat`.
    pub coordinator_client: Option<Arc<dyn SegmentClient>>,
}

impl ClusterContext {
    pub fn seg_count(&self) -> usize {
        self.segments.len()
    }

    pub fn clients(&self) -> Vec<Arc<dyn SegmentClient>> {
        self.segments.iter().map(|s| Arc::clone(&s.client)).collect()
    }

    /// Mark a database (un)monitored on every node so probes start or stop
    /// capturing its storage events.
    pub fn set_monitored(&self, db: Oid, monitored: bool) {
        let all = std::iter::once(&*self.coordinator.node)
            .chain(self.segments.iter().map(|s| &*s.shmem));
        for shmem in all {
            if monitored {
                shmem.monitored_dbs.insert(db, ());
            } else {
                shmem.monitored_dbs.remove(&db);
            }
        }
    }
}
