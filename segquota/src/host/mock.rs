//! In-memory host doubles: a catalog, a segmented cluster with real on-disk
//! storage under a scratch directory, and loopback RPC clients. Used by the
//! test suite and by the demo daemon; production embeds the engine against
//! the real host instead.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use segquota_common::{Metrics, Oid, SegId, FIRST_NORMAL_OID, SEG_ID_TOTAL};
use segquota_settings::Settings;

use crate::error::{QuotaError, QuotaResult};
use crate::host::{
    Catalog, CatalogRelation, ClusterContext, CoordinatorShmem, NodeRole, NodeShmem,
    SegmentClient, SegmentHandle,
};
use crate::probe::{ActiveTableProbe, ObjectClass, StorageEventRegistry};
use crate::segment::SegmentNode;
use crate::types::{FetchMode, RelFileNode, SchemaVersion, StorageKind, TableStat};

#[derive(Default)]
struct CatalogData {
    relations: HashMap<Oid, CatalogRelation>,
    by_node: HashMap<RelFileNode, Oid>,
    namespaces: HashMap<String, Oid>,
    roles: HashMap<String, Oid>,
    tablespaces: HashMap<String, Oid>,
    databases: HashMap<String, Oid>,
}

/// A mutable in-memory catalog shared by every node of the mock cluster.
pub struct MockCatalog {
    data: RwLock<CatalogData>,
    next_oid: AtomicU32,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(CatalogData::default()),
            next_oid: AtomicU32::new(FIRST_NORMAL_OID + 100),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate_oid(&self) -> Oid {
        self.next_oid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn define_database(&self, name: &str) -> Oid {
        let oid = self.allocate_oid();
        self.write().databases.insert(name.to_owned(), oid);
        oid
    }

    pub fn define_namespace(&self, name: &str) -> Oid {
        let oid = self.allocate_oid();
        self.write().namespaces.insert(name.to_owned(), oid);
        oid
    }

    pub fn define_role(&self, name: &str) -> Oid {
        let oid = self.allocate_oid();
        self.write().roles.insert(name.to_owned(), oid);
        oid
    }

    pub fn define_tablespace(&self, name: &str) -> Oid {
        let oid = self.allocate_oid();
        self.write().tablespaces.insert(name.to_owned(), oid);
        oid
    }

    /// Register a relation row. Auxiliary relations name their parent and
    /// are linked into its auxiliary list.
    #[allow(clippy::too_many_arguments)]
    pub fn create_relation(
        &self,
        db: Oid,
        namespace: Oid,
        owner: Oid,
        tablespace: Oid,
        storage_kind: StorageKind,
        parent: Option<Oid>,
        backend: Option<i32>,
    ) -> Oid {
        let relation = self.allocate_oid();
        let relfilenode = self.allocate_oid();
        let row = CatalogRelation {
            relation,
            owner,
            namespace,
            tablespace,
            db,
            relfilenode,
            backend,
            storage_kind,
            parent,
            auxiliaries: Vec::new(),
        };
        let mut data = self.write();
        data.by_node
            .insert(RelFileNode::new(db, tablespace, relfilenode), relation);
        if let Some(parent) = parent {
            if let Some(parent_row) = data.relations.get_mut(&parent) {
                parent_row.auxiliaries.push(relation);
            }
        }
        data.relations.insert(relation, row);
        relation
    }

    /// Drop a relation and everything auxiliary to it.
    pub fn drop_relation(&self, relation: Oid) -> Vec<RelFileNode> {
        let mut data = self.write();
        let mut removed_nodes = Vec::new();
        let mut pending = vec![relation];
        while let Some(oid) = pending.pop() {
            let Some(row) = data.relations.remove(&oid) else {
                continue;
            };
            data.by_node
                .remove(&RelFileNode::new(row.db, row.tablespace, row.relfilenode));
            removed_nodes.push(RelFileNode::new(row.db, row.tablespace, row.relfilenode));
            if let Some(parent) = row.parent {
                if let Some(parent_row) = data.relations.get_mut(&parent) {
                    parent_row.auxiliaries.retain(|&aux| aux != oid);
                }
            }
            pending.extend(row.auxiliaries);
        }
        removed_nodes
    }
}

impl Default for MockCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for MockCatalog {
    fn relation(&self, relation: Oid) -> Option<CatalogRelation> {
        self.read().relations.get(&relation).cloned()
    }

    fn resolve_relfilenode(&self, node: &RelFileNode) -> Option<Oid> {
        self.read().by_node.get(node).copied()
    }

    fn user_relations(&self, db: Oid) -> Vec<Oid> {
        self.read()
            .relations
            .values()
            .filter(|row| row.db == db && row.parent.is_none())
            .map(|row| row.relation)
            .collect()
    }

    fn namespace_oid(&self, name: &str) -> Option<Oid> {
        self.read().namespaces.get(name).copied()
    }

    fn role_oid(&self, name: &str) -> Option<Oid> {
        self.read().roles.get(name).copied()
    }

    fn tablespace_oid(&self, name: &str) -> Option<Oid> {
        self.read().tablespaces.get(name).copied()
    }

    fn database_oid(&self, name: &str) -> Option<Oid> {
        self.read().databases.get(name).copied()
    }

    fn namespace_name(&self, oid: Oid) -> Option<String> {
        find_name(&self.read().namespaces, oid)
    }

    fn role_name(&self, oid: Oid) -> Option<String> {
        find_name(&self.read().roles, oid)
    }

    fn tablespace_name(&self, oid: Oid) -> Option<String> {
        find_name(&self.read().tablespaces, oid)
    }
}

fn find_name(names: &HashMap<String, Oid>, oid: Oid) -> Option<String> {
    names
        .iter()
        .find(|(_, &candidate)| candidate == oid)
        .map(|(name, _)| name.clone())
}

/// Loopback RPC client: calls straight into the segment's local service.
/// Can be made to fail to exercise the partial-epoch paths.
pub struct MockSegmentClient {
    node: Arc<SegmentNode>,
    failing: AtomicBool,
}

impl MockSegmentClient {
    pub fn new(node: Arc<SegmentNode>) -> Self {
        Self {
            node,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SegmentClient for MockSegmentClient {
    fn seg_id(&self) -> SegId {
        self.node.seg_id()
    }

    async fn fetch_table_stat(
        &self,
        db: Oid,
        mode: FetchMode,
        oids: Vec<Oid>,
        version: SchemaVersion,
    ) -> QuotaResult<Vec<TableStat>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QuotaError::rpc(format!(
                "segment {} unreachable",
                self.node.seg_id()
            )));
        }
        self.node.fetch_table_stat(db, mode, &oids, version)
    }

    async fn relation_file_size(
        &self,
        node: RelFileNode,
        backend: Option<i32>,
    ) -> QuotaResult<i64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QuotaError::rpc(format!(
                "segment {} unreachable",
                self.node.seg_id()
            )));
        }
        Ok(self.node.relation_size_local(node, backend))
    }
}

/// One mock segment: its shared region, its storage-event registry with the
/// engine's probe registered, and its loopback client.
pub struct MockSegment {
    pub shmem: Arc<NodeShmem>,
    pub registry: StorageEventRegistry,
    pub node: Arc<SegmentNode>,
    pub client: Arc<MockSegmentClient>,
}

/// A whole in-process cluster: catalog, coordinator region, N segments with
/// on-disk scratch storage.
pub struct MockCluster {
    pub catalog: Arc<MockCatalog>,
    pub coordinator: Arc<CoordinatorShmem>,
    pub coordinator_registry: StorageEventRegistry,
    pub coordinator_node: Arc<SegmentNode>,
    pub segments: Vec<MockSegment>,
}

impl MockCluster {
    pub fn new(seg_count: usize, settings: &Settings, data_root: PathBuf) -> Self {
        let catalog = Arc::new(MockCatalog::new());
        let coordinator = Arc::new(CoordinatorShmem::new(settings));
        let metrics = Metrics::noop();

        let mut segments = Vec::with_capacity(seg_count);
        for seg_id in 0..seg_count {
            let shmem = Arc::new(NodeShmem::new(settings));
            let node = Arc::new(SegmentNode::new(
                seg_id as SegId,
                NodeRole::Segment,
                catalog.clone() as Arc<dyn Catalog>,
                Arc::clone(&shmem),
                data_root.join(format!("seg{}", seg_id)),
                metrics.clone(),
            ));
            let registry = StorageEventRegistry::new();
            registry.register(Arc::new(ActiveTableProbe::new(
                NodeRole::Segment,
                Arc::clone(&shmem),
                catalog.clone() as Arc<dyn Catalog>,
                metrics.clone(),
            )));
            segments.push(MockSegment {
                shmem,
                registry,
                client: Arc::new(MockSegmentClient::new(Arc::clone(&node))),
                node,
            });
        }

        // The coordinator gets the same wiring with the coordinator role:
        // its probe short-circuits and its stat service only answers
        // relation_file_size. It shares the coordinator's node region so
        // the evaluator sees what the object-create probe cached.
        let coordinator_node = Arc::new(SegmentNode::new(
            SEG_ID_TOTAL,
            NodeRole::Coordinator,
            catalog.clone() as Arc<dyn Catalog>,
            Arc::clone(&coordinator.node),
            data_root.join("coordinator"),
            metrics.clone(),
        ));
        let coordinator_registry = StorageEventRegistry::new();
        coordinator_registry.register(Arc::new(ActiveTableProbe::new(
            NodeRole::Coordinator,
            Arc::clone(&coordinator.node),
            catalog.clone() as Arc<dyn Catalog>,
            metrics,
        )));

        Self {
            catalog,
            coordinator,
            coordinator_registry,
            coordinator_node,
            segments,
        }
    }

    pub fn context(&self) -> ClusterContext {
        ClusterContext {
            catalog: self.catalog.clone() as Arc<dyn Catalog>,
            coordinator: Arc::clone(&self.coordinator),
            segments: self
                .segments
                .iter()
                .map(|segment| SegmentHandle {
                    client: Arc::clone(&segment.client) as Arc<dyn SegmentClient>,
                    shmem: Arc::clone(&segment.shmem),
                })
                .collect(),
            coordinator_client: Some(Arc::new(MockSegmentClient::new(Arc::clone(
                &self.coordinator_node,
            ))) as Arc<dyn SegmentClient>),
        }
    }

    pub fn seg_count(&self) -> usize {
        self.segments.len()
    }

    /// Create a heap table and announce it through every node's post-create
    /// probe, the way the host fires the object-access hook.
    pub fn create_table(&self, db: Oid, namespace: Oid, owner: Oid, tablespace: Oid) -> Oid {
        let relation = self.catalog.create_relation(
            db,
            namespace,
            owner,
            tablespace,
            StorageKind::Heap,
            None,
            None,
        );
        self.dispatch_object_create(relation);
        relation
    }

    /// Create an append-optimized table; its storage grows as immutable
    /// numbered segment files rather than updatable pages.
    pub fn create_ao_table(&self, db: Oid, namespace: Oid, owner: Oid, tablespace: Oid) -> Oid {
        let relation = self.catalog.create_relation(
            db,
            namespace,
            owner,
            tablespace,
            StorageKind::AppendOptimized,
            None,
            None,
        );
        self.dispatch_object_create(relation);
        relation
    }

    /// Attach an auxiliary relation (toast table, index, AO block
    /// directory) to a primary.
    pub fn create_auxiliary(&self, primary: Oid, storage_kind: StorageKind) -> Oid {
        let row = self
            .catalog
            .relation(primary)
            .expect("auxiliary of unknown primary");
        let relation = self.catalog.create_relation(
            row.db,
            row.namespace,
            row.owner,
            row.tablespace,
            storage_kind,
            Some(primary),
            None,
        );
        self.dispatch_object_create(relation);
        relation
    }

    fn dispatch_object_create(&self, relation: Oid) {
        self.coordinator_registry
            .dispatch_object_create(ObjectClass::Relation, relation, 0);
        for segment in &self.segments {
            segment
                .registry
                .dispatch_object_create(ObjectClass::Relation, relation, 0);
        }
    }

    /// Grow a relation's shard file on one segment to `len` bytes and fire
    /// the extend probe, like a write landing on that shard.
    pub fn extend_on_segment(&self, relation: Oid, seg: usize, len: u64) {
        let row = self
            .catalog
            .relation(relation)
            .expect("extend of unknown relation");
        let node = RelFileNode::new(row.db, row.tablespace, row.relfilenode);
        let segment = &self.segments[seg];
        let path = segment.node.storage_path(&node, row.backend);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).expect("could not create shard directory");
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .expect("could not open shard file");
        file.set_len(len).expect("could not grow shard file");
        segment.registry.dispatch_extend(node, row.backend);
    }

    /// Spread `total` bytes evenly across all segments.
    pub fn extend_evenly(&self, relation: Oid, total: u64) {
        let per_seg = total / self.segments.len() as u64;
        for seg in 0..self.segments.len() {
            self.extend_on_segment(relation, seg, per_seg);
        }
    }

    /// Unlink a relation's files everywhere and drop it from the catalog,
    /// firing the unlink probes.
    pub fn drop_table(&self, relation: Oid) {
        let Some(row) = self.catalog.relation(relation) else {
            return;
        };
        let nodes = self.catalog.drop_relation(relation);
        for node in nodes {
            for segment in &self.segments {
                let path = segment.node.storage_path(&node, row.backend);
                let _ = fs::remove_file(path);
                segment.registry.dispatch_unlink(node, row.backend);
            }
        }
    }
}
