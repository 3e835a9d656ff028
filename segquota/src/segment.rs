//! Segment-local size service: answers the coordinator's two per-epoch
//! RPCs and stats relation files on the local disk.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use segquota_common::{Metrics, Oid, SegId, SEG_ID_TOTAL};

use crate::error::{QuotaError, QuotaResult};
use crate::host::{Catalog, NodeRole, NodeShmem};
use crate::types::{FetchMode, RelFileNode, SchemaVersion, TableStat};

/// Free-space map and visibility map companions of each storage segment.
const FORK_SUFFIXES: &[&str] = &["", "_fsm", "_vm"];

pub struct SegmentNode {
    seg_id: SegId,
    role: NodeRole,
    catalog: Arc<dyn Catalog>,
    shmem: Arc<NodeShmem>,
    data_dir: PathBuf,
    metrics: Metrics,
}

impl SegmentNode {
    pub fn new(
        seg_id: SegId,
        role: NodeRole,
        catalog: Arc<dyn Catalog>,
        shmem: Arc<NodeShmem>,
        data_dir: PathBuf,
        metrics: Metrics,
    ) -> Self {
        Self {
            seg_id,
            role,
            catalog,
            shmem,
            data_dir,
            metrics,
        }
    }

    pub fn seg_id(&self) -> SegId {
        self.seg_id
    }

    pub fn shmem(&self) -> &Arc<NodeShmem> {
        &self.shmem
    }

    /// Where one relation shard's main fork lives under the data directory.
    pub fn storage_path(&self, node: &RelFileNode, backend: Option<i32>) -> PathBuf {
        let file_name = match backend {
            Some(backend) => format!("t{}_{}", backend, node.relfilenode),
            None => node.relfilenode.to_string(),
        };
        self.data_dir
            .join(node.tablespace.to_string())
            .join(node.db.to_string())
            .join(file_name)
    }

    /// The `fetch_table_stat` RPC body. Answers nothing on the coordinator
    /// or a mirror: only primary segments account storage.
    pub fn fetch_table_stat(
        &self,
        db: Oid,
        mode: FetchMode,
        oids: &[Oid],
        version: SchemaVersion,
    ) -> QuotaResult<Vec<TableStat>> {
        if self.role != NodeRole::Segment {
            return Ok(Vec::new());
        }
        match mode {
            FetchMode::ActiveOids => Ok(self.fetch_active_oids(db)),
            FetchMode::ActiveSizes => Ok(self.fetch_active_sizes(oids, version)),
        }
    }

    /// Drain the active-file map and resolve each entry to the primary
    /// relation it belongs to. Entries for other databases, and entries
    /// whose catalog row is not yet visible, go back for a later epoch.
    fn fetch_active_oids(&self, db: Oid) -> Vec<TableStat> {
        // Drain into a local buffer first; a cancelled call must not leave
        // the shared map half-drained.
        let drained = self.shmem.active_tables.drain();

        let mut primaries: HashSet<Oid> = HashSet::new();
        let mut requeue = Vec::new();
        for (node, ()) in drained {
            if node.db != db {
                requeue.push((node, ()));
                continue;
            }
            let relation = self
                .catalog
                .resolve_relfilenode(&node)
                .or_else(|| self.shmem.relation_cache.lookup_by_relfilenode(&node));
            match relation {
                Some(relation) => {
                    // Keep the cache warm so the primary lookup is O(1) for
                    // the write path too.
                    self.shmem.relation_cache.update(&*self.catalog, relation);
                    primaries.insert(self.shmem.relation_cache.lookup_primary(relation));
                }
                None => {
                    // Dropped, or created by a transaction that has not
                    // committed yet.
                    requeue.push((node, ()));
                }
            }
        }

        let dropped = self.shmem.active_tables.restore(requeue);
        if dropped > 0 {
            self.metrics.count("segment.requeue_overflow", dropped as i64);
            warn!(
                "active table map refilled while draining, {} unresolved entries lost",
                dropped
            );
        }

        primaries
            .into_iter()
            .map(|relation| TableStat {
                relation,
                size: 0,
                seg_id: self.seg_id,
            })
            .collect()
    }

    /// Size every requested relation. Each computation is its own fallible
    /// unit: an error (relation dropped mid-epoch, catalog race) yields
    /// size 0 for that relation and the pass continues.
    fn fetch_active_sizes(&self, oids: &[Oid], version: SchemaVersion) -> Vec<TableStat> {
        let seg_id = if version.has_seg_id() {
            self.seg_id
        } else {
            SEG_ID_TOTAL
        };
        oids.iter()
            .map(|&relation| {
                let size = match self.try_relation_size(relation) {
                    Ok(size) => size,
                    Err(e) => {
                        self.metrics.incr("segment.size_failed");
                        warn!(
                            "size of relation {} unavailable this epoch: {}",
                            relation, e
                        );
                        0
                    }
                };
                TableStat {
                    relation,
                    size,
                    seg_id,
                }
            })
            .collect()
    }

    /// `pg_table_size` equivalent: all forks of the relation and of every
    /// auxiliary relation hanging off it.
    fn try_relation_size(&self, relation: Oid) -> QuotaResult<i64> {
        let mut total = 0;
        let mut visited = HashSet::new();
        let mut pending = vec![relation];
        while let Some(oid) = pending.pop() {
            if !visited.insert(oid) {
                continue;
            }
            let row = self.catalog.relation(oid).ok_or_else(|| {
                QuotaError::catalog(format!("relation {} does not exist", oid))
            })?;
            total += self.relation_size_local(
                RelFileNode::new(row.db, row.tablespace, row.relfilenode),
                row.backend,
            );
            pending.extend(row.auxiliaries);
        }
        Ok(total)
    }

    /// Stat one shard's files directly: the main fork plus fsm/vm forks,
    /// each with its numbered extension segments. A file unlinked between
    /// resolution and stat counts as 0 rather than raising.
    pub fn relation_size_local(&self, node: RelFileNode, backend: Option<i32>) -> i64 {
        let base = self.storage_path(&node, backend);
        let mut total = 0;
        for suffix in FORK_SUFFIXES {
            let fork = if suffix.is_empty() {
                base.clone()
            } else {
                append_to_path(&base, suffix)
            };
            total += file_size(&fork).unwrap_or(0);
            // Extension segments: <file>.1, <file>.2, ... until a gap.
            for n in 1.. {
                match file_size(&append_to_path(&fork, &format!(".{}", n))) {
                    Some(size) => total += size,
                    None => break,
                }
            }
        }
        total
    }
}

fn append_to_path(path: &PathBuf, suffix: &str) -> PathBuf {
    let mut s = path.clone().into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// `None` means the file does not exist; a file dropped between resolution
/// and stat is simply not counted.
fn file_size(path: &PathBuf) -> Option<i64> {
    match fs::metadata(path) {
        Ok(meta) => Some(meta.len() as i64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("stat of {:?} failed: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use segquota_settings::Settings;
    use temp_dir::TempDir;

    use super::*;
    use crate::host::mock::MockCatalog;
    use crate::types::StorageKind;

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<MockCatalog>,
        node: SegmentNode,
        db: Oid,
    }

    fn fixture(role: NodeRole) -> Fixture {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            max_active_tables: 64,
            ..Default::default()
        };
        let catalog = Arc::new(MockCatalog::new());
        let db = catalog.define_database("db");
        let node = SegmentNode::new(
            0,
            role,
            catalog.clone() as Arc<dyn Catalog>,
            Arc::new(NodeShmem::new(&settings)),
            dir.child("seg0"),
            Metrics::noop(),
        );
        Fixture {
            _dir: dir,
            catalog,
            node,
            db,
        }
    }

    fn make_file(path: &std::path::Path, len: u64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .unwrap();
        file.set_len(len).unwrap();
    }

    fn heap(fixture: &Fixture) -> (Oid, RelFileNode) {
        let relation = fixture.catalog.create_relation(
            fixture.db,
            2200,
            10,
            1663,
            StorageKind::Heap,
            None,
            None,
        );
        let row = fixture.catalog.relation(relation).unwrap();
        (relation, RelFileNode::new(row.db, row.tablespace, row.relfilenode))
    }

    #[test]
    fn size_walks_forks_and_extension_segments() {
        let fixture = fixture(NodeRole::Segment);
        let (_, node) = heap(&fixture);

        let base = fixture.node.storage_path(&node, None);
        make_file(&base, 8192);
        make_file(&append_to_path(&base, ".1"), 4096);
        make_file(&append_to_path(&base, "_fsm"), 512);

        assert_eq!(fixture.node.relation_size_local(node, None), 12800);
    }

    #[test]
    fn size_of_missing_files_is_zero() {
        let fixture = fixture(NodeRole::Segment);
        let (_, node) = heap(&fixture);
        assert_eq!(fixture.node.relation_size_local(node, None), 0);
    }

    #[test]
    fn temp_relations_use_backend_prefix() {
        let fixture = fixture(NodeRole::Segment);
        let (_, node) = heap(&fixture);
        make_file(&fixture.node.storage_path(&node, Some(7)), 1024);

        assert_eq!(fixture.node.relation_size_local(node, Some(7)), 1024);
        // The persistent path sees nothing.
        assert_eq!(fixture.node.relation_size_local(node, None), 0);
    }

    #[test]
    fn active_oid_fetch_requeues_unresolved_entries() {
        let fixture = fixture(NodeRole::Segment);
        let (relation, node) = heap(&fixture);
        fixture.node.shmem().active_tables.insert(node, ());

        // An entry no catalog row can explain yet (uncommitted create).
        let phantom = RelFileNode::new(fixture.db, 1663, 999_999);
        fixture.node.shmem().active_tables.insert(phantom, ());

        let stats = fixture
            .node
            .fetch_table_stat(fixture.db, FetchMode::ActiveOids, &[], SchemaVersion::V2)
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].relation, relation);

        // The resolved entry is gone, the phantom is back for next epoch.
        assert_eq!(fixture.node.shmem().active_tables.len(), 1);
        assert!(fixture.node.shmem().active_tables.contains(&phantom));
    }

    #[test]
    fn size_fetch_yields_zero_for_dropped_relations() {
        let fixture = fixture(NodeRole::Segment);
        let (relation, node) = heap(&fixture);
        make_file(&fixture.node.storage_path(&node, None), 2048);
        let dropped = relation + 1000;

        let stats = fixture
            .node
            .fetch_table_stat(
                fixture.db,
                FetchMode::ActiveSizes,
                &[relation, dropped],
                SchemaVersion::V2,
            )
            .unwrap();
        let by_oid: std::collections::HashMap<Oid, i64> =
            stats.iter().map(|s| (s.relation, s.size)).collect();
        assert_eq!(by_oid[&relation], 2048);
        assert_eq!(by_oid[&dropped], 0);
    }

    #[test]
    fn coordinator_answers_no_stat_rows() {
        let fixture = fixture(NodeRole::Coordinator);
        let (_, node) = heap(&fixture);
        fixture.node.shmem().active_tables.insert(node, ());

        let stats = fixture
            .node
            .fetch_table_stat(fixture.db, FetchMode::ActiveOids, &[], SchemaVersion::V2)
            .unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn v1_rows_carry_the_implicit_total_seg_id() {
        let fixture = fixture(NodeRole::Segment);
        let (relation, node) = heap(&fixture);
        make_file(&fixture.node.storage_path(&node, None), 4096);

        let stats = fixture
            .node
            .fetch_table_stat(
                fixture.db,
                FetchMode::ActiveSizes,
                &[relation],
                SchemaVersion::V1,
            )
            .unwrap();
        assert_eq!(stats[0].seg_id, SEG_ID_TOTAL);
    }
}
