//! Node-shared relation metadata cache.
//!
//! One logical table owns many physical storage units (toast tables,
//! indexes, append-optimized segment and block-directory files). The cache
//! records each relation's attributes plus the primary/auxiliary linkage so
//! that storage-level observations can be rolled up to the primary relation
//! that quotas are accounted against.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use segquota_common::Oid;

use crate::host::Catalog;
use crate::types::{RelFileNode, StorageKind};

/// How far an auxiliary chain is followed before giving up; real chains are
/// two hops at most (aux index -> toast table -> heap).
const MAX_PARENT_HOPS: usize = 8;

#[derive(Clone, Debug)]
pub struct RelationCacheEntry {
    pub relation: Oid,
    /// The user-visible relation this storage belongs to; `relation` itself
    /// when primary.
    pub primary: Oid,
    pub owner: Oid,
    pub namespace: Oid,
    pub tablespace: Oid,
    pub db: Oid,
    pub relfilenode: Oid,
    pub backend: Option<i32>,
    pub storage_kind: StorageKind,
    pub auxiliaries: HashSet<Oid>,
    last_used: u64,
}

impl RelationCacheEntry {
    pub fn is_primary(&self) -> bool {
        self.primary == self.relation
    }

    pub fn relfilenode_key(&self) -> RelFileNode {
        RelFileNode::new(self.db, self.tablespace, self.relfilenode)
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    by_relation: HashMap<Oid, RelationCacheEntry>,
    by_node: HashMap<RelFileNode, Oid>,
    tick: u64,
}

impl CacheInner {
    fn unlink_from_parent(&mut self, relation: Oid) {
        let parent = match self.by_relation.get(&relation) {
            Some(entry) if !entry.is_primary() => entry.primary,
            _ => return,
        };
        if let Some(parent_entry) = self.by_relation.get_mut(&parent) {
            parent_entry.auxiliaries.remove(&relation);
        }
    }

    fn remove(&mut self, relation: Oid) -> Option<RelationCacheEntry> {
        self.unlink_from_parent(relation);
        let entry = self.by_relation.remove(&relation)?;
        self.by_node.remove(&entry.relfilenode_key());
        Some(entry)
    }
}

#[derive(Debug)]
pub struct RelationCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

impl RelationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read_inner().by_relation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_inner().by_relation.is_empty()
    }

    /// Refresh the cached attributes of `relation` from the catalog,
    /// following the auxiliary chain so the primary's membership set stays
    /// consistent. A relation the catalog no longer knows is ignored.
    pub fn update(&self, catalog: &dyn Catalog, relation: Oid) {
        let Some(primary) = resolve_primary(catalog, relation) else {
            return;
        };

        let mut chain = Vec::new();
        let mut cursor = Some(relation);
        for _ in 0..MAX_PARENT_HOPS {
            let Some(oid) = cursor else { break };
            let Some(row) = catalog.relation(oid) else { break };
            cursor = row.parent;
            chain.push(row);
        }

        let mut inner = self.write_inner();
        inner.tick += 1;
        let tick = inner.tick;
        // Root first, so each auxiliary finds its primary already present.
        for row in chain.into_iter().rev() {
            let oid = row.relation;
            let node = RelFileNode::new(row.db, row.tablespace, row.relfilenode);
            let row_primary = if row.parent.is_some() { primary } else { oid };

            let auxiliaries = inner
                .by_relation
                .get(&oid)
                .map(|e| e.auxiliaries.clone())
                .unwrap_or_default();
            let entry = RelationCacheEntry {
                relation: oid,
                primary: row_primary,
                owner: row.owner,
                namespace: row.namespace,
                tablespace: row.tablespace,
                db: row.db,
                relfilenode: row.relfilenode,
                backend: row.backend,
                storage_kind: row.storage_kind,
                auxiliaries,
                last_used: tick,
            };

            if !inner.by_relation.contains_key(&oid)
                && inner.by_relation.len() >= self.capacity
                && !evict_one(&mut inner)
            {
                warn!(
                    "relation cache full ({} entries), not caching relation {}",
                    self.capacity, oid
                );
                continue;
            }
            // Relfilenode may have moved (vacuum full, truncate).
            let stale_key = inner.by_relation.get(&oid).map(|e| e.relfilenode_key());
            if let Some(stale_key) = stale_key {
                if stale_key != node {
                    inner.by_node.remove(&stale_key);
                }
            }
            inner.by_relation.insert(oid, entry);
            inner.by_node.insert(node, oid);

            if oid != primary {
                match inner.by_relation.get_mut(&primary) {
                    Some(parent) => {
                        parent.auxiliaries.insert(oid);
                    }
                    // An auxiliary whose primary could not be cached would
                    // break the containment invariant; leave it out.
                    None => {
                        inner.remove(oid);
                    }
                }
            }
        }
    }

    pub fn get(&self, relation: Oid) -> Option<RelationCacheEntry> {
        self.read_inner().by_relation.get(&relation).cloned()
    }

    /// O(1) primary lookup; answers `relation` itself when uncached.
    pub fn lookup_primary(&self, relation: Oid) -> Oid {
        self.read_inner()
            .by_relation
            .get(&relation)
            .map(|e| e.primary)
            .unwrap_or(relation)
    }

    /// Resolve a storage-file id back to its relation, if a committed entry
    /// is cached. Callers requeue on `None`.
    pub fn lookup_by_relfilenode(&self, node: &RelFileNode) -> Option<Oid> {
        self.read_inner().by_node.get(node).copied()
    }

    pub fn evict(&self, relation: Oid) {
        self.write_inner().remove(relation);
    }

    /// Drop whatever entry owns these storage files (unlink probe path).
    pub fn evict_by_relfilenode(&self, node: &RelFileNode) {
        let mut inner = self.write_inner();
        if let Some(relation) = inner.by_node.get(node).copied() {
            inner.remove(relation);
        }
    }

    /// Epoch-start sweep: drop entries whose backing catalog row no longer
    /// exists (dropped tables, aborted creates).
    pub fn sweep_committed(&self, catalog: &dyn Catalog) {
        let stale: Vec<Oid> = {
            let inner = self.read_inner();
            inner
                .by_relation
                .keys()
                .copied()
                .filter(|oid| !catalog.relation_exists(*oid))
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut inner = self.write_inner();
        for oid in stale {
            inner.remove(oid);
        }
    }

    /// Validates the auxiliary containment invariant: every non-primary
    /// entry's primary is cached and lists it as an auxiliary.
    pub fn check_consistency(&self) -> bool {
        let inner = self.read_inner();
        inner.by_relation.values().all(|entry| {
            entry.is_primary()
                || inner
                    .by_relation
                    .get(&entry.primary)
                    .map(|p| p.auxiliaries.contains(&entry.relation))
                    .unwrap_or(false)
        })
    }
}

/// Walk the auxiliary chain up to the user-visible relation.
fn resolve_primary(catalog: &dyn Catalog, relation: Oid) -> Option<Oid> {
    let mut current = relation;
    for _ in 0..MAX_PARENT_HOPS {
        let row = catalog.relation(current)?;
        match row.parent {
            Some(parent) => current = parent,
            None => return Some(current),
        }
    }
    Some(current)
}

/// Evict the least-recently-used clean entry. Primaries with live
/// auxiliaries are pinned so the containment invariant survives eviction.
fn evict_one(inner: &mut CacheInner) -> bool {
    let victim = inner
        .by_relation
        .values()
        .filter(|e| e.auxiliaries.is_empty())
        .min_by_key(|e| e.last_used)
        .map(|e| e.relation);
    match victim {
        Some(relation) => {
            inner.remove(relation);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockCatalog;
    use crate::types::StorageKind;

    fn table(catalog: &MockCatalog, db: Oid, parent: Option<Oid>) -> Oid {
        catalog.create_relation(db, 2200, 10, 1663, StorageKind::Heap, parent, None)
    }

    #[test]
    fn auxiliary_chain_resolves_to_root_primary() {
        let catalog = MockCatalog::new();
        let cache = RelationCache::new(16);
        let db = catalog.define_database("db");

        let heap = table(&catalog, db, None);
        let toast = table(&catalog, db, Some(heap));
        let toast_index = table(&catalog, db, Some(toast));

        cache.update(&catalog, toast_index);
        assert_eq!(cache.lookup_primary(toast_index), heap);
        assert_eq!(cache.lookup_primary(toast), heap);
        assert_eq!(cache.lookup_primary(heap), heap);
        assert!(cache.check_consistency());

        let entry = cache.get(heap).unwrap();
        assert!(entry.auxiliaries.contains(&toast));
        assert!(entry.auxiliaries.contains(&toast_index));
    }

    #[test]
    fn lookup_by_relfilenode_roundtrips() {
        let catalog = MockCatalog::new();
        let cache = RelationCache::new(16);
        let db = catalog.define_database("db");
        let heap = table(&catalog, db, None);

        cache.update(&catalog, heap);
        let row = catalog.relation(heap).unwrap();
        let node = RelFileNode::new(row.db, row.tablespace, row.relfilenode);
        assert_eq!(cache.lookup_by_relfilenode(&node), Some(heap));

        cache.evict_by_relfilenode(&node);
        assert_eq!(cache.lookup_by_relfilenode(&node), None);
        assert!(cache.get(heap).is_none());
    }

    #[test]
    fn sweep_drops_entries_without_catalog_rows() {
        let catalog = MockCatalog::new();
        let cache = RelationCache::new(16);
        let db = catalog.define_database("db");
        let keep = table(&catalog, db, None);
        let gone = table(&catalog, db, None);

        cache.update(&catalog, keep);
        cache.update(&catalog, gone);
        catalog.drop_relation(gone);

        cache.sweep_committed(&catalog);
        assert!(cache.get(keep).is_some());
        assert!(cache.get(gone).is_none());
        assert!(cache.check_consistency());
    }

    #[test]
    fn eviction_spares_primaries_with_auxiliaries() {
        let catalog = MockCatalog::new();
        let cache = RelationCache::new(2);
        let db = catalog.define_database("db");

        let heap = table(&catalog, db, None);
        let toast = table(&catalog, db, Some(heap));
        cache.update(&catalog, toast);
        assert_eq!(cache.len(), 2);

        // The cache is full; inserting another relation must evict the
        // toast entry (clean) rather than its pinned parent.
        let other = table(&catalog, db, None);
        cache.update(&catalog, other);
        assert!(cache.get(other).is_some());
        assert!(cache.check_consistency());
    }
}
