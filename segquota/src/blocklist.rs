//! The blocklist and the write-path enforcement gate.

use std::collections::HashMap;
use std::sync::Arc;

use segquota_common::{Metrics, Oid, QuotaType};

use crate::error::{QuotaError, QuotaResult};
use crate::host::CoordinatorShmem;
use crate::shmem::ShmemMap;
use crate::types::BlockReason;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlocklistEntry {
    pub target_oid: Oid,
    pub quota_type: QuotaType,
    pub limit_mb: i64,
    pub reason: BlockReason,
}

/// Shared map of relations whose writes must be refused, keyed by
/// (database, relation). The per-database worker is the sole writer for its
/// database; the gate reads point entries.
#[derive(Debug)]
pub struct Blocklist {
    map: ShmemMap<(Oid, Oid), BlocklistEntry>,
}

impl Blocklist {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: ShmemMap::new("blocklist", capacity),
        }
    }

    pub fn lookup(&self, db: Oid, relation: Oid) -> Option<BlocklistEntry> {
        self.map.get_cloned(&(db, relation))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Swap one database's entries for the desired set, in a single
    /// writer-lock hold so readers never observe a half-applied diff.
    pub fn replace_db(&self, db: Oid, desired: HashMap<Oid, BlocklistEntry>) {
        self.map.with_write(|slots, capacity| {
            slots.retain(|(entry_db, _), _| *entry_db != db);
            for (relation, entry) in desired {
                if slots.len() >= capacity {
                    warn!("blocklist full ({} slots), dropping entry", capacity);
                    break;
                }
                slots.insert((db, relation), entry);
            }
        });
    }

    pub fn clear_db(&self, db: Oid) {
        self.map.retain(|(entry_db, _), _| *entry_db != db);
    }

    pub fn relations_for_db(&self, db: Oid) -> Vec<Oid> {
        self.map
            .keys()
            .into_iter()
            .filter(|(entry_db, _)| *entry_db == db)
            .map(|(_, relation)| relation)
            .collect()
    }
}

/// Consulted by the host on every relation-open-for-write.
#[derive(Clone)]
pub struct EnforcementGate {
    coordinator: Arc<CoordinatorShmem>,
    metrics: Metrics,
}

impl EnforcementGate {
    pub fn new(coordinator: Arc<CoordinatorShmem>, metrics: Metrics) -> Self {
        Self {
            coordinator,
            metrics,
        }
    }

    /// Decide whether a write to `relation` may proceed. O(1): a paused
    /// check, a primary lookup and a point read of the blocklist.
    ///
    /// Internal trouble never surfaces here; the gate fails open so a
    /// broken quota model cannot take writes down with it.
    pub fn check_relation_write(&self, db: Oid, relation: Oid) -> QuotaResult<()> {
        if self.coordinator.paused.is_paused(db) {
            return Ok(());
        }

        // Writes to auxiliary storage count against the primary relation.
        let primary = self.coordinator.node.relation_cache.lookup_primary(relation);
        let entry = self
            .coordinator
            .blocklist
            .lookup(db, relation)
            .or_else(|| self.coordinator.blocklist.lookup(db, primary));

        match entry {
            None => Ok(()),
            Some(entry) => {
                self.metrics
                    .incr_quota_type("quota.at_limit", entry.quota_type);
                Err(QuotaError::violation(
                    entry.target_oid,
                    entry.quota_type,
                    entry.limit_mb,
                    entry.reason,
                ))
            }
        }
    }
}
