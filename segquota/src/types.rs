//! Core identifiers and wire shapes shared across the engine.

use std::fmt;

use segquota_common::{Oid, SegId};

/// At most this many databases can be monitored at once; bounds the worker
/// count and the shared monitored-db set.
pub const MAX_MONITORED_DATABASES: usize = 10;

/// The on-disk file identifier of one relation shard. Relfilenode numbers
/// can repeat across tablespaces, so the full triple is the key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RelFileNode {
    pub db: Oid,
    pub tablespace: Oid,
    pub relfilenode: Oid,
}

impl RelFileNode {
    pub fn new(db: Oid, tablespace: Oid, relfilenode: Oid) -> Self {
        Self {
            db,
            tablespace,
            relfilenode,
        }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.db, self.tablespace, self.relfilenode)
    }
}

/// How a relation stores its bytes on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageKind {
    Heap,
    AppendOptimized,
    External,
    /// Catalog-only objects (views, composite types) that own no storage.
    Virtual,
}

/// Why a relation is on the blocklist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockReason {
    LimitExceeded,
    NoFreeSpaceOnTablespace,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockReason::LimitExceeded => "limit exceeded",
            BlockReason::NoFreeSpaceOnTablespace => "no free space on tablespace",
        };
        f.write_str(name)
    }
}

/// One row of a segment's `fetch_table_stat` answer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableStat {
    pub relation: Oid,
    pub size: i64,
    pub seg_id: SegId,
}

/// What a `fetch_table_stat` call should do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchMode {
    /// Drain the segment's active-file map and resolve it to relation oids.
    ActiveOids,
    /// Compute the current on-disk size of each given relation.
    ActiveSizes,
}

/// Shape of the persisted size data and of `fetch_table_stat` results.
///
/// V1 persisted one row per relation and answered two-column stat rows with
/// an implicit cluster-total seg id; V2 keeps one row per (relation, seg).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    /// Whether stat rows carry an explicit seg id column.
    pub fn has_seg_id(self) -> bool {
        matches!(self, SchemaVersion::V2)
    }
}
