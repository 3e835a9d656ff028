use segquota_common::{Oid, QuotaType, SegId};

use crate::schema::{monitored_database, quota_config, table_size, target};

/// One configured quota: a limit (and optional per-segment ratio) on a
/// schema, role, or tablespace-qualified variant of either.
#[derive(Clone, Debug, Insertable, PartialEq, Queryable)]
#[diesel(table_name = quota_config)]
pub struct QuotaConfigRow {
    pub target_oid: i64,
    pub quota_type: i16,
    pub quota_limit_mb: i64,
    pub seg_ratio: f32,
}

impl QuotaConfigRow {
    pub fn quota_type(&self) -> Option<QuotaType> {
        QuotaType::from_code(self.quota_type)
    }
}

/// A tablespace-qualified quota target, tying a schema or role to one
/// tablespace so the pair can carry its own limit.
#[derive(Clone, Debug, Insertable, PartialEq, Queryable)]
#[diesel(table_name = target)]
pub struct TargetRow {
    pub quota_type: i16,
    pub primary_oid: i64,
    pub tablespace_oid: i64,
}

/// Persisted size of one relation on one shard. `seg_id == -1` is the
/// cluster-wide total.
#[derive(Clone, Debug, Insertable, PartialEq, Queryable)]
#[diesel(table_name = table_size)]
pub struct TableSizeRow {
    pub table_id: i64,
    pub seg_id: i16,
    pub size: i64,
}

impl TableSizeRow {
    pub fn new(table_id: Oid, seg_id: SegId, size: i64) -> Self {
        Self {
            table_id: table_id as i64,
            seg_id,
            size,
        }
    }
}

#[derive(Clone, Debug, Insertable, Queryable)]
#[diesel(table_name = monitored_database)]
pub struct MonitoredDatabaseRow {
    pub db_oid: i64,
}

/// Install state of the persisted schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstallState {
    Ready,
    Unknown,
}

impl InstallState {
    pub fn code(self) -> i32 {
        match self {
            InstallState::Ready => 0,
            InstallState::Unknown => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(InstallState::Ready),
            1 => Some(InstallState::Unknown),
            _ => None,
        }
    }
}
