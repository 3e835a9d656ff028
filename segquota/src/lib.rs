//! Disk-space quota enforcement for segmented, shared-nothing database
//! clusters.
//!
//! The engine runs on the coordinator: storage-event probes capture which
//! storage files changed, a per-database worker pulls current shard sizes
//! from every segment each epoch, a quota evaluator rolls them up into
//! per-target totals, and write attempts anywhere in the cluster consult
//! the resulting blocklist through [`blocklist::EnforcementGate`].
#[macro_use]
extern crate slog_scope;

pub mod admin;
pub mod blocklist;
pub mod error;
pub mod evaluator;
pub mod host;
pub mod logging;
pub mod model;
pub mod probe;
pub mod quota;
pub mod relcache;
pub mod segment;
pub mod shmem;
pub mod types;
pub mod worker;

pub use admin::QuotaAdmin;
pub use blocklist::{Blocklist, BlocklistEntry, EnforcementGate};
pub use error::{QuotaError, QuotaResult};
pub use host::{Catalog, ClusterContext, NodeRole, SegmentClient};
pub use types::{BlockReason, FetchMode, RelFileNode, SchemaVersion, StorageKind, TableStat};
pub use worker::Launcher;
