//! Persisted metadata store: quota configuration, tablespace-qualified
//! targets, per-shard table sizes, install state and the monitored-database
//! list the launcher replays on cold start.
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate slog_scope;

mod error;
mod models;
mod pool;
mod schema;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub use error::DbError;
pub use models::{InstallState, MonitoredDatabaseRow, QuotaConfigRow, TableSizeRow, TargetRow};
pub use pool::{PoolState, StoreConn, StorePool};

pub(crate) type DbResult<T> = Result<T, DbError>;

pub(crate) const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
