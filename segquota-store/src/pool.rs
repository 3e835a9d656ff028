use std::{fmt, sync::Arc, time::Duration};

use diesel::{
    connection::SimpleConnection,
    prelude::*,
    r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection},
    sqlite::SqliteConnection,
};
use diesel_migrations::MigrationHarness;
use segquota_common::{BlockingThreadpool, Metrics, Oid, QuotaType};
use segquota_settings::Settings;

use crate::{
    error::DbError,
    models::{InstallState, MonitoredDatabaseRow, QuotaConfigRow, TableSizeRow, TargetRow},
    schema::{monitored_database, quota_config, state, table_size, target},
    DbResult, MIGRATIONS,
};

/// Sqlite bind-parameter budget; 3 columns per row leaves plenty of slack
/// under the historical 999-variable limit.
const UPSERT_CHUNK_SIZE: usize = 300;

/// Run the diesel embedded migrations on a throwaway connection.
///
/// Sqlite DDL statements implicitly commit which could disrupt the pool's
/// begin_test_transaction during tests, so this runs on its own conn.
fn run_embedded_migrations(database_url: &str) -> DbResult<()> {
    let mut conn = SqliteConnection::establish(database_url)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::internal(format!("Couldn't run migrations: {}", e)))?;
    if !applied.is_empty() {
        debug!("applied {} store migrations", applied.len());
    }
    Ok(())
}

#[derive(Debug)]
struct StoreConnectionCustomizer {
    /// In-memory databases are per-connection, so each one must be migrated
    /// as it is handed out.
    migrate_on_acquire: bool,
    #[cfg(debug_assertions)]
    use_test_transactions: bool,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for StoreConnectionCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON;")
            .map_err(diesel::r2d2::Error::QueryError)?;
        if self.migrate_on_acquire {
            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| {
                    diesel::r2d2::Error::QueryError(diesel::result::Error::QueryBuilderError(e))
                })?;
        }
        #[cfg(debug_assertions)]
        if self.use_test_transactions {
            conn.begin_test_transaction()
                .map_err(diesel::r2d2::Error::QueryError)?;
        }
        Ok(())
    }
}

/// Pool of connections to the persisted metadata store.
#[derive(Clone)]
pub struct StorePool {
    pool: Pool<ConnectionManager<SqliteConnection>>,
    metrics: Metrics,
    /// Thread pool for running synchronous diesel calls.
    blocking_threadpool: Arc<BlockingThreadpool>,
}

impl StorePool {
    /// Creates a new pool of store connections, ensuring all migrations ran.
    pub fn new(
        settings: &Settings,
        metrics: &Metrics,
        blocking_threadpool: Arc<BlockingThreadpool>,
    ) -> DbResult<Self> {
        let in_memory = settings.database_url == ":memory:";
        if !in_memory {
            run_embedded_migrations(&settings.database_url)?;
        }

        let manager = ConnectionManager::<SqliteConnection>::new(settings.database_url.clone());
        let customizer = StoreConnectionCustomizer {
            migrate_on_acquire: in_memory,
            #[cfg(debug_assertions)]
            use_test_transactions: settings.database_use_test_transactions,
        };
        let max_size = if in_memory {
            1
        } else {
            settings.database_pool_max_size
        };
        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(Duration::from_secs(
                settings.database_pool_connection_timeout.unwrap_or(30) as u64,
            ))
            .connection_customizer(Box::new(customizer))
            .build(manager)?;

        Ok(Self {
            pool,
            metrics: metrics.clone(),
            blocking_threadpool,
        })
    }

    pub fn get_sync(&self) -> DbResult<StoreConn> {
        Ok(StoreConn {
            conn: self.pool.get()?,
            metrics: self.metrics.clone(),
        })
    }

    pub fn state(&self) -> PoolState {
        self.pool.state().into()
    }

    async fn spawn<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut StoreConn) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        self.blocking_threadpool
            .spawn(move || {
                let mut conn = pool.get_sync()?;
                f(&mut conn)
            })
            .await
    }

    pub async fn set_quota_limit(
        &self,
        target_oid: Oid,
        quota_type: QuotaType,
        limit_mb: i64,
    ) -> DbResult<()> {
        self.spawn(move |conn| conn.set_quota_limit_sync(target_oid, quota_type, limit_mb))
            .await
    }

    /// Returns the number of config rows the ratio applied to (zero when no
    /// quota is configured for the target).
    pub async fn set_seg_ratio(
        &self,
        target_oid: Oid,
        quota_type: QuotaType,
        ratio: f32,
    ) -> DbResult<usize> {
        self.spawn(move |conn| conn.set_seg_ratio_sync(target_oid, quota_type, ratio))
            .await
    }

    pub async fn fetch_quota_configs(&self) -> DbResult<Vec<QuotaConfigRow>> {
        self.spawn(|conn| conn.fetch_quota_configs_sync()).await
    }

    pub async fn set_target(
        &self,
        quota_type: QuotaType,
        primary_oid: Oid,
        tablespace_oid: Oid,
    ) -> DbResult<()> {
        self.spawn(move |conn| conn.set_target_sync(quota_type, primary_oid, tablespace_oid))
            .await
    }

    pub async fn delete_target(
        &self,
        quota_type: QuotaType,
        primary_oid: Oid,
        tablespace_oid: Oid,
    ) -> DbResult<()> {
        self.spawn(move |conn| conn.delete_target_sync(quota_type, primary_oid, tablespace_oid))
            .await
    }

    /// Drop every registered tablespace pair of one primary target; used
    /// when a tablespace-qualified quota is re-pointed or removed.
    pub async fn clear_targets(&self, quota_type: QuotaType, primary_oid: Oid) -> DbResult<()> {
        self.spawn(move |conn| conn.clear_targets_sync(quota_type, primary_oid))
            .await
    }

    pub async fn fetch_targets(&self) -> DbResult<Vec<TargetRow>> {
        self.spawn(|conn| conn.fetch_targets_sync()).await
    }

    pub async fn load_table_sizes(&self) -> DbResult<Vec<TableSizeRow>> {
        self.spawn(|conn| conn.load_table_sizes_sync()).await
    }

    pub async fn upsert_table_sizes(&self, rows: Vec<TableSizeRow>) -> DbResult<()> {
        self.spawn(move |conn| conn.upsert_table_sizes_sync(&rows))
            .await
    }

    pub async fn delete_table_sizes(&self, table_ids: Vec<i64>) -> DbResult<()> {
        self.spawn(move |conn| conn.delete_table_sizes_sync(&table_ids))
            .await
    }

    /// Atomically replaces the whole `table_size` table, used by the
    /// post-install bulk recompute.
    pub async fn replace_all_table_sizes(&self, rows: Vec<TableSizeRow>) -> DbResult<()> {
        self.spawn(move |conn| conn.replace_all_table_sizes_sync(&rows))
            .await
    }

    pub async fn get_state(&self) -> DbResult<InstallState> {
        self.spawn(|conn| conn.get_state_sync()).await
    }

    pub async fn set_state(&self, install_state: InstallState) -> DbResult<()> {
        self.spawn(move |conn| conn.set_state_sync(install_state))
            .await
    }

    pub async fn add_monitored_database(&self, db_oid: Oid) -> DbResult<()> {
        self.spawn(move |conn| conn.add_monitored_database_sync(db_oid))
            .await
    }

    pub async fn remove_monitored_database(&self, db_oid: Oid) -> DbResult<()> {
        self.spawn(move |conn| conn.remove_monitored_database_sync(db_oid))
            .await
    }

    pub async fn list_monitored_databases(&self) -> DbResult<Vec<Oid>> {
        self.spawn(|conn| conn.list_monitored_databases_sync())
            .await
    }
}

impl fmt::Debug for StorePool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StorePool")
            .field("state", &self.pool.state())
            .finish()
    }
}

/// A mockable r2d2::State
#[derive(Debug, Default)]
pub struct PoolState {
    pub connections: u32,
    pub idle_connections: u32,
}

impl From<diesel::r2d2::State> for PoolState {
    fn from(state: diesel::r2d2::State) -> PoolState {
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

pub struct StoreConn {
    pub(crate) conn: PooledConnection<ConnectionManager<SqliteConnection>>,
    metrics: Metrics,
}

impl StoreConn {
    pub fn set_quota_limit_sync(
        &mut self,
        target_oid: Oid,
        quota_type: QuotaType,
        limit_mb: i64,
    ) -> DbResult<()> {
        if limit_mb < 0 {
            diesel::delete(
                quota_config::table
                    .filter(quota_config::target_oid.eq(target_oid as i64))
                    .filter(quota_config::quota_type.eq(quota_type.code())),
            )
            .execute(&mut *self.conn)?;
            return Ok(());
        }

        // Upsert the limit, preserving any per-segment ratio already set.
        diesel::insert_into(quota_config::table)
            .values(QuotaConfigRow {
                target_oid: target_oid as i64,
                quota_type: quota_type.code(),
                quota_limit_mb: limit_mb,
                seg_ratio: -1.0,
            })
            .on_conflict((quota_config::target_oid, quota_config::quota_type))
            .do_update()
            .set(quota_config::quota_limit_mb.eq(limit_mb))
            .execute(&mut *self.conn)?;
        Ok(())
    }

    pub fn set_seg_ratio_sync(
        &mut self,
        target_oid: Oid,
        quota_type: QuotaType,
        ratio: f32,
    ) -> DbResult<usize> {
        let affected = diesel::update(
            quota_config::table
                .filter(quota_config::target_oid.eq(target_oid as i64))
                .filter(quota_config::quota_type.eq(quota_type.code())),
        )
        .set(quota_config::seg_ratio.eq(ratio))
        .execute(&mut *self.conn)?;
        Ok(affected)
    }

    pub fn fetch_quota_configs_sync(&mut self) -> DbResult<Vec<QuotaConfigRow>> {
        Ok(quota_config::table.load(&mut *self.conn)?)
    }

    pub fn set_target_sync(
        &mut self,
        quota_type: QuotaType,
        primary_oid: Oid,
        tablespace_oid: Oid,
    ) -> DbResult<()> {
        diesel::replace_into(target::table)
            .values(TargetRow {
                quota_type: quota_type.code(),
                primary_oid: primary_oid as i64,
                tablespace_oid: tablespace_oid as i64,
            })
            .execute(&mut *self.conn)?;
        Ok(())
    }

    pub fn delete_target_sync(
        &mut self,
        quota_type: QuotaType,
        primary_oid: Oid,
        tablespace_oid: Oid,
    ) -> DbResult<()> {
        diesel::delete(
            target::table
                .filter(target::quota_type.eq(quota_type.code()))
                .filter(target::primary_oid.eq(primary_oid as i64))
                .filter(target::tablespace_oid.eq(tablespace_oid as i64)),
        )
        .execute(&mut *self.conn)?;
        Ok(())
    }

    pub fn clear_targets_sync(&mut self, quota_type: QuotaType, primary_oid: Oid) -> DbResult<()> {
        diesel::delete(
            target::table
                .filter(target::quota_type.eq(quota_type.code()))
                .filter(target::primary_oid.eq(primary_oid as i64)),
        )
        .execute(&mut *self.conn)?;
        Ok(())
    }

    pub fn fetch_targets_sync(&mut self) -> DbResult<Vec<TargetRow>> {
        Ok(target::table.load(&mut *self.conn)?)
    }

    pub fn load_table_sizes_sync(&mut self) -> DbResult<Vec<TableSizeRow>> {
        self.metrics.incr("storage.table_size.load");
        Ok(table_size::table.load(&mut *self.conn)?)
    }

    pub fn upsert_table_sizes_sync(&mut self, rows: &[TableSizeRow]) -> DbResult<()> {
        self.metrics
            .count("storage.table_size.upsert", rows.len() as i64);
        for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
            diesel::replace_into(table_size::table)
                .values(chunk.to_vec())
                .execute(&mut *self.conn)?;
        }
        Ok(())
    }

    pub fn delete_table_sizes_sync(&mut self, table_ids: &[i64]) -> DbResult<()> {
        for chunk in table_ids.chunks(UPSERT_CHUNK_SIZE) {
            diesel::delete(table_size::table.filter(table_size::table_id.eq_any(chunk.to_vec())))
                .execute(&mut *self.conn)?;
        }
        Ok(())
    }

    pub fn replace_all_table_sizes_sync(&mut self, rows: &[TableSizeRow]) -> DbResult<()> {
        self.conn.transaction(|conn| {
            diesel::delete(table_size::table).execute(conn)?;
            for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
                diesel::insert_into(table_size::table)
                    .values(chunk.to_vec())
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn get_state_sync(&mut self) -> DbResult<InstallState> {
        let code = state::table
            .select(state::state_value)
            .first::<i32>(&mut *self.conn)
            .optional()?;
        match code {
            None => Ok(InstallState::Unknown),
            Some(code) => InstallState::from_code(code).ok_or_else(|| DbError::bad_state(code)),
        }
    }

    pub fn set_state_sync(&mut self, install_state: InstallState) -> DbResult<()> {
        self.conn.transaction(|conn| {
            diesel::delete(state::table).execute(conn)?;
            diesel::insert_into(state::table)
                .values(state::state_value.eq(install_state.code()))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn add_monitored_database_sync(&mut self, db_oid: Oid) -> DbResult<()> {
        diesel::insert_or_ignore_into(monitored_database::table)
            .values(MonitoredDatabaseRow {
                db_oid: db_oid as i64,
            })
            .execute(&mut *self.conn)?;
        Ok(())
    }

    pub fn remove_monitored_database_sync(&mut self, db_oid: Oid) -> DbResult<()> {
        diesel::delete(monitored_database::table.filter(monitored_database::db_oid.eq(db_oid as i64)))
            .execute(&mut *self.conn)?;
        Ok(())
    }

    pub fn list_monitored_databases_sync(&mut self) -> DbResult<Vec<Oid>> {
        let oids: Vec<i64> = monitored_database::table
            .select(monitored_database::db_oid)
            .order(monitored_database::db_oid.asc())
            .load(&mut *self.conn)?;
        Ok(oids.into_iter().map(|oid| oid as Oid).collect())
    }
}

impl fmt::Debug for StoreConn {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("StoreConn").finish()
    }
}
