//! The management surface: quota configuration calls, pause/resume,
//! lifecycle commands and the diagnostic usage views.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use segquota_common::{Metrics, Oid, QuotaType, SEG_ID_TOTAL};
use segquota_settings::Settings;
use segquota_store::{InstallState, StorePool, TableSizeRow};

use crate::error::{QuotaError, QuotaResult};
use crate::host::ClusterContext;
use crate::quota::parse_size_mb;
use crate::types::{
    FetchMode, RelFileNode, SchemaVersion, MAX_MONITORED_DATABASES,
};
use crate::worker::{DdlCommand, DdlResult};

/// One row of the diagnostic quota views.
#[derive(Clone, Debug, PartialEq)]
pub struct QuotaUsageRow {
    pub target_name: String,
    pub tablespace_name: Option<String>,
    pub quota_in_mb: i64,
    pub used_bytes: i64,
}

/// Point-in-time answer of `status`.
#[derive(Clone, Copy, Debug)]
pub struct DatabaseStatus {
    pub monitored: bool,
    pub paused: bool,
    pub epoch: u64,
    pub version: SchemaVersion,
}

/// Handle the host's management functions call into. Validation happens
/// here; rejected calls never touch persisted state.
#[derive(Clone)]
pub struct QuotaAdmin {
    ctx: ClusterContext,
    store: StorePool,
    settings: Settings,
    metrics: Metrics,
    version: SchemaVersion,
}

impl QuotaAdmin {
    pub fn new(
        ctx: ClusterContext,
        store: StorePool,
        settings: Settings,
        metrics: Metrics,
        version: SchemaVersion,
    ) -> Self {
        Self {
            ctx,
            store,
            settings,
            metrics,
            version,
        }
    }

    pub fn cluster(&self) -> &ClusterContext {
        &self.ctx
    }

    fn namespace_oid(&self, schema: &str) -> QuotaResult<Oid> {
        self.ctx
            .catalog
            .namespace_oid(schema)
            .ok_or_else(|| QuotaError::config(format!("schema {:?} does not exist", schema)))
    }

    fn role_oid(&self, role: &str) -> QuotaResult<Oid> {
        self.ctx
            .catalog
            .role_oid(role)
            .ok_or_else(|| QuotaError::config(format!("role {:?} does not exist", role)))
    }

    fn tablespace_oid(&self, tablespace: &str) -> QuotaResult<Oid> {
        self.ctx.catalog.tablespace_oid(tablespace).ok_or_else(|| {
            QuotaError::config(format!("tablespace {:?} does not exist", tablespace))
        })
    }

    pub async fn set_schema_quota(&self, schema: &str, size: &str) -> QuotaResult<()> {
        let namespace = self.namespace_oid(schema)?;
        let limit_mb = parse_size_mb(size)?;
        self.store
            .set_quota_limit(namespace, QuotaType::Schema, limit_mb)
            .await?;
        info!("schema quota on {:?} set to {} MB", schema, limit_mb);
        Ok(())
    }

    pub async fn set_role_quota(&self, role: &str, size: &str) -> QuotaResult<()> {
        let owner = self.role_oid(role)?;
        let limit_mb = parse_size_mb(size)?;
        self.store
            .set_quota_limit(owner, QuotaType::Role, limit_mb)
            .await?;
        info!("role quota on {:?} set to {} MB", role, limit_mb);
        Ok(())
    }

    pub async fn set_schema_tablespace_quota(
        &self,
        schema: &str,
        tablespace: &str,
        size: &str,
    ) -> QuotaResult<()> {
        let namespace = self.namespace_oid(schema)?;
        let tablespace_oid = self.tablespace_oid(tablespace)?;
        self.set_tablespace_quota(QuotaType::SchemaTablespace, namespace, tablespace_oid, size)
            .await
    }

    pub async fn set_role_tablespace_quota(
        &self,
        role: &str,
        tablespace: &str,
        size: &str,
    ) -> QuotaResult<()> {
        let owner = self.role_oid(role)?;
        let tablespace_oid = self.tablespace_oid(tablespace)?;
        self.set_tablespace_quota(QuotaType::RoleTablespace, owner, tablespace_oid, size)
            .await
    }

    async fn set_tablespace_quota(
        &self,
        quota_type: QuotaType,
        primary: Oid,
        tablespace: Oid,
        size: &str,
    ) -> QuotaResult<()> {
        let limit_mb = parse_size_mb(size)?;
        if limit_mb < 0 {
            self.store.set_quota_limit(primary, quota_type, -1).await?;
            self.store.clear_targets(quota_type, primary).await?;
            return Ok(());
        }
        // One tablespace pair per primary target; re-setting re-points it.
        self.store.clear_targets(quota_type, primary).await?;
        self.store
            .set_target(quota_type, primary, tablespace)
            .await?;
        self.store
            .set_quota_limit(primary, quota_type, limit_mb)
            .await?;
        Ok(())
    }

    /// Set the per-segment share ratio on an already configured quota.
    pub async fn set_per_segment_quota(
        &self,
        quota_type: QuotaType,
        target_name: &str,
        ratio: f32,
    ) -> QuotaResult<()> {
        if ratio <= 0.0 {
            return Err(QuotaError::config(format!(
                "per-segment ratio must be positive, got {}",
                ratio
            )));
        }
        let target_oid = match quota_type {
            QuotaType::Schema | QuotaType::SchemaTablespace => self.namespace_oid(target_name)?,
            QuotaType::Role | QuotaType::RoleTablespace => self.role_oid(target_name)?,
        };
        let affected = self
            .store
            .set_seg_ratio(target_oid, quota_type, ratio)
            .await?;
        if affected == 0 {
            return Err(QuotaError::config(format!(
                "no {} quota configured for {:?}",
                quota_type, target_name
            )));
        }
        Ok(())
    }

    pub fn pause(&self, db: Oid) {
        self.ctx.coordinator.paused.pause(db);
        info!("quota enforcement paused for database {}", db);
    }

    pub fn resume(&self, db: Oid) {
        self.ctx.coordinator.paused.resume(db);
        info!("quota enforcement resumed for database {}", db);
    }

    /// Block until the database's worker has completed another epoch.
    pub async fn wait_for_worker_new_epoch(&self, db: Oid) {
        let clock = self.ctx.coordinator.epochs.clock(db);
        let from = clock.current();
        clock.wait_past(from).await;
    }

    pub fn status(&self, db: Oid) -> DatabaseStatus {
        DatabaseStatus {
            monitored: self.ctx.coordinator.node.is_monitored(db),
            paused: self.ctx.coordinator.paused.is_paused(db),
            epoch: self
                .ctx
                .coordinator
                .epochs
                .get(db)
                .map(|clock| clock.current())
                .unwrap_or(0),
            version: self.version,
        }
    }

    /// Ask the launcher to start monitoring a database.
    pub async fn create_extension(&self, db: Oid) -> QuotaResult<()> {
        let result = self
            .ctx
            .coordinator
            .ddl_mailbox
            .request(
                DdlCommand::CreateExtension,
                db,
                Duration::from_secs(self.settings.ddl_wait_timeout_secs),
            )
            .await?;
        match result {
            DdlResult::Ok => Ok(()),
            DdlResult::ExceedLimit => Err(QuotaError::worker_limit(MAX_MONITORED_DATABASES)),
            DdlResult::StartWorkerFailed => Err(QuotaError::internal(
                "launcher could not start the worker".to_owned(),
            )),
            DdlResult::Pending => Err(QuotaError::mailbox_timeout()),
        }
    }

    /// Ask the launcher to stop monitoring a database.
    pub async fn drop_extension(&self, db: Oid) -> QuotaResult<()> {
        let result = self
            .ctx
            .coordinator
            .ddl_mailbox
            .request(
                DdlCommand::DropExtension,
                db,
                Duration::from_secs(self.settings.ddl_wait_timeout_secs),
            )
            .await?;
        match result {
            DdlResult::Ok => Ok(()),
            other => Err(QuotaError::internal(format!(
                "unexpected launcher answer: {:?}",
                other
            ))),
        }
    }

    /// Bulk recompute of every user relation's size, used right after
    /// install so evaluation has a full baseline to start from.
    pub async fn init_table_size_table(&self, db: Oid) -> QuotaResult<()> {
        let relations = self.ctx.catalog.user_relations(db);
        let version = self.version;

        let calls = self.ctx.clients().into_iter().map(|client| {
            let oids = relations.clone();
            async move {
                client
                    .fetch_table_stat(db, FetchMode::ActiveSizes, oids, version)
                    .await
            }
        });

        let mut per_seg: HashMap<Oid, HashMap<i16, i64>> = HashMap::new();
        let mut totals: HashMap<Oid, i64> = HashMap::new();
        for result in join_all(calls).await {
            for stat in result? {
                *totals.entry(stat.relation).or_default() += stat.size;
                if version.has_seg_id() {
                    per_seg
                        .entry(stat.relation)
                        .or_default()
                        .insert(stat.seg_id, stat.size);
                }
            }
        }

        let mut rows = Vec::new();
        for (&relation, &total) in &totals {
            rows.push(TableSizeRow::new(relation, SEG_ID_TOTAL, total));
            if let Some(segs) = per_seg.get(&relation) {
                for (&seg_id, &size) in segs {
                    rows.push(TableSizeRow::new(relation, seg_id, size));
                }
            }
        }

        self.store.replace_all_table_sizes(rows).await?;
        self.store.set_state(InstallState::Ready).await?;
        self.metrics.count("admin.init_table_size", totals.len() as i64);
        Ok(())
    }

    /// Cluster-wide on-disk size of one relation: every segment plus the
    /// coordinator stats its files and the shares are summed. Tolerates the
    /// relation being dropped mid-call by answering 0 for missing pieces.
    pub async fn relation_size(&self, relation: Oid) -> QuotaResult<i64> {
        let Some(row) = self.ctx.catalog.relation(relation) else {
            return Ok(0);
        };
        let node = RelFileNode::new(row.db, row.tablespace, row.relfilenode);
        let backend = row.backend;

        let mut clients = self.ctx.clients();
        if let Some(coordinator) = &self.ctx.coordinator_client {
            clients.push(coordinator.clone());
        }
        let calls = clients
            .into_iter()
            .map(|client| async move { client.relation_file_size(node, backend).await });

        let mut total = 0;
        for result in join_all(calls).await {
            total += result?;
        }
        Ok(total)
    }

    pub async fn show_schema_quota(&self) -> QuotaResult<Vec<QuotaUsageRow>> {
        self.show_quota(QuotaType::Schema).await
    }

    pub async fn show_role_quota(&self) -> QuotaResult<Vec<QuotaUsageRow>> {
        self.show_quota(QuotaType::Role).await
    }

    pub async fn show_schema_tablespace_quota(&self) -> QuotaResult<Vec<QuotaUsageRow>> {
        self.show_quota(QuotaType::SchemaTablespace).await
    }

    pub async fn show_role_tablespace_quota(&self) -> QuotaResult<Vec<QuotaUsageRow>> {
        self.show_quota(QuotaType::RoleTablespace).await
    }

    /// Join the persisted cluster totals with the quota configuration and
    /// the catalog's name tables.
    async fn show_quota(&self, quota_type: QuotaType) -> QuotaResult<Vec<QuotaUsageRow>> {
        let configs = self.store.fetch_quota_configs().await?;
        let targets = self.store.fetch_targets().await?;
        let sizes = self.store.load_table_sizes().await?;

        // Aggregate seg -1 rows onto the requested target category.
        let mut used: HashMap<(Oid, Option<Oid>), i64> = HashMap::new();
        for row in sizes.iter().filter(|row| row.seg_id == SEG_ID_TOTAL) {
            let Some(rel) = self.ctx.catalog.relation(row.table_id as Oid) else {
                continue;
            };
            let (primary, tablespace) = match quota_type {
                QuotaType::Schema => (rel.namespace, None),
                QuotaType::Role => (rel.owner, None),
                QuotaType::SchemaTablespace => (rel.namespace, Some(rel.tablespace)),
                QuotaType::RoleTablespace => (rel.owner, Some(rel.tablespace)),
            };
            *used.entry((primary, tablespace)).or_default() += row.size;
        }

        let mut rows = Vec::new();
        for config in configs
            .iter()
            .filter(|config| config.quota_type() == Some(quota_type))
        {
            let primary = config.target_oid as Oid;
            let target_name = match quota_type {
                QuotaType::Schema | QuotaType::SchemaTablespace => {
                    self.ctx.catalog.namespace_name(primary)
                }
                QuotaType::Role | QuotaType::RoleTablespace => self.ctx.catalog.role_name(primary),
            };
            let Some(target_name) = target_name else {
                // Target dropped from the catalog; nothing to present.
                continue;
            };

            if quota_type.is_tablespace_qualified() {
                for target in targets.iter().filter(|t| {
                    t.quota_type == quota_type.code() && t.primary_oid == config.target_oid
                }) {
                    let tablespace = target.tablespace_oid as Oid;
                    rows.push(QuotaUsageRow {
                        target_name: target_name.clone(),
                        tablespace_name: self.ctx.catalog.tablespace_name(tablespace),
                        quota_in_mb: config.quota_limit_mb,
                        used_bytes: used
                            .get(&(primary, Some(tablespace)))
                            .copied()
                            .unwrap_or(0),
                    });
                }
            } else {
                rows.push(QuotaUsageRow {
                    target_name,
                    tablespace_name: None,
                    quota_in_mb: config.quota_limit_mb,
                    used_bytes: used.get(&(primary, None)).copied().unwrap_or(0),
                });
            }
        }
        rows.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        Ok(rows)
    }
}
