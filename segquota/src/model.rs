//! The per-database quota model: the working size table the worker refreshes
//! each epoch, and the fanout that feeds it.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use segquota_common::{Metrics, Oid, SegId, SEG_ID_TOTAL};
use segquota_store::{StorePool, TableSizeRow};

use crate::error::QuotaResult;
use crate::evaluator::{self, RelMeta};
use crate::host::ClusterContext;
use crate::types::{FetchMode, SchemaVersion, TableStat};

pub struct QuotaModel {
    db: Oid,
    version: SchemaVersion,
    /// Last-known per-shard sizes of every tracked relation.
    per_seg: HashMap<Oid, HashMap<SegId, i64>>,
    /// Cluster-wide totals, kept equal to the sum of the per-shard rows.
    totals: HashMap<Oid, i64>,
    initialized: bool,
}

impl QuotaModel {
    pub fn new(db: Oid, version: SchemaVersion) -> Self {
        Self {
            db,
            version,
            per_seg: HashMap::new(),
            totals: HashMap::new(),
            initialized: false,
        }
    }

    pub fn tracked_relations(&self) -> usize {
        self.totals.len()
    }

    pub fn total_size(&self, relation: Oid) -> Option<i64> {
        self.totals.get(&relation).copied()
    }

    /// One refresh epoch: drain the cluster's active set, re-size it,
    /// persist, and recompute the blocklist.
    pub async fn refresh(
        &mut self,
        ctx: &ClusterContext,
        store: &StorePool,
        metrics: &Metrics,
    ) -> QuotaResult<()> {
        // Entries for relations dropped by now-committed transactions go
        // first, so stale linkages never feed the evaluator.
        ctx.coordinator.node.relation_cache.sweep_committed(&*ctx.catalog);

        if !self.initialized {
            // First epoch after a (re)start: skip the drain and evaluate
            // against the last persisted sizes; the next epoch resumes the
            // normal cycle.
            self.load_persisted(store).await?;
            self.initialized = true;
        } else {
            let active = self.drain_active(ctx).await;
            if !active.is_empty() {
                let stats = self.fetch_sizes(ctx, &active).await;
                self.apply_stats(stats);
            }
            let expired = self.expire_dropped(ctx);
            if !expired.is_empty() {
                store
                    .delete_table_sizes(expired.iter().map(|&oid| oid as i64).collect())
                    .await?;
            }
            if !active.is_empty() {
                self.persist_active(store, &active).await?;
            }
        }

        self.evaluate(ctx, store, metrics).await
    }

    async fn load_persisted(&mut self, store: &StorePool) -> QuotaResult<()> {
        for row in store.load_table_sizes().await? {
            let relation = row.table_id as Oid;
            if row.seg_id == SEG_ID_TOTAL {
                self.totals.insert(relation, row.size);
            } else {
                self.per_seg
                    .entry(relation)
                    .or_default()
                    .insert(row.seg_id, row.size);
            }
        }
        debug!(
            "database {}: loaded {} persisted relation sizes",
            self.db,
            self.totals.len()
        );
        Ok(())
    }

    /// Drain phase: ask every segment for the primary relations whose
    /// storage changed since the last epoch. A failing segment contributes
    /// nothing this epoch; its map stays intact for the next one.
    async fn drain_active(&self, ctx: &ClusterContext) -> HashSet<Oid> {
        let db = self.db;
        let version = self.version;
        let calls = ctx.clients().into_iter().map(|client| async move {
            client
                .fetch_table_stat(db, FetchMode::ActiveOids, Vec::new(), version)
                .await
        });

        let mut active = HashSet::new();
        for result in join_all(calls).await {
            match result {
                Ok(stats) => active.extend(stats.into_iter().map(|s| s.relation)),
                Err(e) => warn!("active-oid fetch failed on a segment: {}", e),
            }
        }
        active
    }

    /// Size phase: every segment sizes the unioned active set. Relations a
    /// failing segment cannot answer for keep their last-known shard size.
    async fn fetch_sizes(&self, ctx: &ClusterContext, active: &HashSet<Oid>) -> Vec<TableStat> {
        let db = self.db;
        let version = self.version;
        let oids: Vec<Oid> = active.iter().copied().collect();
        let calls = ctx.clients().into_iter().map(|client| {
            let oids = oids.clone();
            async move {
                client
                    .fetch_table_stat(db, FetchMode::ActiveSizes, oids, version)
                    .await
            }
        });

        let mut stats = Vec::new();
        for result in join_all(calls).await {
            match result {
                Ok(mut rows) => stats.append(&mut rows),
                Err(e) => warn!("size fetch failed on a segment: {}", e),
            }
        }
        stats
    }

    fn apply_stats(&mut self, stats: Vec<TableStat>) {
        match self.version {
            SchemaVersion::V2 => {
                let mut touched = HashSet::new();
                for stat in stats {
                    self.per_seg
                        .entry(stat.relation)
                        .or_default()
                        .insert(stat.seg_id, stat.size);
                    touched.insert(stat.relation);
                }
                for relation in touched {
                    let total = self.per_seg[&relation].values().sum();
                    self.totals.insert(relation, total);
                }
            }
            SchemaVersion::V1 => {
                // Two-column rows: the seg id is implicit, sum per relation.
                let mut sums: HashMap<Oid, i64> = HashMap::new();
                for stat in stats {
                    *sums.entry(stat.relation).or_default() += stat.size;
                }
                for (relation, sum) in sums {
                    self.totals.insert(relation, sum);
                    self.per_seg.remove(&relation);
                }
            }
        }
    }

    /// Forget relations whose catalog row is gone and report them so their
    /// persisted rows can be expired too.
    fn expire_dropped(&mut self, ctx: &ClusterContext) -> Vec<Oid> {
        let dropped: Vec<Oid> = self
            .totals
            .keys()
            .chain(self.per_seg.keys())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|&relation| !ctx.catalog.relation_exists(relation))
            .collect();
        for &relation in &dropped {
            self.totals.remove(&relation);
            self.per_seg.remove(&relation);
        }
        dropped
    }

    /// Upsert rows for the active set only; everything else keeps its
    /// previous rows.
    async fn persist_active(&self, store: &StorePool, active: &HashSet<Oid>) -> QuotaResult<()> {
        let mut rows = Vec::new();
        for &relation in active {
            if let Some(&total) = self.totals.get(&relation) {
                rows.push(TableSizeRow::new(relation, SEG_ID_TOTAL, total));
            }
            if let Some(segs) = self.per_seg.get(&relation) {
                for (&seg_id, &size) in segs {
                    rows.push(TableSizeRow::new(relation, seg_id, size));
                }
            }
        }
        if !rows.is_empty() {
            store.upsert_table_sizes(rows).await?;
        }
        Ok(())
    }

    /// Roll sizes up into per-target totals and swap in the new blocklist.
    async fn evaluate(
        &self,
        ctx: &ClusterContext,
        store: &StorePool,
        metrics: &Metrics,
    ) -> QuotaResult<()> {
        let configs = store.fetch_quota_configs().await?;
        let targets = store.fetch_targets().await?;

        let cache = &ctx.coordinator.node.relation_cache;
        let mut meta = HashMap::new();
        for &relation in self.totals.keys() {
            let entry = cache.get(relation).or_else(|| {
                cache.update(&*ctx.catalog, relation);
                cache.get(relation)
            });
            // Only primaries carry quota accounting; auxiliaries were
            // already folded into their primary's size.
            if let Some(entry) = entry {
                if entry.is_primary() {
                    meta.insert(
                        relation,
                        RelMeta {
                            namespace: entry.namespace,
                            owner: entry.owner,
                            tablespace: entry.tablespace,
                        },
                    );
                }
            }
        }

        let desired = evaluator::evaluate(&self.totals, &self.per_seg, &meta, &configs, &targets);
        metrics.count("evaluator.blocked_relations", desired.len() as i64);
        ctx.coordinator.blocklist.replace_db(self.db, desired);
        Ok(())
    }
}
