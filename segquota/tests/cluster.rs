//! End-to-end scenarios against the in-memory mock cluster: real files on a
//! scratch disk, a real sqlite metadata store, and the full worker stack.

use std::sync::Arc;
use std::time::Duration;

use segquota::admin::QuotaAdmin;
use segquota::blocklist::EnforcementGate;
use segquota::host::mock::MockCluster;
use segquota::host::{Catalog, ClusterContext};
use segquota::model::QuotaModel;
use segquota::types::{BlockReason, RelFileNode, SchemaVersion, StorageKind};
use segquota::worker::Launcher;
use segquota_common::{BlockingThreadpool, Metrics, Oid, QuotaType, SEG_ID_TOTAL};
use segquota_settings::Settings;
use segquota_store::{InstallState, StorePool, TableSizeRow};
use temp_dir::TempDir;

const MB: u64 = 1024 * 1024;

struct Harness {
    _dir: TempDir,
    cluster: MockCluster,
    ctx: ClusterContext,
    store: StorePool,
    admin: QuotaAdmin,
    gate: EnforcementGate,
    settings: Settings,
    db: Oid,
    namespace: Oid,
    owner: Oid,
    tablespace: Oid,
}

fn harness(seg_count: usize) -> Harness {
    harness_with(seg_count, |_| {})
}

fn harness_with(seg_count: usize, tweak: impl FnOnce(&mut Settings)) -> Harness {
    let _ = env_logger::try_init();
    let dir = TempDir::new().unwrap();
    let mut settings = Settings {
        database_url: dir.child("meta.db").to_string_lossy().into_owned(),
        database_pool_max_size: 2,
        naptime_secs: 1,
        max_active_tables: 1024,
        relation_cache_capacity: 256,
        ..Default::default()
    };
    tweak(&mut settings);

    let cluster = MockCluster::new(seg_count, &settings, dir.child("data"));
    let ctx = cluster.context();
    let store = StorePool::new(
        &settings,
        &Metrics::noop(),
        Arc::new(BlockingThreadpool::default()),
    )
    .unwrap();
    let admin = QuotaAdmin::new(
        ctx.clone(),
        store.clone(),
        settings.clone(),
        Metrics::noop(),
        SchemaVersion::V2,
    );
    let gate = EnforcementGate::new(Arc::clone(&ctx.coordinator), Metrics::noop());

    let db = cluster.catalog.define_database("db1");
    let namespace = cluster.catalog.define_namespace("s1");
    let owner = cluster.catalog.define_role("r1");
    let tablespace = cluster.catalog.define_tablespace("pg_default");

    Harness {
        _dir: dir,
        cluster,
        ctx,
        store,
        admin,
        gate,
        settings,
        db,
        namespace,
        owner,
        tablespace,
    }
}

impl Harness {
    fn table(&self) -> Oid {
        self.cluster
            .create_table(self.db, self.namespace, self.owner, self.tablespace)
    }

    fn model(&self) -> QuotaModel {
        QuotaModel::new(self.db, SchemaVersion::V2)
    }

    async fn refresh(&self, model: &mut QuotaModel) {
        model
            .refresh(&self.ctx, &self.store, &Metrics::noop())
            .await
            .unwrap();
    }

    fn launcher(&self) -> Arc<Launcher> {
        Launcher::new(
            self.ctx.clone(),
            self.store.clone(),
            self.settings.clone(),
            Metrics::noop(),
            SchemaVersion::V2,
        )
    }

    async fn spawn_launcher(&self) -> Arc<Launcher> {
        let launcher = self.launcher();
        launcher.spawn();
        while !self.ctx.coordinator.ddl_mailbox.launcher_alive() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        launcher
    }
}

// Scenario: a schema limit is declared, a table outgrows it, and within two
// epochs further writes are refused; pause lifts enforcement, resume
// restores it after the next epoch.
#[tokio::test]
async fn schema_limit_blocks_writes_and_pause_lifts_it() {
    let h = harness(2);
    let launcher = h.spawn_launcher().await;
    h.admin.create_extension(h.db).await.unwrap();

    h.admin.set_schema_quota("s1", "1 MB").await.unwrap();
    let table = h.table();
    h.cluster.extend_evenly(table, 2 * MB);

    h.admin.wait_for_worker_new_epoch(h.db).await;
    h.admin.wait_for_worker_new_epoch(h.db).await;

    let err = h.gate.check_relation_write(h.db, table).unwrap_err();
    assert!(err.is_violation());

    // Paused: the blocklist stays but the gate lets writes through.
    h.admin.pause(h.db);
    assert!(h.gate.check_relation_write(h.db, table).is_ok());

    h.admin.resume(h.db);
    h.admin.wait_for_worker_new_epoch(h.db).await;
    let err = h.gate.check_relation_write(h.db, table).unwrap_err();
    assert!(err.is_violation());

    launcher.shutdown_flag().trigger();
}

#[tokio::test]
async fn refresh_aggregates_shard_sizes_into_totals() {
    let h = harness(3);
    h.ctx.set_monitored(h.db, true);
    let table = h.table();
    h.cluster.extend_on_segment(table, 0, MB);
    h.cluster.extend_on_segment(table, 1, 2 * MB);
    h.cluster.extend_on_segment(table, 2, 3 * MB);

    let mut model = h.model();
    h.refresh(&mut model).await; // cold start, nothing persisted yet
    h.refresh(&mut model).await; // drain + size + persist
    assert_eq!(model.total_size(table), Some(6 * MB as i64));

    // Aggregation identity: the persisted total row equals the sum of the
    // persisted per-shard rows.
    let rows = h.store.load_table_sizes().await.unwrap();
    let total = rows
        .iter()
        .find(|r| r.table_id == table as i64 && r.seg_id == SEG_ID_TOTAL)
        .expect("total row missing");
    let shard_sum: i64 = rows
        .iter()
        .filter(|r| r.table_id == table as i64 && r.seg_id != SEG_ID_TOTAL)
        .map(|r| r.size)
        .sum();
    assert_eq!(total.size, shard_sum);
    assert_eq!(total.size, 6 * MB as i64);
}

#[tokio::test]
async fn auxiliary_storage_counts_against_the_primary() {
    let h = harness(2);
    h.ctx.set_monitored(h.db, true);
    let table = h.table();
    let toast = h.cluster.create_auxiliary(table, StorageKind::Heap);

    h.cluster.extend_evenly(table, MB);
    h.cluster.extend_evenly(toast, 2 * MB);
    h.admin.set_schema_quota("s1", "2 MB").await.unwrap();

    let mut model = h.model();
    h.refresh(&mut model).await;
    h.refresh(&mut model).await;

    // All three megabytes land on the primary.
    assert_eq!(model.total_size(table), Some(3 * MB as i64));
    assert_eq!(model.total_size(toast), None);

    // Writes to the auxiliary relation are refused through its primary.
    assert!(h.gate.check_relation_write(h.db, table).unwrap_err().is_violation());
    assert!(h.gate.check_relation_write(h.db, toast).unwrap_err().is_violation());

    // The relation caches stay internally consistent everywhere.
    for segment in &h.cluster.segments {
        assert!(segment.shmem.relation_cache.check_consistency());
    }
    assert!(h.ctx.coordinator.node.relation_cache.check_consistency());
}

// Scenario: relation_size races a concurrent unlink and answers 0 rather
// than raising.
#[tokio::test]
async fn relation_size_tolerates_concurrent_unlink() {
    let h = harness(2);
    let table = h.table();
    h.cluster.extend_evenly(table, 4 * MB);
    assert_eq!(h.admin.relation_size(table).await.unwrap(), 4 * MB as i64);

    // Unlink the files out from under the catalog row.
    let row = h.cluster.catalog.relation(table).unwrap();
    let node = RelFileNode::new(row.db, row.tablespace, row.relfilenode);
    for segment in &h.cluster.segments {
        std::fs::remove_file(segment.node.storage_path(&node, None)).unwrap();
    }
    assert_eq!(h.admin.relation_size(table).await.unwrap(), 0);

    // A fully dropped relation answers 0 too.
    h.cluster.drop_table(table);
    assert_eq!(h.admin.relation_size(table).await.unwrap(), 0);
}

// Scenario: two concurrent writers grow an append-optimized table; once
// both finish, relation_size matches what landed on disk.
#[tokio::test]
async fn ao_concurrent_writers_account_fully() {
    let h = harness(2);
    let table = h
        .cluster
        .create_ao_table(h.db, h.namespace, h.owner, h.tablespace);

    std::thread::scope(|scope| {
        scope.spawn(|| h.cluster.extend_on_segment(table, 0, 10_000 * 64));
        scope.spawn(|| h.cluster.extend_on_segment(table, 1, 10_000 * 64));
    });

    assert_eq!(
        h.admin.relation_size(table).await.unwrap(),
        2 * 10_000 * 64
    );
}

// Scenario: one shard holds 25 MB of a 100 MB quota with seg_ratio 0.2;
// the cluster total is fine but the shard exceeds its 20 MB share.
#[tokio::test]
async fn unbalanced_segment_blocks_by_ratio() {
    let h = harness(4);
    h.ctx.set_monitored(h.db, true);
    h.admin.set_schema_quota("s1", "100 MB").await.unwrap();
    h.admin
        .set_per_segment_quota(QuotaType::Schema, "s1", 0.2)
        .await
        .unwrap();

    let table = h.table();
    h.cluster.extend_on_segment(table, 0, 25 * MB);

    let mut model = h.model();
    h.refresh(&mut model).await;
    h.refresh(&mut model).await;

    let entry = h
        .ctx
        .coordinator
        .blocklist
        .lookup(h.db, table)
        .expect("relation should be blocklisted");
    assert_eq!(entry.reason, BlockReason::NoFreeSpaceOnTablespace);
    assert!(h.gate.check_relation_write(h.db, table).unwrap_err().is_violation());
}

// Scenario: the active-table map fills up, drops the overflowing probe, and
// recovers capacity after one drain.
#[tokio::test]
async fn active_map_overflow_recovers_after_drain() {
    let h = harness_with(1, |settings| settings.max_active_tables = 4);
    h.ctx.set_monitored(h.db, true);
    let segment = &h.cluster.segments[0];

    for i in 0..5u32 {
        let node = RelFileNode::new(h.db, h.tablespace, 900_000 + i);
        segment.registry.dispatch_extend(node, None);
    }
    // The fifth probe was dropped, the map stays at capacity.
    assert_eq!(segment.shmem.active_tables.len(), 4);

    let drained = segment.shmem.active_tables.drain();
    assert_eq!(drained.len(), 4);

    // Capacity restored; new probes land again.
    segment
        .registry
        .dispatch_extend(RelFileNode::new(h.db, h.tablespace, 900_100), None);
    assert_eq!(segment.shmem.active_tables.len(), 1);
}

#[tokio::test]
async fn cold_start_evaluates_last_known_sizes() {
    let h = harness(2);
    h.ctx.set_monitored(h.db, true);
    let table = h.table();
    h.admin.set_schema_quota("s1", "1 MB").await.unwrap();

    // A previous incarnation persisted this relation at 2 MB.
    h.store
        .upsert_table_sizes(vec![
            TableSizeRow::new(table, SEG_ID_TOTAL, 2 * MB as i64),
            TableSizeRow::new(table, 0, MB as i64),
            TableSizeRow::new(table, 1, MB as i64),
        ])
        .await
        .unwrap();

    // The very first epoch after restart blocks, without any drain.
    let mut model = h.model();
    h.refresh(&mut model).await;
    assert!(h.gate.check_relation_write(h.db, table).unwrap_err().is_violation());
}

#[tokio::test]
async fn dropped_relations_expire_from_model_and_store() {
    let h = harness(2);
    h.ctx.set_monitored(h.db, true);
    let table = h.table();
    h.cluster.extend_evenly(table, 2 * MB);

    let mut model = h.model();
    h.refresh(&mut model).await;
    h.refresh(&mut model).await;
    assert!(model.total_size(table).is_some());

    h.cluster.drop_table(table);
    h.refresh(&mut model).await;
    assert!(model.total_size(table).is_none());
    let rows = h.store.load_table_sizes().await.unwrap();
    assert!(rows.iter().all(|r| r.table_id != table as i64));
}

#[tokio::test]
async fn failing_segment_keeps_last_known_shard_sizes() {
    let h = harness(2);
    h.ctx.set_monitored(h.db, true);
    let table = h.table();
    h.cluster.extend_on_segment(table, 0, MB);
    h.cluster.extend_on_segment(table, 1, MB);

    let mut model = h.model();
    h.refresh(&mut model).await;
    h.refresh(&mut model).await;
    assert_eq!(model.total_size(table), Some(2 * MB as i64));

    // Segment 1 goes dark; segment 0 keeps growing.
    h.cluster.segments[1].client.set_failing(true);
    h.cluster.extend_on_segment(table, 0, 3 * MB);
    h.refresh(&mut model).await;

    // Shard 0 is current, shard 1 keeps its last-known megabyte.
    assert_eq!(model.total_size(table), Some(4 * MB as i64));
}

#[tokio::test]
async fn launcher_honors_monitored_database_capacity() {
    let h = harness(1);
    let launcher = h.spawn_launcher().await;

    for i in 0..10 {
        let db = h.cluster.catalog.define_database(&format!("extra{}", i));
        h.admin.create_extension(db).await.unwrap();
    }
    assert_eq!(launcher.worker_count(), 10);

    let overflow_db = h.cluster.catalog.define_database("one_too_many");
    let err = h.admin.create_extension(overflow_db).await.unwrap_err();
    assert!(err.is_worker_limit());

    // Dropping one frees a slot.
    let victim = h.cluster.catalog.database_oid("extra0").unwrap();
    h.admin.drop_extension(victim).await.unwrap();
    assert_eq!(launcher.worker_count(), 9);
    h.admin.create_extension(overflow_db).await.unwrap();

    launcher.shutdown_flag().trigger();
}

#[tokio::test]
async fn drop_extension_clears_enforcement_state() {
    let h = harness(2);
    let launcher = h.spawn_launcher().await;
    h.admin.create_extension(h.db).await.unwrap();
    h.admin.set_schema_quota("s1", "1 MB").await.unwrap();
    let table = h.table();
    h.cluster.extend_evenly(table, 2 * MB);

    h.admin.wait_for_worker_new_epoch(h.db).await;
    h.admin.wait_for_worker_new_epoch(h.db).await;
    assert!(h.gate.check_relation_write(h.db, table).is_err());

    h.admin.drop_extension(h.db).await.unwrap();
    assert!(h.gate.check_relation_write(h.db, table).is_ok());
    assert!(!h.ctx.coordinator.node.is_monitored(h.db));

    launcher.shutdown_flag().trigger();
}

#[tokio::test]
async fn requests_without_a_launcher_fail_fast() {
    let h = harness(1);
    let err = h.admin.create_extension(h.db).await.unwrap_err();
    assert!(err.is_launcher_down());
}

#[tokio::test]
async fn management_calls_validate_before_touching_state() {
    let h = harness(1);

    assert!(h
        .admin
        .set_schema_quota("no_such_schema", "1 MB")
        .await
        .unwrap_err()
        .is_config());
    assert!(h
        .admin
        .set_schema_quota("s1", "one megabyte")
        .await
        .unwrap_err()
        .is_config());
    assert!(h
        .admin
        .set_per_segment_quota(QuotaType::Schema, "s1", 0.0)
        .await
        .unwrap_err()
        .is_config());
    // Ratio on a target with no quota configured is rejected.
    assert!(h
        .admin
        .set_per_segment_quota(QuotaType::Schema, "s1", 0.5)
        .await
        .unwrap_err()
        .is_config());

    assert!(h.store.fetch_quota_configs().await.unwrap().is_empty());
}

#[tokio::test]
async fn diagnostic_views_join_names_and_usage() {
    let h = harness(2);
    h.ctx.set_monitored(h.db, true);
    h.admin.set_schema_quota("s1", "10 MB").await.unwrap();
    h.admin.set_role_quota("r1", "20 MB").await.unwrap();
    h.admin
        .set_schema_tablespace_quota("s1", "pg_default", "30 MB")
        .await
        .unwrap();

    let table = h.table();
    h.cluster.extend_evenly(table, 4 * MB);
    let mut model = h.model();
    h.refresh(&mut model).await;
    h.refresh(&mut model).await;

    let schema_rows = h.admin.show_schema_quota().await.unwrap();
    assert_eq!(schema_rows.len(), 1);
    assert_eq!(schema_rows[0].target_name, "s1");
    assert_eq!(schema_rows[0].quota_in_mb, 10);
    assert_eq!(schema_rows[0].used_bytes, 4 * MB as i64);

    let role_rows = h.admin.show_role_quota().await.unwrap();
    assert_eq!(role_rows[0].target_name, "r1");
    assert_eq!(role_rows[0].used_bytes, 4 * MB as i64);

    let pair_rows = h.admin.show_schema_tablespace_quota().await.unwrap();
    assert_eq!(pair_rows.len(), 1);
    assert_eq!(pair_rows[0].tablespace_name.as_deref(), Some("pg_default"));
    assert_eq!(pair_rows[0].quota_in_mb, 30);
}

#[tokio::test]
async fn init_table_size_table_builds_the_baseline() {
    let h = harness(2);
    let table = h.table();
    let other = h.table();
    h.cluster.extend_evenly(table, 2 * MB);
    h.cluster.extend_evenly(other, MB);

    assert_eq!(h.store.get_state().await.unwrap(), InstallState::Unknown);
    h.admin.init_table_size_table(h.db).await.unwrap();
    assert_eq!(h.store.get_state().await.unwrap(), InstallState::Ready);

    let rows = h.store.load_table_sizes().await.unwrap();
    let total_of = |oid: Oid| {
        rows.iter()
            .find(|r| r.table_id == oid as i64 && r.seg_id == SEG_ID_TOTAL)
            .map(|r| r.size)
    };
    assert_eq!(total_of(table), Some(2 * MB as i64));
    assert_eq!(total_of(other), Some(MB as i64));
}

#[tokio::test]
async fn role_tablespace_quota_blocks_only_registered_pairs() {
    let h = harness(2);
    h.ctx.set_monitored(h.db, true);
    let elsewhere = h.cluster.catalog.define_tablespace("fast_ssd");
    h.admin
        .set_role_tablespace_quota("r1", "fast_ssd", "1 MB")
        .await
        .unwrap();

    // This table lives in pg_default, not in the registered pair.
    let table = h.table();
    h.cluster.extend_evenly(table, 4 * MB);
    let mut model = h.model();
    h.refresh(&mut model).await;
    h.refresh(&mut model).await;
    assert!(h.gate.check_relation_write(h.db, table).is_ok());

    // A table in the registered tablespace is subject to the pair's limit.
    let fast_table = h
        .cluster
        .create_table(h.db, h.namespace, h.owner, elsewhere);
    h.cluster.extend_evenly(fast_table, 4 * MB);
    h.refresh(&mut model).await;
    let err = h.gate.check_relation_write(h.db, fast_table).unwrap_err();
    assert!(err.is_violation());
}
