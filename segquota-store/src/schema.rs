table! {
    quota_config (target_oid, quota_type) {
        target_oid -> BigInt,
        quota_type -> SmallInt,
        quota_limit_mb -> BigInt,
        seg_ratio -> Float,
    }
}

table! {
    target (primary_oid, tablespace_oid, quota_type) {
        quota_type -> SmallInt,
        primary_oid -> BigInt,
        tablespace_oid -> BigInt,
    }
}

table! {
    table_size (table_id, seg_id) {
        table_id -> BigInt,
        seg_id -> SmallInt,
        size -> BigInt,
    }
}

table! {
    state (state_value) {
        #[sql_name = "state"]
        state_value -> Integer,
    }
}

table! {
    monitored_database (db_oid) {
        db_oid -> BigInt,
    }
}
