//! Pure quota evaluation: map relation sizes onto per-target totals and
//! decide which relations belong on the blocklist.

use std::collections::{HashMap, HashSet};

use segquota_common::{Oid, QuotaType, SegId};
use segquota_store::{QuotaConfigRow, TargetRow};

use crate::blocklist::BlocklistEntry;
use crate::quota::{QuotaLimit, TargetKey, MEGABYTE};
use crate::types::BlockReason;

/// The slice of relation metadata evaluation needs.
#[derive(Clone, Copy, Debug)]
pub struct RelMeta {
    pub namespace: Oid,
    pub owner: Oid,
    pub tablespace: Oid,
}

#[derive(Default)]
struct TargetUsage {
    total: i64,
    per_seg: HashMap<SegId, i64>,
    members: Vec<Oid>,
}

/// Compute the desired blocklist from the current sizes and configuration.
///
/// Every relation contributes its cluster total to its schema's and its
/// owner's targets; it contributes to a tablespace-qualified target only
/// when that (primary, tablespace) pair is explicitly registered. A target
/// over its limit is exploded into its member relations, since enforcement
/// is per-relation.
pub fn evaluate(
    totals: &HashMap<Oid, i64>,
    per_seg: &HashMap<Oid, HashMap<SegId, i64>>,
    meta: &HashMap<Oid, RelMeta>,
    configs: &[QuotaConfigRow],
    targets: &[TargetRow],
) -> HashMap<Oid, BlocklistEntry> {
    let limits: HashMap<(Oid, QuotaType), QuotaLimit> = configs
        .iter()
        .filter_map(|row| {
            let quota_type = row.quota_type()?;
            Some((
                (row.target_oid as Oid, quota_type),
                QuotaLimit {
                    limit_mb: row.quota_limit_mb,
                    seg_ratio: row.seg_ratio,
                },
            ))
        })
        .collect();

    let registered: HashSet<(QuotaType, Oid, Oid)> = targets
        .iter()
        .filter_map(|row| {
            Some((
                QuotaType::from_code(row.quota_type)?,
                row.primary_oid as Oid,
                row.tablespace_oid as Oid,
            ))
        })
        .collect();

    let mut usage: HashMap<TargetKey, TargetUsage> = HashMap::new();
    for (&relation, &total) in totals {
        let Some(m) = meta.get(&relation) else {
            continue;
        };

        let mut keys = vec![TargetKey::schema(m.namespace), TargetKey::role(m.owner)];
        if registered.contains(&(QuotaType::SchemaTablespace, m.namespace, m.tablespace)) {
            keys.push(TargetKey::schema_tablespace(m.namespace, m.tablespace));
        }
        if registered.contains(&(QuotaType::RoleTablespace, m.owner, m.tablespace)) {
            keys.push(TargetKey::role_tablespace(m.owner, m.tablespace));
        }

        for key in keys {
            if !limits.contains_key(&(key.target_oid, key.quota_type)) {
                continue;
            }
            let entry = usage.entry(key).or_default();
            entry.total += total;
            entry.members.push(relation);
            if let Some(segs) = per_seg.get(&relation) {
                for (&seg_id, &size) in segs {
                    *entry.per_seg.entry(seg_id).or_default() += size;
                }
            }
        }
    }

    let mut desired = HashMap::new();
    for (key, target_usage) in usage {
        let limit = limits[&(key.target_oid, key.quota_type)];
        let limit_bytes = limit.limit_mb.saturating_mul(MEGABYTE);

        let reason = if target_usage.total > limit_bytes {
            Some(BlockReason::LimitExceeded)
        } else if limit.seg_ratio > 0.0 {
            // Per-segment balance: no single shard may exceed its share of
            // the limit, even while the cluster total is fine.
            let share = (limit_bytes as f64 * limit.seg_ratio as f64) as i64;
            target_usage
                .per_seg
                .values()
                .any(|&size| size > share)
                .then_some(BlockReason::NoFreeSpaceOnTablespace)
        } else {
            None
        };

        if let Some(reason) = reason {
            for relation in target_usage.members {
                desired.entry(relation).or_insert(BlocklistEntry {
                    target_oid: key.target_oid,
                    quota_type: key.quota_type,
                    limit_mb: limit.limit_mb,
                    reason,
                });
            }
        }
    }
    desired
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: Oid = 17000;
    const OWNER: Oid = 18000;
    const SPC: Oid = 1663;

    fn meta_for(relations: &[Oid]) -> HashMap<Oid, RelMeta> {
        relations
            .iter()
            .map(|&rel| {
                (
                    rel,
                    RelMeta {
                        namespace: NS,
                        owner: OWNER,
                        tablespace: SPC,
                    },
                )
            })
            .collect()
    }

    fn config(target: Oid, quota_type: QuotaType, limit_mb: i64, seg_ratio: f32) -> QuotaConfigRow {
        QuotaConfigRow {
            target_oid: target as i64,
            quota_type: quota_type.code(),
            quota_limit_mb: limit_mb,
            seg_ratio,
        }
    }

    #[test]
    fn schema_over_limit_blocks_all_members() {
        let totals = HashMap::from([(101, 3 * MEGABYTE), (102, 2 * MEGABYTE)]);
        let meta = meta_for(&[101, 102]);
        let configs = vec![config(NS, QuotaType::Schema, 4, -1.0)];

        let desired = evaluate(&totals, &HashMap::new(), &meta, &configs, &[]);
        assert_eq!(desired.len(), 2);
        let entry = &desired[&101];
        assert_eq!(entry.target_oid, NS);
        assert_eq!(entry.quota_type, QuotaType::Schema);
        assert_eq!(entry.reason, BlockReason::LimitExceeded);
    }

    #[test]
    fn at_limit_is_not_over_limit() {
        let totals = HashMap::from([(101, 4 * MEGABYTE)]);
        let meta = meta_for(&[101]);
        let configs = vec![config(NS, QuotaType::Schema, 4, -1.0)];

        let desired = evaluate(&totals, &HashMap::new(), &meta, &configs, &[]);
        assert!(desired.is_empty());
    }

    #[test]
    fn role_quota_uses_owner() {
        let totals = HashMap::from([(101, 10 * MEGABYTE)]);
        let meta = meta_for(&[101]);
        let configs = vec![config(OWNER, QuotaType::Role, 5, -1.0)];

        let desired = evaluate(&totals, &HashMap::new(), &meta, &configs, &[]);
        assert_eq!(desired[&101].quota_type, QuotaType::Role);
    }

    #[test]
    fn tablespace_target_requires_registration() {
        let totals = HashMap::from([(101, 10 * MEGABYTE)]);
        let meta = meta_for(&[101]);
        let configs = vec![config(NS, QuotaType::SchemaTablespace, 5, -1.0)];

        // Not registered: no contribution, no block.
        let desired = evaluate(&totals, &HashMap::new(), &meta, &configs, &[]);
        assert!(desired.is_empty());

        let targets = vec![TargetRow {
            quota_type: QuotaType::SchemaTablespace.code(),
            primary_oid: NS as i64,
            tablespace_oid: SPC as i64,
        }];
        let desired = evaluate(&totals, &HashMap::new(), &meta, &configs, &targets);
        assert_eq!(desired[&101].quota_type, QuotaType::SchemaTablespace);
    }

    #[test]
    fn unbalanced_segment_trips_seg_ratio() {
        // 25 MB on one shard of four; cluster total well under the 100 MB
        // limit, but over the 0.2 per-segment share (20 MB).
        let totals = HashMap::from([(101, 25 * MEGABYTE)]);
        let per_seg = HashMap::from([(
            101,
            HashMap::from([(0, 25 * MEGABYTE), (1, 0), (2, 0), (3, 0)]),
        )]);
        let meta = meta_for(&[101]);
        let configs = vec![config(NS, QuotaType::Schema, 100, 0.2)];

        let desired = evaluate(&totals, &per_seg, &meta, &configs, &[]);
        assert_eq!(desired[&101].reason, BlockReason::NoFreeSpaceOnTablespace);
    }

    #[test]
    fn balanced_segments_pass_seg_ratio() {
        let totals = HashMap::from([(101, 40 * MEGABYTE)]);
        let per_seg = HashMap::from([(
            101,
            HashMap::from([
                (0, 10 * MEGABYTE),
                (1, 10 * MEGABYTE),
                (2, 10 * MEGABYTE),
                (3, 10 * MEGABYTE),
            ]),
        )]);
        let meta = meta_for(&[101]);
        let configs = vec![config(NS, QuotaType::Schema, 100, 0.2)];

        let desired = evaluate(&totals, &per_seg, &meta, &configs, &[]);
        assert!(desired.is_empty());
    }
}
