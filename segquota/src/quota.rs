//! Quota target vocabulary and the size-string grammar used by the
//! management surface.

use segquota_common::{Oid, QuotaType};

use crate::error::{QuotaError, QuotaResult};

pub const KILOBYTE: i64 = 1024;
pub const MEGABYTE: i64 = KILOBYTE * 1024;
pub const GIGABYTE: i64 = MEGABYTE * 1024;
pub const TERABYTE: i64 = GIGABYTE * 1024;

/// The entity a quota limit applies to. Tablespace-qualified categories
/// carry the tablespace so one schema or role can have distinct limits per
/// tablespace.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TargetKey {
    pub target_oid: Oid,
    pub quota_type: QuotaType,
    pub tablespace: Option<Oid>,
}

impl TargetKey {
    pub fn schema(namespace: Oid) -> Self {
        Self {
            target_oid: namespace,
            quota_type: QuotaType::Schema,
            tablespace: None,
        }
    }

    pub fn role(owner: Oid) -> Self {
        Self {
            target_oid: owner,
            quota_type: QuotaType::Role,
            tablespace: None,
        }
    }

    pub fn schema_tablespace(namespace: Oid, tablespace: Oid) -> Self {
        Self {
            target_oid: namespace,
            quota_type: QuotaType::SchemaTablespace,
            tablespace: Some(tablespace),
        }
    }

    pub fn role_tablespace(owner: Oid, tablespace: Oid) -> Self {
        Self {
            target_oid: owner,
            quota_type: QuotaType::RoleTablespace,
            tablespace: Some(tablespace),
        }
    }
}

/// A configured limit: megabytes plus the optional per-segment share ratio
/// (negative means no per-segment check).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuotaLimit {
    pub limit_mb: i64,
    pub seg_ratio: f32,
}

/// Parse a size string into whole megabytes.
///
/// The grammar is a decimal integer with an optional `kB|MB|GB|TB` suffix
/// (a bare integer means bytes). Sub-megabyte amounts round down, so
/// `"512 kB"` yields 0, which denies all writes. Any negative amount is
/// normalized to -1, "no limit".
pub fn parse_size_mb(size: &str) -> QuotaResult<i64> {
    let size = size.trim();
    let split = size
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+'))
        .unwrap_or(size.len());
    let (number, unit) = size.split_at(split);
    let number: i64 = number
        .parse()
        .map_err(|_| QuotaError::config(format!("invalid size: {:?}", size)))?;

    let multiplier = match unit.trim() {
        "" => 1,
        "kB" => KILOBYTE,
        "MB" => MEGABYTE,
        "GB" => GIGABYTE,
        "TB" => TERABYTE,
        unknown => {
            return Err(QuotaError::config(format!(
                "invalid size unit: {:?} (valid units are \"kB\", \"MB\", \"GB\", and \"TB\")",
                unknown
            )))
        }
    };

    if number < 0 {
        return Ok(-1);
    }
    let bytes = number.checked_mul(multiplier).ok_or_else(|| {
        QuotaError::config(format!("size out of range: {:?}", size))
    })?;
    Ok(bytes / MEGABYTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_size_mb("1 MB").unwrap(), 1);
        assert_eq!(parse_size_mb("2GB").unwrap(), 2048);
        assert_eq!(parse_size_mb("1 TB").unwrap(), 1024 * 1024);
        assert_eq!(parse_size_mb("2048 kB").unwrap(), 2);
    }

    #[test]
    fn sub_megabyte_rounds_down_to_deny_all() {
        assert_eq!(parse_size_mb("512 kB").unwrap(), 0);
        assert_eq!(parse_size_mb("0 MB").unwrap(), 0);
    }

    #[test]
    fn negative_means_no_limit() {
        assert_eq!(parse_size_mb("-1").unwrap(), -1);
        assert_eq!(parse_size_mb("-5 GB").unwrap(), -1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size_mb("five MB").unwrap_err().is_config());
        assert!(parse_size_mb("10 pB").unwrap_err().is_config());
        assert!(parse_size_mb("").unwrap_err().is_config());
        assert!(parse_size_mb("99999999999 TB").unwrap_err().is_config());
    }
}
