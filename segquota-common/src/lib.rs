#[macro_use]
extern crate slog_scope;

mod metrics;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

pub use metrics::{metrics_from_opts, MetricError, Metrics};

/// Object ids handed out by the host catalog.
pub type Oid = u32;

/// Shard identifier. `SEG_ID_TOTAL` marks a cluster-wide aggregate row.
pub type SegId = i16;

pub const SEG_ID_TOTAL: SegId = -1;

/// Oids below this boundary are reserved for the host's own catalog objects.
pub const FIRST_NORMAL_OID: Oid = 16384;

/// The four categories a quota can be declared on. The discriminants are the
/// stable codes used by the persisted `quota_config` and `target` tables.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(i16)]
pub enum QuotaType {
    Schema = 0,
    Role = 1,
    SchemaTablespace = 2,
    RoleTablespace = 3,
}

impl QuotaType {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(QuotaType::Schema),
            1 => Some(QuotaType::Role),
            2 => Some(QuotaType::SchemaTablespace),
            3 => Some(QuotaType::RoleTablespace),
            _ => None,
        }
    }

    /// Whether this category carries an explicit tablespace qualifier.
    pub fn is_tablespace_qualified(self) -> bool {
        matches!(self, QuotaType::SchemaTablespace | QuotaType::RoleTablespace)
    }
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaType::Schema => "schema",
            QuotaType::Role => "role",
            QuotaType::SchemaTablespace => "schema_tablespace",
            QuotaType::RoleTablespace => "role_tablespace",
        };
        f.write_str(name)
    }
}

#[macro_export]
macro_rules! from_error {
    ($from:ty, $to:ty, $to_kind:expr) => {
        impl From<$from> for $to {
            fn from(inner: $from) -> $to {
                $to_kind(inner).into()
            }
        }
    };
}

#[macro_export]
macro_rules! impl_fmt_display {
    ($error:ty, $kind:ty) => {
        impl fmt::Display for $error {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.kind, formatter)
            }
        }
    };
}

pub trait ReportableError {
    fn error_backtrace(&self) -> String;
    fn is_sentry_event(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
}

/// Types that implement this trait can represent internal errors.
pub trait InternalError {
    /// Constructs an internal error with the given error message.
    fn internal_error(message: String) -> Self;
}

/// A threadpool on which callers can spawn non-CPU-bound tasks that block
/// their thread (mostly store I/O). `BlockingThreadpool` intentionally does
/// not implement `Clone`: instantiate it once and share
/// `Arc<BlockingThreadpool>`s.
#[derive(Debug, Default)]
pub struct BlockingThreadpool {
    spawned_tasks: AtomicU64,
}

impl BlockingThreadpool {
    /// Runs a function as a task on the blocking threadpool.
    ///
    /// WARNING: spawning blocking work through means other than this method
    /// will result in inaccurate threadpool metrics being reported.
    pub async fn spawn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: fmt::Debug + Send + InternalError + 'static,
    {
        self.spawned_tasks.fetch_add(1, Ordering::Relaxed);

        let result = tokio::task::spawn_blocking(f).await.unwrap_or_else(|_| {
            Err(E::internal_error(
                "Blocking threadpool operation canceled".to_owned(),
            ))
        });

        self.spawned_tasks.fetch_sub(1, Ordering::Relaxed);

        result
    }

    pub fn active_threads(&self) -> u64 {
        self.spawned_tasks.load(Ordering::Relaxed)
    }
}
