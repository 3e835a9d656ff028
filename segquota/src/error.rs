use std::fmt;

use backtrace::Backtrace;
use segquota_common::{
    from_error, impl_fmt_display, InternalError, Oid, QuotaType, ReportableError,
};
use segquota_store::DbError;
use thiserror::Error;

use crate::types::BlockReason;

/// The top-level error type for the quota engine.
#[derive(Debug)]
pub struct QuotaError {
    pub(crate) kind: QuotaErrorKind,
    pub backtrace: Backtrace,
}

impl QuotaError {
    pub fn violation(
        target_oid: Oid,
        quota_type: QuotaType,
        limit_mb: i64,
        reason: BlockReason,
    ) -> Self {
        QuotaErrorKind::Violation {
            target_oid,
            quota_type,
            limit_mb,
            reason,
        }
        .into()
    }

    pub fn config(msg: String) -> Self {
        QuotaErrorKind::Config(msg).into()
    }

    pub fn rpc(msg: String) -> Self {
        QuotaErrorKind::Rpc(msg).into()
    }

    pub fn catalog(msg: String) -> Self {
        QuotaErrorKind::Catalog(msg).into()
    }

    pub fn launcher_down() -> Self {
        QuotaErrorKind::LauncherDown.into()
    }

    pub fn mailbox_timeout() -> Self {
        QuotaErrorKind::MailboxTimeout.into()
    }

    pub fn worker_limit(max: usize) -> Self {
        QuotaErrorKind::WorkerLimit(max).into()
    }

    pub fn internal(msg: String) -> Self {
        QuotaErrorKind::Internal(msg).into()
    }

    /// True when a write was refused because its target is over quota.
    pub fn is_violation(&self) -> bool {
        matches!(self.kind, QuotaErrorKind::Violation { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self.kind, QuotaErrorKind::Config(_))
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self.kind, QuotaErrorKind::Rpc(_))
    }

    pub fn is_mailbox_timeout(&self) -> bool {
        matches!(self.kind, QuotaErrorKind::MailboxTimeout)
    }

    pub fn is_launcher_down(&self) -> bool {
        matches!(self.kind, QuotaErrorKind::LauncherDown)
    }

    pub fn is_worker_limit(&self) -> bool {
        matches!(self.kind, QuotaErrorKind::WorkerLimit(_))
    }

    /// Fatal errors make the worker exit; the launcher restarts it after
    /// backoff. Everything else is retried on the next tick.
    pub fn is_fatal(&self) -> bool {
        match &self.kind {
            QuotaErrorKind::Store(e) => e.is_bad_state(),
            QuotaErrorKind::Internal(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum QuotaErrorKind {
    #[error(
        "disk quota exceeded for {} {} (limit {} MB, {})",
        quota_type,
        target_oid,
        limit_mb,
        reason
    )]
    Violation {
        target_oid: Oid,
        quota_type: QuotaType,
        limit_mb: i64,
        reason: BlockReason,
    },

    #[error("{}", _0)]
    Store(DbError),

    #[error("Segment rpc failed: {}", _0)]
    Rpc(String),

    #[error("Invalid quota configuration: {}", _0)]
    Config(String),

    #[error("Catalog lookup failed: {}", _0)]
    Catalog(String),

    #[error("The launcher is not running")]
    LauncherDown,

    #[error("Timed out waiting for the launcher to answer")]
    MailboxTimeout,

    #[error("Too many monitored databases (max {})", _0)]
    WorkerLimit(usize),

    #[error("Unexpected error: {}", _0)]
    Internal(String),
}

impl From<QuotaErrorKind> for QuotaError {
    fn from(kind: QuotaErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::new(),
        }
    }
}

impl ReportableError for QuotaError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        // Violations and rejected configuration are user-facing outcomes,
        // not defects.
        !matches!(
            self.kind,
            QuotaErrorKind::Violation { .. }
                | QuotaErrorKind::Config(_)
                | QuotaErrorKind::MailboxTimeout
                | QuotaErrorKind::WorkerLimit(_)
        )
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            QuotaErrorKind::Violation { .. } => Some("quota.at_limit".to_owned()),
            QuotaErrorKind::Rpc(_) => Some("quota.rpc_failure".to_owned()),
            _ => None,
        }
    }
}

impl InternalError for QuotaError {
    fn internal_error(message: String) -> Self {
        QuotaErrorKind::Internal(message).into()
    }
}

impl_fmt_display!(QuotaError, QuotaErrorKind);

from_error!(DbError, QuotaError, QuotaErrorKind::Store);

pub type QuotaResult<T> = Result<T, QuotaError>;
