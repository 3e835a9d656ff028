use std::fmt;

use backtrace::Backtrace;
use segquota_common::{from_error, impl_fmt_display, InternalError, ReportableError};
use thiserror::Error;

/// Errors arising from the persisted metadata store.
#[derive(Debug)]
pub struct DbError {
    pub(crate) kind: DbErrorKind,
    pub backtrace: Backtrace,
}

impl DbError {
    pub fn internal(msg: String) -> Self {
        DbErrorKind::Internal(msg).into()
    }

    /// The install-state row carried a value the code does not know about.
    pub fn bad_state(state: i32) -> Self {
        DbErrorKind::BadState(state).into()
    }

    pub fn is_bad_state(&self) -> bool {
        matches!(self.kind, DbErrorKind::BadState(_))
    }
}

#[derive(Debug, Error)]
pub(crate) enum DbErrorKind {
    #[error("A database error occurred: {}", _0)]
    DieselQuery(#[from] diesel::result::Error),

    #[error("An error occurred while establishing a db connection: {}", _0)]
    DieselConnection(#[from] diesel::result::ConnectionError),

    #[error("A database pool error occurred: {}", _0)]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Error migrating the database: {}", _0)]
    Migration(String),

    #[error("Unrecognized install state: {}", _0)]
    BadState(i32),

    #[error("Unexpected error: {}", _0)]
    Internal(String),
}

impl From<DbErrorKind> for DbError {
    fn from(kind: DbErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::new(),
        }
    }
}

impl ReportableError for DbError {
    fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    fn is_sentry_event(&self) -> bool {
        !matches!(self.kind, DbErrorKind::BadState(_))
    }

    fn metric_label(&self) -> Option<String> {
        match self.kind {
            DbErrorKind::Pool(_) => Some("storage.pool".to_owned()),
            DbErrorKind::Migration(_) => Some("storage.migration".to_owned()),
            _ => None,
        }
    }
}

impl InternalError for DbError {
    fn internal_error(message: String) -> Self {
        DbErrorKind::Internal(message).into()
    }
}

impl_fmt_display!(DbError, DbErrorKind);

from_error!(diesel::result::Error, DbError, DbErrorKind::DieselQuery);
from_error!(
    diesel::result::ConnectionError,
    DbError,
    DbErrorKind::DieselConnection
);
from_error!(diesel::r2d2::PoolError, DbError, DbErrorKind::Pool);
