//! The seam between the resource manager and Cloud Spanner.
//!
//! [`SpannerClient`] is the narrow set of control-plane and data-plane calls
//! the manager needs. Every call blocks until the remote side has finished,
//! including long-running admin operations, and reports failures as a
//! [`RemoteError`]. The production implementation is
//! [`rest::RestSpannerClient`]; tests use `fake::FakeSpannerClient`.

use crate::client::types::{
    DatabaseName, Dialect, InstanceConfig, InstanceName, KeySet, Mutation, Statement, Struct,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Display};
use thiserror::Error as ThisError;

#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod rest;
pub mod types;

/// Canonical status codes reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl ErrorCode {
    /// Maps a numeric gRPC status code, as found in long-running operation errors.
    pub fn from_grpc_code(code: i64) -> Self {
        match code {
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Maps the textual status of a JSON error body (`"RESOURCE_EXHAUSTED"`).
    pub fn from_status_name(status: &str) -> Option<Self> {
        Some(match status {
            "CANCELLED" => Self::Cancelled,
            "UNKNOWN" => Self::Unknown,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "NOT_FOUND" => Self::NotFound,
            "ALREADY_EXISTS" => Self::AlreadyExists,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "ABORTED" => Self::Aborted,
            "OUT_OF_RANGE" => Self::OutOfRange,
            "UNIMPLEMENTED" => Self::Unimplemented,
            "INTERNAL" => Self::Internal,
            "UNAVAILABLE" => Self::Unavailable,
            "DATA_LOSS" => Self::DataLoss,
            "UNAUTHENTICATED" => Self::Unauthenticated,
            _ => return None,
        })
    }

    /// Best-effort mapping of an HTTP status when the body carries no status name.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidArgument,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            409 => Self::AlreadyExists,
            429 => Self::ResourceExhausted,
            499 => Self::Cancelled,
            501 => Self::Unimplemented,
            503 => Self::Unavailable,
            504 => Self::DeadlineExceeded,
            500..=599 => Self::Internal,
            _ => Self::Unknown,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// Failure reported by (or while talking to) the remote service.
#[derive(ThisError, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    code: ErrorCode,
    message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `ABORTED` transactions may succeed when the whole transaction is re-run.
    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }
}

/// Operations available inside a read-write transaction.
pub trait TransactionContext {
    /// Buffers mutations to be applied atomically when the transaction commits.
    fn buffer(&mut self, mutations: &[Mutation]);

    /// Executes DML statements in order and returns the row count of each.
    fn batch_update(&mut self, statements: &[Statement]) -> Result<Vec<i64>, RemoteError>;
}

/// Body of a read-write transaction. May run more than once if the
/// transaction is aborted and retried by the client.
pub type TransactionWork<'a> =
    dyn FnMut(&mut dyn TransactionContext) -> Result<(), RemoteError> + 'a;

/// Cursor over the rows of a read.
pub trait ResultSet {
    /// Moves to the next row. Returns `false` once the rows are exhausted.
    fn next(&mut self) -> Result<bool, RemoteError>;

    /// Current row; only valid after `next()` returned `true`.
    fn current_row_as_struct(&self) -> Result<Struct, RemoteError>;
}

/// Remote control-plane and data-plane operations.
pub trait SpannerClient: Send {
    /// Creates an instance and waits for the operation to complete.
    fn create_instance(&self, instance: &InstanceConfig) -> Result<(), RemoteError>;

    fn delete_instance(&self, instance: &InstanceName) -> Result<(), RemoteError>;

    /// Creates an empty database and waits for the operation to complete.
    fn create_database(&self, database: &DatabaseName, dialect: Dialect)
        -> Result<(), RemoteError>;

    /// Applies DDL statements and waits until the schema change is done.
    fn update_database_ddl(
        &self,
        database: &DatabaseName,
        statements: &[String],
    ) -> Result<(), RemoteError>;

    fn drop_database(&self, database: &DatabaseName) -> Result<(), RemoteError>;

    /// Applies mutations atomically outside of an explicit transaction.
    fn write(
        &self,
        database: &DatabaseName,
        mutations: &[Mutation],
    ) -> Result<DateTime<Utc>, RemoteError>;

    /// Runs `work` in a read-write transaction and commits it.
    fn read_write_transaction(
        &self,
        database: &DatabaseName,
        work: &mut TransactionWork<'_>,
    ) -> Result<(), RemoteError>;

    /// Strongly consistent single-use read of `columns` for the rows in `key_set`.
    fn read(
        &self,
        database: &DatabaseName,
        table: &str,
        key_set: &KeySet,
        columns: &[String],
    ) -> Result<Box<dyn ResultSet>, RemoteError>;

    fn is_closed(&self) -> bool;

    /// Releases the client. No call may be issued afterwards.
    fn close(&mut self);
}

/// [`ResultSet`] over rows that are already in memory.
#[derive(Debug, Default)]
pub struct BufferedResultSet {
    rows: Vec<Struct>,
    position: Option<usize>,
}

impl BufferedResultSet {
    pub fn new(rows: Vec<Struct>) -> Self {
        Self {
            rows,
            position: None,
        }
    }
}

impl ResultSet for BufferedResultSet {
    fn next(&mut self) -> Result<bool, RemoteError> {
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next.min(self.rows.len()));
        Ok(next < self.rows.len())
    }

    fn current_row_as_struct(&self) -> Result<Struct, RemoteError> {
        self.position
            .and_then(|p| self.rows.get(p))
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(
                    ErrorCode::FailedPrecondition,
                    "result set is not positioned on a row",
                )
            })
    }
}
