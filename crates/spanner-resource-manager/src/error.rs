//! This module implements [`enum ResourceManagerError`], the error type
//! returned by every operation of the resource manager.
//!
//! The variants fall in three groups:
//!
//! ```text
//! ResourceManagerError
//! ├─ InvalidState / InvalidConfiguration      (local, raised before any remote call)
//! ├─ MonitoringClientNotConfigured / Remote   (domain errors, remote cause attached)
//! └─ Transaction                              (remote transaction error, passed through as-is)
//! ```
//!
//! `Transaction` is deliberately not a wrapper: its `Display` and `source()`
//! are those of the original [`RemoteError`], so that callers can react to
//! transaction-specific codes such as `ABORTED`.

use crate::client::RemoteError;
use crate::manager::ResourceState;
use serde::{ser::SerializeStruct, Serialize, Serializer};
use std::backtrace::Backtrace;
use std::{borrow::Cow, error::Error as StdError, fmt, fmt::Display};

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResourceManagerError {
    /// Operation invoked outside the lifecycle state it requires.
    InvalidState {
        operation: &'static str,
        state: ResourceState,
    },
    InvalidConfiguration {
        reason: String,
    },
    MonitoringClientNotConfigured,
    /// A remote failure, wrapped with what the manager was doing at the time.
    #[serde(serialize_with = "serialize_remote_error")]
    Remote {
        context: String,
        error: RemoteError,
        backtrace: Backtrace,
    },
    /// A failure of a read-write transaction, unmodified.
    Transaction(RemoteError),
}

impl ResourceManagerError {
    pub fn invalid_state(operation: &'static str, state: ResourceState) -> Self {
        Self::InvalidState { operation, state }
    }

    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub fn remote(context: impl Into<String>, error: RemoteError) -> Self {
        Self::Remote {
            context: context.into(),
            error,
            backtrace: Backtrace::capture(),
        }
    }

    /// Identifying name of the error variant.
    pub fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidState { .. } => Cow::from("InvalidState"),
            Self::InvalidConfiguration { .. } => Cow::from("InvalidConfiguration"),
            Self::MonitoringClientNotConfigured => Cow::from("MonitoringClientNotConfigured"),
            Self::Remote { .. } => Cow::from("RemoteError"),
            Self::Transaction(_) => Cow::from("TransactionError"),
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// The remote error behind this one, wrapped or not.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote { error, .. } | Self::Transaction(error) => Some(error),
            _ => None,
        }
    }
}

fn serialize_remote_error<S>(
    context: &String,
    error: &RemoteError,
    backtrace: &Backtrace,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut ser = serializer.serialize_struct("RemoteError", 4)?;
    ser.serialize_field("context", &context)?;
    ser.serialize_field("code", &error.code())?;
    ser.serialize_field("message", error.message())?;
    ser.serialize_field("backtrace", &backtrace.to_string())?;
    ser.end()
}

impl Display for ResourceManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(
                    f,
                    "Cannot {operation}: the resource manager is {state}. \
                     Provision the database with a DDL statement first and do not use the manager after cleanup."
                )
            }
            Self::InvalidConfiguration { reason } => {
                write!(f, "Invalid resource manager configuration: {reason}")
            }
            Self::MonitoringClientNotConfigured => {
                write!(
                    f,
                    "Monitoring client is not initialized; configure one on the builder to collect metrics."
                )
            }
            Self::Remote { context, error, .. } => {
                write!(f, "{context}: {error}")
            }
            Self::Transaction(error) => Display::fmt(error, f),
        }
    }
}

impl StdError for ResourceManagerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Remote { error, .. } => Some(error),
            Self::Transaction(error) => error.source(),
            _ => None,
        }
    }
}
