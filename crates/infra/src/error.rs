//! Error taxonomy shared by the stores, handlers and the processor.
//!
//! - `PersistenceError`: the datastore is unavailable, rejected a write, or the target
//!   row is gone / in the wrong state. Aborts the current tick or operation.
//! - `HandlerError`: business failure inside a job handler. Caught per job and fed
//!   into the retry path.
//! - Terminal failures (attempts exhausted) are not errors at this level; they are a
//!   job outcome, see `jobs::processor::TerminalJobFailure`.

use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::types::{JobId, JobKind, JobStatus};

/// Datastore error returned by every store trait in this crate.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The row addressed by an update no longer exists.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A claim was attempted on a job that is not pending (someone else got it).
    #[error("job {id} cannot be claimed: status is {status}")]
    NotClaimable { id: JobId, status: JobStatus },

    /// An update would break the job status state machine.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The datastore could not be reached (pool closed, I/O, poisoned lock).
    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    /// The datastore rejected the operation (constraint violation, bad data).
    #[error("datastore rejected operation: {0}")]
    Rejected(String),

    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl PersistenceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn job_not_found(id: JobId) -> Self {
        Self::not_found("job", id)
    }

    /// The target row is gone or already moved on; callers treat this as handled.
    pub fn is_already_handled(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotClaimable { .. })
    }
}

/// Map a poisoned in-memory lock to a persistence failure.
pub(crate) fn poisoned<T>(_: PoisonError<T>) -> PersistenceError {
    PersistenceError::Unavailable("in-memory store lock poisoned".to_string())
}

/// Map SQLx errors to `PersistenceError`.
///
/// | SQLx error | Postgres code | result |
/// |---|---|---|
/// | Database (unique / check / fk violation) | `23xxx` | `Rejected` |
/// | Database (other) | any | `Rejected` |
/// | PoolClosed / PoolTimedOut / Io / Tls | n/a | `Unavailable` |
/// | RowNotFound | n/a | `NotFound` |
/// | anything else | n/a | `Rejected` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            PersistenceError::Rejected(format!(
                "database error in {operation} [{code}]: {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            PersistenceError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => PersistenceError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => {
            PersistenceError::Unavailable(format!("tls error in {operation}: {e}"))
        }
        sqlx::Error::RowNotFound => PersistenceError::not_found("row", operation),
        other => PersistenceError::Rejected(format!("{operation}: {other}")),
    }
}

/// Notification dispatch failure.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The delivery channel refused the notification.
    #[error("notification rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Failure inside a job handler. Always caught per job by the processor.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("invalid payload for {kind}: {message}")]
    InvalidPayload { kind: JobKind, message: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
