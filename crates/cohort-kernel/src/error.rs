use thiserror::Error;

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Error, Debug)]
pub enum KernelError {
    /// A status change not present in the transition table.
    #[error("invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    /// The shared sentinel owner is only valid while a ticket is pending.
    #[error("ticket {id} cannot be {status} while owned by the shared sentinel")]
    InvalidOwner { id: String, status: String },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    /// The row changed underneath a conditional write, or a uniqueness rule refused it.
    #[error("{entity} conflict on {id}: {detail}")]
    Conflict {
        entity: &'static str,
        id: String,
        detail: String,
    },
    #[error("corrupt {column} value {value:?}")]
    Corrupt { column: &'static str, value: String },
    #[error("invalid occurrence id {0:?}")]
    InvalidOccurrence(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("join error: {0}")]
    Join(String),
}

impl KernelError {
    /// True for failures of the store itself (unreachable, locked, write failed),
    /// as opposed to rejected operations.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            KernelError::Sqlite(_) | KernelError::Io(_) | KernelError::Join(_)
        )
    }

    pub(crate) fn corrupt(column: &'static str, value: impl Into<String>) -> Self {
        KernelError::Corrupt {
            column,
            value: value.into(),
        }
    }
}

/// Map a UNIQUE/PRIMARY KEY violation into a typed conflict, pass everything else through.
pub(crate) fn conflict_or(err: rusqlite::Error, entity: &'static str, id: &str) -> KernelError {
    if let rusqlite::Error::SqliteFailure(code, ref msg) = err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return KernelError::Conflict {
                entity,
                id: id.to_string(),
                detail: msg.clone().unwrap_or_else(|| "constraint violation".into()),
            };
        }
    }
    KernelError::Sqlite(err)
}
