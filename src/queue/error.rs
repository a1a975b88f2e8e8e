//! Error types for job store operations.

use std::fmt;

use thiserror::Error;

use super::JobStatus;

/// Structured classification for store/database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// SQL protocol/driver error.
    Protocol,
    /// Stored value could not be decoded.
    Decode,
    /// Unclassified database failure.
    Other,
}

impl QueueDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Decode,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for QueueDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Decode => "decode",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> QueueDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return QueueDbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT") || value == "275")
    {
        return QueueDbErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
    {
        return QueueDbErrorKind::BusyOrLocked;
    }

    QueueDbErrorKind::Other
}

/// Errors that can occur during job store operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification used for transient/fatal decisions.
        kind: QueueDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// No record matches the id, or the record is not in a state the
    /// operation applies to (priority changes require `queued`).
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A priority value was not an integer.
    #[error("invalid priority for job {id}: '{value}' is not an integer")]
    InvalidPriority {
        /// Job the priority was supplied for.
        id: String,
        /// The rejected raw value.
        value: String,
    },

    /// The requested status change is not a legal transition.
    #[error("invalid transition for job {id}: cannot move to '{to}' via this operation")]
    InvalidTransition {
        /// Job the transition was requested for.
        id: String,
        /// Requested target status.
        to: JobStatus,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: QueueDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl QueueError {
    /// Creates an `InvalidPriority` error for a raw value.
    #[must_use]
    pub fn invalid_priority(id: &str, value: impl fmt::Display) -> Self {
        Self::InvalidPriority {
            id: id.to_string(),
            value: value.to_string(),
        }
    }

    /// Creates a `Database` error for a stored value that cannot be decoded.
    #[must_use]
    pub fn corrupt_row(id: &str, detail: impl fmt::Display) -> Self {
        Self::Database {
            kind: QueueDbErrorKind::Decode,
            message: format!("job {id}: {detail}"),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<QueueDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::JobNotFound(_) | Self::InvalidPriority { .. } | Self::InvalidTransition { .. } => {
                None
            }
        }
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(QueueDbErrorKind::BusyOrLocked)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_database_message() {
        let err = QueueError::Database {
            kind: QueueDbErrorKind::Other,
            message: "connection failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("database error"));
        assert!(msg.contains("other"));
        assert!(msg.contains("connection failed"));
    }

    #[test]
    fn test_queue_error_database_busy_flag() {
        let err = QueueError::Database {
            kind: QueueDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert_eq!(err.database_kind(), Some(QueueDbErrorKind::BusyOrLocked));
        assert!(err.is_busy_or_locked());
    }

    #[test]
    fn test_queue_error_job_not_found_message() {
        let err = QueueError::JobNotFound("md5abc".to_string());
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("md5abc"));
        assert_eq!(err.database_kind(), None);
    }

    #[test]
    fn test_queue_error_invalid_priority_message() {
        let err = QueueError::invalid_priority("book-1", "high");
        let msg = err.to_string();
        assert!(msg.contains("book-1"));
        assert!(msg.contains("'high'"));
        assert!(!err.is_busy_or_locked());
    }

    #[test]
    fn test_queue_error_invalid_transition_names_target() {
        let err = QueueError::InvalidTransition {
            id: "x".to_string(),
            to: JobStatus::Available,
        };
        assert!(err.to_string().contains("available"));
    }

    #[test]
    fn test_corrupt_row_is_decode_error() {
        let err = QueueError::corrupt_row("a", "invalid job status: paused");
        assert_eq!(err.database_kind(), Some(QueueDbErrorKind::Decode));
        assert!(!err.is_busy_or_locked());
        assert!(err.to_string().contains("paused"));
    }

    #[test]
    fn test_pool_closed_classification() {
        let kind = QueueDbErrorKind::from_sqlx(&sqlx::Error::PoolClosed);
        assert_eq!(kind, QueueDbErrorKind::PoolClosed);
        assert_eq!(kind.to_string(), "pool_closed");
    }
}
