//! Error types for store operations.

use std::fmt;

use thiserror::Error;

/// Structured classification of database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// The row collides with an existing unique or primary key.
    UniqueViolation,
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Any other constraint failure (foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// SQL protocol/driver error.
    Protocol,
    /// Stored data could not be turned back into a value.
    Decode,
    /// Unclassified database failure.
    Other,
}

impl DbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Decode,
            sqlx::Error::Database(database_error) => {
                if database_error.is_unique_violation() {
                    return Self::UniqueViolation;
                }
                classify_database_failure(
                    database_error.code().as_deref(),
                    database_error.message(),
                )
            }
            _ => Self::Other,
        }
    }

    /// Whether a save that failed with this kind hit an existing record.
    #[must_use]
    pub fn is_duplicate(self) -> bool {
        self == Self::UniqueViolation
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UniqueViolation => "unique_violation",
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Decode => "decode",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Classifies a database error from its code and message.
///
/// Drivers do not agree on how much structure they expose: some report the
/// extended result code, some only a symbolic name, some nothing but the
/// message text. All three shapes are accepted.
#[must_use]
pub fn classify_database_failure(code: Option<&str>, message: &str) -> DbErrorKind {
    match code {
        // SQLITE_CONSTRAINT_UNIQUE, SQLITE_CONSTRAINT_PRIMARYKEY
        Some("2067" | "1555" | "SQLITE_CONSTRAINT_UNIQUE" | "SQLITE_CONSTRAINT_PRIMARYKEY") => {
            return DbErrorKind::UniqueViolation;
        }
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6" | "517" | "262") => {
            return DbErrorKind::BusyOrLocked;
        }
        Some(value) if value.starts_with("SQLITE_CONSTRAINT") => {
            return DbErrorKind::ConstraintViolation;
        }
        // 19 is the primary SQLITE_CONSTRAINT code; the message tells which one
        _ => {}
    }

    let message = message.to_ascii_lowercase();
    if message.contains("unique constraint failed")
        || message.contains("primary key must be unique")
        || message.contains("duplicate key")
    {
        return DbErrorKind::UniqueViolation;
    }
    if message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
    {
        return DbErrorKind::BusyOrLocked;
    }
    if message.contains("constraint failed") {
        return DbErrorKind::ConstraintViolation;
    }

    DbErrorKind::Other
}

/// Failures saving or loading records of type `R`.
#[derive(Debug, Error)]
pub enum StoreError<R> {
    /// A record with the same identity is already stored. Carries the
    /// rejected record so the caller can decide what to do with it.
    #[error("record {key} already stored")]
    Duplicate { key: String, record: Box<R> },

    /// Any other failure; nothing was written.
    #[error("persistence failure ({kind}): {reason}")]
    Persistence { kind: DbErrorKind, reason: String },
}

impl<R> StoreError<R> {
    /// Maps a failed write into `Duplicate` or `Persistence`.
    #[must_use]
    pub fn from_save(error: &sqlx::Error, key: impl Into<String>, record: R) -> Self {
        let kind = DbErrorKind::from_sqlx(error);
        if kind.is_duplicate() {
            Self::Duplicate {
                key: key.into(),
                record: Box::new(record),
            }
        } else {
            Self::Persistence {
                kind,
                reason: error.to_string(),
            }
        }
    }

    #[must_use]
    pub fn persistence(kind: DbErrorKind, reason: impl Into<String>) -> Self {
        Self::Persistence {
            kind,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

impl<R> From<sqlx::Error> for StoreError<R> {
    fn from(error: sqlx::Error) -> Self {
        Self::Persistence {
            kind: DbErrorKind::from_sqlx(&error),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Structured codes ====================

    #[test]
    fn test_extended_unique_codes_are_duplicates() {
        assert_eq!(
            classify_database_failure(Some("2067"), "whatever"),
            DbErrorKind::UniqueViolation
        );
        assert_eq!(
            classify_database_failure(Some("1555"), "whatever"),
            DbErrorKind::UniqueViolation
        );
    }

    #[test]
    fn test_symbolic_codes_are_classified() {
        assert_eq!(
            classify_database_failure(Some("SQLITE_CONSTRAINT_PRIMARYKEY"), ""),
            DbErrorKind::UniqueViolation
        );
        assert_eq!(
            classify_database_failure(Some("SQLITE_BUSY"), ""),
            DbErrorKind::BusyOrLocked
        );
        assert_eq!(
            classify_database_failure(Some("SQLITE_CONSTRAINT_NOTNULL"), ""),
            DbErrorKind::ConstraintViolation
        );
    }

    // ==================== Message fallback ====================

    #[test]
    fn test_message_only_unique_failure_is_duplicate() {
        assert_eq!(
            classify_database_failure(
                None,
                "UNIQUE constraint failed: commands.topic, commands.created_at, commands.variant"
            ),
            DbErrorKind::UniqueViolation
        );
    }

    #[test]
    fn test_generic_constraint_code_falls_back_to_message() {
        assert_eq!(
            classify_database_failure(Some("19"), "UNIQUE constraint failed: videos.url"),
            DbErrorKind::UniqueViolation
        );
        assert_eq!(
            classify_database_failure(Some("19"), "NOT NULL constraint failed: videos.title"),
            DbErrorKind::ConstraintViolation
        );
    }

    #[test]
    fn test_locked_message_is_busy() {
        assert_eq!(
            classify_database_failure(None, "database is locked"),
            DbErrorKind::BusyOrLocked
        );
    }

    #[test]
    fn test_unknown_failure_is_other() {
        assert_eq!(
            classify_database_failure(None, "no such table: commands"),
            DbErrorKind::Other
        );
    }

    // ==================== StoreError ====================

    #[test]
    fn test_pool_timeout_is_persistence_not_duplicate() {
        let error: StoreError<()> = StoreError::from_save(&sqlx::Error::PoolTimedOut, "k", ());
        assert!(!error.is_duplicate());
        assert!(matches!(
            error,
            StoreError::Persistence {
                kind: DbErrorKind::PoolTimeout,
                ..
            }
        ));
    }

    #[test]
    fn test_store_error_display() {
        let error: StoreError<()> = StoreError::persistence(DbErrorKind::Io, "disk full");
        assert_eq!(error.to_string(), "persistence failure (io): disk full");
    }
}
