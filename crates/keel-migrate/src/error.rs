//! Error types for the migration engine.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while diffing, generating, or executing migrations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Column metadata cannot be rendered (bad type name, length, precision...).
    #[error("Invalid column specification for '{column}': {reason}")]
    InvalidColumnSpec {
        /// Column name.
        column: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The dialect cannot express the requested DDL change.
    #[error("{dialect} does not support {operation}: {reason}")]
    UnsupportedOperation {
        /// Dialect name.
        dialect: &'static str,
        /// Operation that was requested.
        operation: &'static str,
        /// The limitation, in plain words.
        reason: String,
    },

    /// No dialect (or no driver) is available for a database URL or type.
    #[error("Unsupported database: {0}")]
    UnsupportedDatabase(String),

    /// Another process holds the migration lock.
    #[error("Could not acquire migration lock '{lock}' within {timeout:?}")]
    LockAcquisitionFailed {
        /// Lock name.
        lock: String,
        /// How long we waited.
        timeout: Duration,
    },

    /// A single statement of a migration failed.
    #[error("Migration {version} failed on statement `{statement}`: {source}")]
    StatementExecutionFailed {
        /// Version of the failing migration.
        version: String,
        /// The statement that failed.
        statement: String,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// A migration failed and running its down statements failed too.
    #[error(
        "Migration {version} failed and rollback also failed; the database is in an \
         undefined state and requires manual intervention (original error: {original}; \
         rollback error: {rollback})"
    )]
    RollbackFailed {
        /// Version of the failing migration.
        version: String,
        /// The error that triggered the rollback.
        original: Box<MigrateError>,
        /// The error raised while rolling back.
        rollback: Box<MigrateError>,
    },

    /// A destructive change needs confirmation that was not given.
    #[error("Destructive change rejected: {message}")]
    DestructiveChangeRejected {
        /// Human-readable confirmation message of the change.
        message: String,
    },

    /// Database error outside of migration statements (ledger, lock, connect).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading/writing migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a migration file.
    #[error("Failed to parse migration file '{path}': {message}")]
    ParseError {
        /// Path to the migration file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Migration file already exists.
    #[error("Migration file already exists: {0}")]
    MigrationExists(PathBuf),

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// Migration not found (in the ledger or on disk).
    #[error("Migration not found: {0}")]
    MigrationNotFound(String),

    /// Invalid schema or ledger state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Illegal migration state transition.
    #[error("Illegal migration state transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },

    /// An applied migration's file no longer matches the ledger.
    #[error("Checksum mismatch for {version}: ledger has {expected}, file has {actual}")]
    ChecksumMismatch {
        /// Migration version.
        version: String,
        /// Checksum recorded in the ledger.
        expected: String,
        /// Checksum of the file on disk.
        actual: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    /// Shorthand for [`MigrateError::InvalidColumnSpec`].
    pub fn invalid_column(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidColumnSpec {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`MigrateError::UnsupportedOperation`].
    pub fn unsupported(
        dialect: &'static str,
        operation: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedOperation {
            dialect,
            operation,
            reason: reason.into(),
        }
    }

    /// Returns true for the one unrecoverable failure mode.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }

    /// Returns true if an operator must look at the database before retrying.
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::RollbackFailed { .. } | Self::ChecksumMismatch { .. }
        )
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_failure_is_the_only_fatal_error() {
        let err = MigrateError::RollbackFailed {
            version: "20240101000000".into(),
            original: Box::new(MigrateError::InvalidState("boom".into())),
            rollback: Box::new(MigrateError::InvalidState("boom again".into())),
        };
        assert!(err.is_fatal());
        assert!(err.requires_operator());
        assert!(err.to_string().contains("manual intervention"));

        let lock = MigrateError::LockAcquisitionFailed {
            lock: "schema_history".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(!lock.is_fatal());
        assert!(!lock.requires_operator());
    }

    #[test]
    fn unsupported_operation_names_limitation() {
        let err = MigrateError::unsupported("sqlite", "DROP COLUMN", "requires table rebuild");
        assert_eq!(
            err.to_string(),
            "sqlite does not support DROP COLUMN: requires table rebuild"
        );
    }
}
