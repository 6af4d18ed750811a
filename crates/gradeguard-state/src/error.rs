//! Error types for gradeguard-state

use thiserror::Error;

/// Errors that can occur while opening or migrating a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Missing or malformed configuration
    #[error("Invalid store configuration: {0}")]
    Config(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by [`crate::GradebookStore`] operations.
///
/// Every variant is a persistence-level failure. `Conflict` and `Backend`
/// are transient: re-reading and re-submitting the request is safe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A record changed between read and commit.
    #[error("version conflict on {table}/{key}: expected {expected}, found {found}")]
    Conflict {
        table: String,
        key: String,
        expected: u64,
        found: u64,
    },

    /// A uniqueness constraint rejected the commit.
    #[error("unique constraint {constraint} violated for {key}")]
    UniqueViolation { constraint: String, key: String },

    /// An update referenced a record that does not exist.
    #[error("record not found: {table}/{key}")]
    MissingRecord { table: String, key: String },

    /// Row payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend I/O or query failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether re-reading state and retrying the request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Backend(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
