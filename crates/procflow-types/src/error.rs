use thiserror::Error;

/// Errors from repository operations (used by trait definitions in procflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The store could not be reached (pool closed or timed out, I/O failure).
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from distributed lock backends.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the key and its lease has not expired.
    #[error("lock '{key}' is held by another operation")]
    Held { key: String },

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Errors from the user directory (principal lookup by role).
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory lookup failed: {0}")]
    Lookup(String),
}
