use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors opening the SQLite state database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock past the busy timeout
    #[error("State database is locked by another process")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify lock-related sqlx errors
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

/// Errors from a [`KeyValueStore`](super::KeyValueStore) backend.
///
/// These never cross the public boundary of the sync layer: the typed
/// [`PersistedStore`](super::PersistedStore) wrapper logs them and substitutes defaults.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
