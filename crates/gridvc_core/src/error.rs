use thiserror::Error;

/// Unified error type for gridvc operations.
#[derive(Debug, Error)]
pub enum GridvcError {
    /// The named branch does not exist for the given document.
    #[error("branch '{name}' not found for document '{doc_id}'")]
    BranchNotFound {
        /// Document the lookup ran against.
        doc_id: String,
        /// Branch name that was requested.
        name: String,
    },

    /// A branch with this name already exists for the given document.
    #[error("branch '{name}' already exists for document '{doc_id}'")]
    BranchExists {
        /// Document the branch belongs to.
        doc_id: String,
        /// Conflicting branch name.
        name: String,
    },

    /// A commit referenced by id is not present in storage.
    #[error("commit '{0}' not found")]
    CommitNotFound(String),

    /// The commit exists but its write was interrupted: required payload
    /// chunks are missing and no alternate readable payload is available.
    #[error("commit '{0}' is incomplete (write interrupted, not yet durable)")]
    CommitIncomplete(String),

    /// A store instance bound to one document was handed another document's id.
    #[error("store is bound to document '{expected}' but was given '{actual}'")]
    DocIdMismatch {
        /// Document id the store was constructed with.
        expected: String,
        /// Document id the caller passed.
        actual: String,
    },

    /// The document has no root commit and repair could not infer one.
    #[error("no root commit for document '{0}' and none could be inferred")]
    RootCommitMissing(String),

    /// Compression or payload decoding failed; propagated, never retried.
    #[error("payload encoding failure: {0}")]
    Encoding(String),

    /// SQLite error from the durable backend.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gridvc operations.
pub type Result<T> = std::result::Result<T, GridvcError>;
