//! Error types for the simile engine.

use thiserror::Error;

/// Result type alias using SimileError.
pub type Result<T> = std::result::Result<T, SimileError>;

/// Errors that can occur in simile operations.
#[derive(Debug, Error)]
pub enum SimileError {
    // Storage errors
    #[error("tuple not found: {0}")]
    TupleNotFound(String),

    #[error("page full, unable to insert tuple")]
    PageFull,

    #[error("buffer pool full: {0}")]
    BufferPoolFull(String),

    #[error("malformed data: {0}")]
    MalformedData(String),

    // Type errors
    #[error("incompatible types: {0}")]
    IncompatibleTypes(String),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // Catalog errors
    #[error("parse error: {0}")]
    Parse(String),

    #[error("table already exists: {0}")]
    DuplicateTable(String),

    #[error("no table named: {0}")]
    NoSuchTable(String),

    #[error("ambiguous name: {0}")]
    AmbiguousName(String),

    // Transaction errors
    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("deadlock detected")]
    Deadlock,

    #[error("illegal transaction: {0}")]
    IllegalTransaction(String),

    // Index errors
    #[error("embedding generation failed: {0}")]
    FailedEmbedding(String),

    #[error("unknown cluster: {0}")]
    UnknownCluster(i64),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
