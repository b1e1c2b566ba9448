//! Error types for the meshwork endpoint store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during store operations.
///
/// `NotFound` is the one recoverable variant; everything else means the
/// backing database misbehaved and is surfaced to the caller unchanged.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// Single-record lookup missed, e.g. an instance id that is not (or no
    /// longer) registered. List operations return empty instead.
    #[error("not found: {0}")]
    NotFound(String),
}
