//! Error types for the coordination store.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The addressed node does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

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
}

impl StateError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, StateError::NoNode(_))
    }
}
