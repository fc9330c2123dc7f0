//! Error types for the data-access layer.

use std::time::Duration;

use thiserror::Error;

use crate::batch::BatchReport;

/// Store operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures reported by a [`TableBackend`](crate::backend::TableBackend) client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Routine '{0}' is not deployed")]
    RoutineNotFound(String),

    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed backend payload: {0}")]
    Decode(String),
}

/// Errors surfaced by the executors and the record service.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A read failed. `params` is the rendered backend query, for diagnostics.
    #[error("Query '{query}' failed: {source}")]
    Query {
        query: String,
        params: String,
        source: BackendError,
    },

    /// An insert, update or delete failed.
    #[error("Write '{query}' failed: {source}")]
    Write { query: String, source: BackendError },

    /// A chunk of a batch write failed. Every chunk in `committed` stays written.
    #[error("Batch write '{query}' failed at chunk {failed_chunk}: {source}")]
    BatchWrite {
        query: String,
        failed_chunk: usize,
        committed: BatchReport,
        source: BackendError,
    },

    /// Both the routine and the raw-row aggregation failed.
    #[error("Aggregation '{query}' failed (routine: {primary}): {source}")]
    AggregationFallback {
        query: String,
        primary: BackendError,
        source: Box<StoreError>,
    },

    #[error("Row decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// The backend failure underneath, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Query { source, .. }
            | Self::Write { source, .. }
            | Self::BatchWrite { source, .. } => Some(source),
            Self::AggregationFallback { source, .. } => source.backend_error(),
            Self::Decode(_) | Self::InvalidInput(_) => None,
        }
    }
}
