//! Error types for the ingestion path.
//!
//! Each variant corresponds to one stage of a snapshot's journey: the
//! stream transfer, decoding of the staged payload, and the merge into the
//! catalog. Duplicate rows are not errors; they are counted in
//! [`MergeSummary`](crate::merge::MergeSummary).

use thiserror::Error;

/// Result type for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// I/O failure, timeout or malformed header while receiving a transfer.
    #[error("connection error: {0}")]
    Connection(String),

    /// The staged payload is not a readable snapshot.
    #[error("decode error: {0}")]
    Decode(String),

    /// Storage failure while applying a batch. The batch was rolled back.
    #[error("merge error: {0}")]
    Merge(#[from] sqlx::Error),
}

impl IngestError {
    pub fn connection(context: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Connection(format!("{}: {}", context, err))
    }

    pub fn decode(context: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Decode(format!("{}: {}", context, err))
    }

    /// Returns true if the staging file should be kept for diagnosis.
    pub fn retains_artifact(&self) -> bool {
        matches!(self, IngestError::Decode(_) | IngestError::Merge(_))
    }
}
