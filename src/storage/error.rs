//! Storage layer error types
//!
//! Every failure a persistence provider can report is defined here.
//! The item-state layers wrap these as `StateError::ItemState`.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::ItemId;

/// the main error type for persistence providers
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a persisted record failed an integrity check
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// repo is empty (no commits)
    #[error("repository is empty: no commits found")]
    EmptyRepository,

    /// the specified branch/ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// revisions moved under a submitted batch
    #[error("concurrent modification of {} item(s)", .ids.len())]
    ConcurrentModification { ids: Vec<ItemId> },

    /// the batch is structurally invalid for the current persisted tree
    #[error("submit rejected: {0}")]
    Rejected(String),

    /// the backend cannot be reached right now
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::ConcurrentModification { .. })
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentModification { .. } | StorageError::Unavailable(_)
        )
    }

    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::CorruptedData {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
