//! Item-state error types.
//!
//! Every failure reported by the cache, the overlay and the save coordinator
//! is a [`StateError`]. Provider failures are wrapped, never retried here.

use std::fmt;

use thiserror::Error;

use crate::state::id::{ItemId, NodeId, PropertyId};
use crate::state::status::ItemStatus;
use crate::state::value::ValueKind;
use crate::storage::StorageError;

/// Result type for item-state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the item-state layers.
#[derive(Debug, Error)]
pub enum StateError {
    /// The item does not exist in this layer's view.
    #[error("no such item state: {0}")]
    NoSuchItemState(ItemId),

    /// The persistence provider failed (transport, storage, corruption).
    #[error("item state error: {0}")]
    ItemState(#[from] StorageError),

    /// A strong reference would dangle after the save.
    #[error("referential integrity violated: {property} references {target}")]
    ReferentialIntegrity { target: NodeId, property: PropertyId },

    /// The persisted baseline moved since the items were read.
    #[error("concurrent modification of {}", ids_display(.ids))]
    ConcurrentModification { ids: Vec<ItemId> },

    /// Stale items are in scope and must be refreshed first.
    #[error("pending stale changes on {}", ids_display(.ids))]
    PendingChanges { ids: Vec<ItemId> },

    /// An injected validator rejected the change log.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A status change that the state machine does not allow.
    #[error("illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },

    /// The item already exists where it was about to be created.
    #[error("item already exists: {0}")]
    ItemExists(ItemId),

    /// Property values do not match the property's declared kind.
    #[error("value kind mismatch for {property}: expected {expected}, found {found}")]
    ValueKind {
        property: PropertyId,
        expected: ValueKind,
        found: ValueKind,
    },

    /// Invalid identifier or item name.
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// The operation is not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Bookkeeping failed after the provider accepted a commit.
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
}

fn ids_display(ids: &[ItemId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl StateError {
    /// check if this error means "does not exist here"
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NoSuchItemState(_))
    }

    /// Check if the caller may refresh and retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StateError::ConcurrentModification { .. } | StateError::PendingChanges { .. } => true,
            StateError::ItemState(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Partial completion after acceptance. Requires operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateError::InternalConsistency(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StateError::InvalidOperation(msg.into())
    }
}

/// error type for invalid identifiers and item names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
        }
    }
}

impl std::error::Error for InvalidNameError {}
