//! Item states and everything they are built from.
//!
//! This module holds the leaf types of the crate: identifiers, typed values,
//! the status machine, node and property states, the reference index and the
//! [`ItemStateManager`] read contract every layer implements.
//!
//! # Layering
//!
//! ```text
//!  ┌──────────────────┐
//!  │ TransientOverlay │  local edits of one session
//!  └────────┬─────────┘
//!           │ miss
//!  ┌────────▼─────────┐
//!  │  ItemStateCache  │  shared committed snapshot
//!  └────────┬─────────┘
//!           │ miss
//!  ┌────────▼─────────┐
//!  │ PersistentLayer  │  provider adapter; miss here = NoSuchItemState
//!  └──────────────────┘
//! ```

mod error;
mod id;
mod item;
mod manager;
mod references;
mod status;
mod value;

pub use error::{InvalidNameError, StateError, StateResult};
pub use id::{ItemId, Name, NodeId, PropertyId};
pub use item::{ChildEntries, ChildEntry, ItemState, NodeState, NodeType, PropertyState, Revision};
pub use manager::ItemStateManager;
pub use references::{NodeReferences, ReferenceIndex, ReferenceKind};
pub use status::ItemStatus;
pub use value::{Value, ValueKind, Values};

pub(crate) use manager::Lookup;
