//! storage layer for treestate
//!
//! this module holds the persistence provider contract and its two
//! implementations. The state layers above use [`PersistentLayer`] and never
//! touch git2 directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PersistentLayer                         │
//! │       (read contract over any PersistenceProvider)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌─────────────┐               ┌─────────────┐
//!        │ MemoryStore │               │GitRepository│
//!        └─────────────┘               └─────────────┘
//!                                             │
//!        ┌─────────────────────┬──────────────┴──────┐
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │   record    │       │    refs     │
//!  │ (nodes dir) │       │ (node json) │       │   (main)    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │                     │                     │
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                        ┌─────────────┐
//!                        │   commit    │
//!                        │  (history)  │
//!                        └─────────────┘
//!  ```
//!
//! Both providers validate a batch with the same revision check before
//! applying any of it, so a stale batch leaves storage untouched.
//!
//! # Usage
//!
//! ```ignore
//! use treestate::storage::{GitRepository, PersistenceProvider};
//!
//! let repo = GitRepository::open_or_init("./my_workspace")?;
//! let root = repo.fetch_root()?;
//! let receipt = repo.submit(&log)?;
//! ```

mod commit;
mod error;
mod memory;
mod provider;
mod record;
mod refs;
mod repository;
mod tree;
mod types;

// Re-export public API
pub use commit::{CommitInfo, CommitMessage};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use provider::{PersistenceProvider, PersistentLayer, SubmitReceipt};
pub use record::{NodeRecord, PropertyRecord, WorkspaceRecord};
pub use repository::GitRepository;
pub use types::{BlobId, BranchName, CommitId, GitSignature, RecordPath, TreeId};
