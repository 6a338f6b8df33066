//! Item state cache and external change notifications.
//!
//! ```text
//!   provider commit ──► ChangeNotifier ──► mpsc feed ──┐
//!                                                      ▼
//!   overlay read ──► ItemStateCache (weak map + LRU) ──► PersistentLayer
//!                          │
//!                          └── ReferenceIndex (lazily fetched entries)
//! ```
//!
//! The cache is shared by every session of a workspace. Invalidations queued
//! on the feed are applied before any read, so a read that starts after an
//! event was delivered never returns the pre-event state.

#[allow(clippy::module_inception)]
mod cache;
mod events;

pub use cache::{CacheConfig, CacheStats, ItemStateCache};
pub use events::{ChangeEvent, ChangeKind, ChangeNotifier, InvalidationSender};
