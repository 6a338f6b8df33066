//! Session-local edits over the shared cache.
//!
//! ```text
//!   session edit ──► TransientOverlay ──(miss)──► ItemStateCache
//!                          │
//!                          └── save ──► ChangeLog ──► SaveCoordinator
//! ```
//!
//! An overlay is owned by exactly one session. Nothing it holds is visible
//! to other sessions until a save commits it.

#[allow(clippy::module_inception)]
mod overlay;

pub use overlay::TransientOverlay;
