//! Change logs and the save coordinator.
//!
//! ```text
//!   OPEN ──close──► CLOSED ──► VALIDATING ──► COMMITTED
//!                     │            │
//!                     └────────────┴────────► ABORTED
//! ```
//!
//! A log is owned by one overlay while `Open`. The coordinator validates it,
//! submits it to the provider and installs the result in the shared cache.

mod coordinator;
mod log;

pub use coordinator::{ChangeValidator, SaveCoordinator, SaveOutcome};
pub use log::{ChangeEntry, ChangeLog, LogState, Operation};
