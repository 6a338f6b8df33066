//! Workspace and session API.
//!
//! A [`Workspace`] owns the shared pieces (provider, cache, save
//! coordinator) and hands out [`Session`]s. Each session edits through its
//! own overlay and commits with `save`.
//!
//! # Example
//!
//! ```no_run
//! use treestate::state::{Name, NodeType, Values};
//! use treestate::workspace::{Workspace, WorkspaceConfig};
//!
//! let ws = Workspace::open_git(WorkspaceConfig::new("./my_workspace")).unwrap();
//! let mut session = ws.session();
//! let root = ws.root_id().clone();
//! let docs = session.add_node(&root, Name::new("docs").unwrap(), NodeType::unstructured()).unwrap();
//! session.add_property(&docs, Name::new("title").unwrap(), Values::single("Hello")).unwrap();
//! let outcome = session.save_all().unwrap();
//! println!("docs is now {}", outcome.resolve(&docs));
//! ```

mod api;
mod config;
mod session;

pub use api::{SessionInfo, Workspace};
pub use config::WorkspaceConfig;
pub use session::Session;
