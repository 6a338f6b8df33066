//! treestate - item state management for a hierarchical content workspace
//!
//! Committed node and property states are read through a shared cache;
//! each session layers its own uncommitted edits on top and commits them
//! as one atomic change log. Persistence is pluggable; a git-backed store
//! and an in-memory store are included.
//!
//! # Example
//!
//! ```no_run
//! use treestate::state::{ItemStateManager, Name, NodeType, Values};
//! use treestate::workspace::Workspace;
//!
//! let ws = Workspace::in_memory().unwrap();
//! let mut session = ws.session();
//! let root = ws.root_id().clone();
//! let a = session.add_node(&root, Name::new("a").unwrap(), NodeType::unstructured()).unwrap();
//! session.add_property(&a, Name::new("p").unwrap(), Values::single("x")).unwrap();
//! let a = session.save_all().unwrap().resolve(&a);
//! assert!(session.node_state(&a).unwrap().has_property(&Name::new("p").unwrap()));
//! ```

pub mod cache;
pub mod changelog;
pub mod overlay;
pub mod state;
pub mod storage;
pub mod workspace;
