//! Workspace configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;

/// Workspace configuration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Name used in log output.
    pub name: String,
    /// Directory of the git-backed store.
    pub path: PathBuf,
    /// Shared cache settings.
    pub cache: CacheConfig,
    /// Reject saves that would leave a strong reference dangling.
    ///
    /// On by default. With it off, removing a node that is still strongly
    /// referenced commits anyway and the reference dangles. References to
    /// unsaved nodes are rejected either way.
    pub check_references: bool,
    /// Initialize the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            path: PathBuf::from(".treestate"),
            cache: CacheConfig::default(),
            check_references: true,
            create_if_missing: true,
        }
    }
}

impl WorkspaceConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = self.cache.with_capacity(capacity);
        self
    }

    /// Set check_references flag.
    pub fn check_references(mut self, value: bool) -> Self {
        self.check_references = value;
        self
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }
}
