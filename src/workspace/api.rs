//! Workspace API - entry point for sessions over one persisted tree.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ulid::Ulid;

use crate::cache::{CacheStats, InvalidationSender, ItemStateCache};
use crate::changelog::{ChangeValidator, SaveCoordinator};
use crate::state::{NodeId, StateResult};
use crate::storage::{GitRepository, MemoryStore, PersistenceProvider, PersistentLayer, StorageError};
use crate::workspace::config::WorkspaceConfig;
use crate::workspace::session::Session;

/// Bookkeeping for a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// Shared handle to a workspace.
///
/// Thread-safe: clones share the cache, the save coordinator and the
/// session registry.
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

struct WorkspaceInner {
    config: WorkspaceConfig,
    provider: Arc<dyn PersistenceProvider>,
    cache: Arc<ItemStateCache>,
    coordinator: SaveCoordinator,
    root: NodeId,
    /// Live sessions tracked by ID.
    active: RwLock<HashMap<String, SessionInfo>>,
}

impl Workspace {
    /// Build a workspace over any provider.
    ///
    /// The cache subscribes to the provider's change feed.
    pub fn new(provider: Arc<dyn PersistenceProvider>, config: WorkspaceConfig) -> StateResult<Self> {
        let root = provider.fetch_root()?.id().clone();
        let cache = Arc::new(ItemStateCache::new(
            PersistentLayer::new(Arc::clone(&provider)),
            &config.cache,
        ));
        provider.subscribe(cache.invalidation_sender());
        let coordinator = SaveCoordinator::with_reference_checks(Arc::clone(&cache), config.check_references);

        tracing::info!(workspace = %config.name, %root, "workspace opened");
        Ok(Self {
            inner: Arc::new(WorkspaceInner {
                config,
                provider,
                cache,
                coordinator,
                root,
                active: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Open or create a git-backed workspace at `config.path`.
    pub fn open_git(config: WorkspaceConfig) -> StateResult<Self> {
        let repo = if config.create_if_missing {
            GitRepository::open_or_init(&config.path)?
        } else if config.path.exists() {
            GitRepository::open(&config.path)?
        } else {
            return Err(StorageError::NotInitialized(config.path.clone()).into());
        };
        Self::new(Arc::new(repo), config)
    }

    /// Workspace backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> StateResult<Self> {
        Self::new(Arc::new(MemoryStore::new()), WorkspaceConfig::default())
    }

    /// Register a validator run on every save.
    pub fn with_validator(self, validator: impl ChangeValidator + 'static) -> Self {
        self.inner.coordinator.add_validator(Arc::new(validator));
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.inner.config
    }

    pub fn root_id(&self) -> &NodeId {
        &self.inner.root
    }

    pub fn provider(&self) -> &Arc<dyn PersistenceProvider> {
        &self.inner.provider
    }

    pub fn cache(&self) -> &Arc<ItemStateCache> {
        &self.inner.cache
    }

    pub fn coordinator(&self) -> &SaveCoordinator {
        &self.inner.coordinator
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Feed for change events from outside this workspace's providers.
    pub fn invalidation_sender(&self) -> InvalidationSender {
        self.inner.cache.invalidation_sender()
    }

    /// Start a new tracked session.
    pub fn session(&self) -> Session {
        let info = SessionInfo {
            id: Ulid::new().to_string().to_lowercase(),
            started_at: Utc::now(),
        };
        self.inner.active.write().insert(info.id.clone(), info.clone());
        tracing::debug!(workspace = %self.inner.config.name, session = %info.id, "session started");
        Session::new(self.clone(), info.id)
    }

    /// Get the number of live sessions.
    pub fn active_count(&self) -> usize {
        self.inner.active.read().len()
    }

    /// Live sessions, oldest first.
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.inner.active.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Check if a session is live.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner.active.read().contains_key(session_id)
    }

    /// Called when a session is dropped.
    pub(crate) fn mark_completed(&self, session_id: &str) {
        self.inner.active.write().remove(session_id);
        tracing::debug!(workspace = %self.inner.config.name, session = %session_id, "session ended");
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.inner.config.name)
            .field("root", &self.inner.root)
            .field("active_count", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::changelog::ChangeLog;
    use crate::state::{ItemId, ItemStateManager, Name, NodeType, StateError, Value, Values};

    #[test]
    fn test_session_tracking() {
        let ws = Workspace::in_memory().unwrap();
        assert_eq!(ws.active_count(), 0);

        let s1 = ws.session();
        let s2 = ws.session();
        assert_eq!(ws.active_count(), 2);
        assert!(ws.is_active(s1.id()));
        assert_ne!(s1.id(), s2.id());

        let ids: Vec<_> = ws.active_sessions().into_iter().map(|s| s.id).collect();
        assert!(ids.contains(&s2.id().to_string()));

        drop(s1);
        assert_eq!(ws.active_count(), 1);
        drop(s2);
        assert_eq!(ws.active_count(), 0);
    }

    #[test]
    fn test_open_git_requires_store_unless_creating() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nothing");
        let err = Workspace::open_git(WorkspaceConfig::new(&missing).create_if_missing(false)).unwrap_err();
        assert!(matches!(err, StateError::ItemState(StorageError::NotInitialized(_))));
    }

    #[test]
    fn test_git_workspace_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = WorkspaceConfig::new(dir.path()).name("reopen");

        let child = {
            let ws = Workspace::open_git(config.clone()).unwrap();
            let mut session = ws.session();
            let root = ws.root_id().clone();
            let tmp = session
                .add_node(&root, Name::new("docs").unwrap(), NodeType::unstructured())
                .unwrap();
            session.add_property(&tmp, Name::new("title").unwrap(), Values::single("hello")).unwrap();
            session.save_all().unwrap().resolve(&tmp)
        };

        let ws = Workspace::open_git(config).unwrap();
        let session = ws.session();
        let node = session.node_state(&child).unwrap();
        assert_eq!(node.parent(), Some(ws.root_id()));
        assert!(node.has_property(&Name::new("title").unwrap()));
    }

    #[test]
    fn test_validator_runs_on_save() {
        let ws = Workspace::in_memory()
            .unwrap()
            .with_validator(|log: &ChangeLog| {
                if log.len() > 2 {
                    Err("too many changes".to_string())
                } else {
                    Ok(())
                }
            });
        let mut session = ws.session();
        let root = ws.root_id().clone();
        session.add_node(&root, Name::new("a").unwrap(), NodeType::unstructured()).unwrap();
        session.add_node(&root, Name::new("b").unwrap(), NodeType::unstructured()).unwrap();

        let err = session.save_all().unwrap_err();
        assert!(matches!(err, StateError::Validation(_)));
        assert!(session.has_pending_changes());
    }

    #[test]
    fn test_debug_output() {
        let ws = Workspace::in_memory().unwrap();
        let _session = ws.session();
        let debug = format!("{:?}", ws);
        assert!(debug.contains("active_count: 1"));
    }

    #[test]
    fn test_reference_checks_follow_config() {
        for check in [true, false] {
            let config = WorkspaceConfig::default().check_references(check);
            let ws = Workspace::new(Arc::new(MemoryStore::new()), config).unwrap();
            let root = ws.root_id().clone();
            let mut session = ws.session();
            let target = session
                .add_node(&root, Name::new("target").unwrap(), NodeType::unstructured())
                .unwrap();
            session
                .add_property(&root, Name::new("link").unwrap(), Values::single(Value::Reference(target.clone())))
                .unwrap();
            let target = session.save_all().unwrap().resolve(&target);

            session.remove_item(&ItemId::Node(target.clone())).unwrap();
            let result = session.save_all();
            assert_eq!(result.is_err(), check, "check_references = {}", check);
            if check {
                assert!(matches!(result, Err(StateError::ReferentialIntegrity { .. })));
            } else {
                assert!(!ws.cache().has_item_state(&ItemId::Node(target)));
            }
        }
    }
}
