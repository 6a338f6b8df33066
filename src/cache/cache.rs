//! Shared cache of committed item states.
//!
//! The cache sits between every session's overlay and the persistent layer.
//! Entries are held weakly, with a bounded LRU of strong handles keeping the
//! recently used ones alive. External changes arrive on an `mpsc` channel and
//! are applied, in delivery order, at the start of every public read.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cache::events::{ChangeEvent, ChangeKind, InvalidationSender};
use crate::changelog::{ChangeLog, SaveOutcome};
use crate::state::{
    ItemId, ItemState, ItemStateManager, NodeId, NodeReferences, NodeState, PropertyId,
    ReferenceIndex, StateError, StateResult,
};
use crate::storage::PersistentLayer;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of recently used states kept alive without outside handles.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache Statistics:")?;
        writeln!(f, "  Entries: {}", self.entries)?;
        writeln!(f, "  Hits: {}", self.hits)?;
        writeln!(f, "  Misses: {}", self.misses)?;
        writeln!(f, "  Fetches: {}", self.fetches)?;
        writeln!(f, "  Invalidations: {}", self.invalidations)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct CacheInner {
    root: Option<NodeId>,
    items: HashMap<ItemId, Weak<ItemState>>,
    recent: LruCache<ItemId, Arc<ItemState>>,
    references: ReferenceIndex,
    /// targets known to have no references
    unreferenced: HashSet<NodeId>,
}

impl CacheInner {
    fn get(&mut self, id: &ItemId) -> Option<Arc<ItemState>> {
        let state = self.items.get(id)?.upgrade()?;
        self.recent.put(id.clone(), Arc::clone(&state));
        Some(state)
    }

    fn peek(&self, id: &ItemId) -> Option<Arc<ItemState>> {
        self.items.get(id).and_then(Weak::upgrade)
    }

    fn insert(&mut self, id: ItemId, state: Arc<ItemState>) {
        if self.items.len() > self.recent.cap().get() * 2 {
            self.items.retain(|_, weak| weak.strong_count() > 0);
        }
        self.items.insert(id.clone(), Arc::downgrade(&state));
        self.recent.put(id, state);
    }

    fn evict(&mut self, id: &ItemId) -> bool {
        self.recent.pop(id);
        self.items.remove(id).is_some()
    }

    /// Cached items whose parent (or owner) is `node`.
    fn cached_below(&self, node: &NodeId) -> Vec<Arc<ItemState>> {
        self.items
            .values()
            .filter_map(Weak::upgrade)
            .filter(|state| state.parent_id() == Some(node))
            .collect()
    }

    /// Evict a property and drop index entries it contributed to.
    fn evict_property(&mut self, property: &PropertyId) {
        self.evict(&ItemId::Property(property.clone()));
        self.references.forget_referrer(property);
    }

    /// Evict a node with every cached descendant and property.
    fn evict_subtree(&mut self, node: &NodeId) {
        for below in self.cached_below(node) {
            match below.as_ref() {
                ItemState::Node(child) => self.evict_subtree(child.id()),
                ItemState::Property(prop) => self.evict_property(prop.id()),
            }
        }
        self.references.forget_owner(node);
        self.evict(&ItemId::Node(node.clone()));
    }

    /// Evict a node and whatever below it is gone from `fresh`.
    fn revalidate(&mut self, fresh: &NodeState) {
        for below in self.cached_below(fresh.id()) {
            match below.as_ref() {
                ItemState::Node(child) if !fresh.children().contains(child.id()) => {
                    self.evict_subtree(child.id())
                }
                ItemState::Property(prop) if !fresh.has_property(prop.name()) => {
                    self.evict_property(prop.id())
                }
                _ => {}
            }
        }
        self.evict(&ItemId::Node(fresh.id().clone()));
    }

    /// Drop what is known about references to `target`.
    fn forget_target(&mut self, target: &NodeId) {
        self.references.forget_target(target);
        self.unreferenced.remove(target);
    }
}

/// Shared, invalidation-aware cache of committed item states.
///
/// Thread-safe; share it with `Arc`.
pub struct ItemStateCache {
    persistent: PersistentLayer,
    inner: RwLock<CacheInner>,
    events: Mutex<Receiver<ChangeEvent>>,
    sender: InvalidationSender,
    /// bumped on every invalidation; a fetch that overlapped one is not cached
    epoch: AtomicU64,
    counters: Counters,
}

impl ItemStateCache {
    pub fn new(persistent: PersistentLayer, config: &CacheConfig) -> Self {
        let (sender, receiver) = mpsc::channel();
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            persistent,
            inner: RwLock::new(CacheInner {
                root: None,
                items: HashMap::new(),
                recent: LruCache::new(capacity),
                references: ReferenceIndex::new(),
                unreferenced: HashSet::new(),
            }),
            events: Mutex::new(receiver),
            sender,
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// A feed for external change notifications.
    pub fn invalidation_sender(&self) -> InvalidationSender {
        self.sender.clone()
    }

    pub fn persistent(&self) -> &PersistentLayer {
        &self.persistent
    }

    /// Number of live cached states.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .items
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// check if `id` is cached right now, without fetching
    pub fn is_cached(&self, id: &ItemId) -> bool {
        self.drain_events();
        self.inner.read().peek(id).is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Invalidate `id` as if a `modified` event had been delivered for it.
    pub fn invalidate(&self, id: &ItemId) {
        self.drain_events();
        self.apply_event(&ChangeEvent::modified(id.clone()));
    }

    /// Drop every cached state and index entry.
    pub fn clear(&self) {
        self.drain_events();
        let mut inner = self.inner.write();
        inner.root = None;
        inner.items.clear();
        inner.recent.clear();
        inner.references.clear();
        inner.unreferenced.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("cache cleared");
    }

    /// Apply every pending change event, in delivery order.
    fn drain_events(&self) {
        let events = self.events.lock();
        while let Ok(event) = events.try_recv() {
            self.apply_event(&event);
        }
    }

    fn apply_event(&self, event: &ChangeEvent) {
        match (&event.id, event.kind) {
            (ItemId::Node(node), ChangeKind::Removed) => {
                let mut inner = self.inner.write();
                inner.evict_subtree(node);
                inner.forget_target(node);
                self.epoch.fetch_add(1, Ordering::SeqCst);
            }
            (ItemId::Node(node), _) => {
                let fresh = self.fetch_uncached(&event.id);
                let mut inner = self.inner.write();
                match fresh {
                    Ok(Some(ItemState::Node(fresh))) => inner.revalidate(&fresh),
                    Ok(_) => inner.evict_subtree(node),
                    Err(e) => {
                        tracing::debug!(%node, error = %e, "revalidation fetch failed, evicting subtree");
                        inner.evict_subtree(node);
                    }
                }
                self.epoch.fetch_add(1, Ordering::SeqCst);
            }
            (ItemId::Property(property), kind) => {
                let fresh = match kind {
                    ChangeKind::Removed => Ok(None),
                    _ => self.fetch_uncached(&event.id),
                };
                let mut inner = self.inner.write();
                inner.evict_property(property);
                if kind != ChangeKind::Modified {
                    // the owner's property names changed
                    inner.evict(&ItemId::Node(property.parent.clone()));
                }
                match fresh {
                    Ok(Some(ItemState::Property(now))) => {
                        for target in now.reference_targets() {
                            inner.forget_target(target);
                        }
                    }
                    Ok(_) => {}
                    Err(_) => inner.unreferenced.clear(),
                }
                self.epoch.fetch_add(1, Ordering::SeqCst);
            }
        }
        Counters::bump(&self.counters.invalidations);
        tracing::debug!(%event, "applied invalidation");
    }

    fn fetch_uncached(&self, id: &ItemId) -> StateResult<Option<ItemState>> {
        Counters::bump(&self.counters.fetches);
        Ok(self.persistent.provider().fetch_item(id)?)
    }

    /// Cache `state` unless an invalidation happened since `epoch`.
    fn populate(&self, id: ItemId, state: &Arc<ItemState>, epoch: u64) {
        let mut inner = self.inner.write();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(%id, "fetch overlapped an invalidation, not caching");
            return;
        }
        inner.insert(id, Arc::clone(state));
    }

    /// Install the post-commit baseline of a successful save.
    ///
    /// Validates the whole outcome before touching anything, so a failure
    /// leaves the cache as it was.
    pub fn apply_commit(&self, log: &ChangeLog, outcome: &SaveOutcome) -> StateResult<()> {
        let mut installs = Vec::new();
        let mut removals = Vec::new();

        for entry in log.entries() {
            let id = entry.id.remapped(&outcome.assigned);
            if id.is_transient() {
                return Err(StateError::InternalConsistency(format!(
                    "no permanent id assigned for {}",
                    entry.id
                )));
            }
            match entry.operation.state() {
                Some(mut state) => {
                    state.remap(&outcome.assigned);
                    let revision = outcome.revisions.get(&id).copied().ok_or_else(|| {
                        StateError::InternalConsistency(format!("no revision reported for {}", id))
                    })?;
                    installs.push((id, Arc::new(state.into_existing(revision))));
                }
                None => removals.push(id),
            }
        }

        self.drain_events();
        let mut inner = self.inner.write();
        for id in &removals {
            match id {
                ItemId::Node(node) => {
                    inner.evict_subtree(node);
                    inner.forget_target(node);
                }
                ItemId::Property(property) => inner.evict_property(property),
            }
        }
        for (id, state) in installs {
            if let ItemState::Property(property) = state.as_ref() {
                inner.references.forget_referrer(property.id());
                for target in property.reference_targets() {
                    inner.forget_target(target);
                }
            }
            inner.insert(id, state);
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(log = %log.id(), entries = log.len(), "cache installed commit baseline");
        Ok(())
    }
}

impl ItemStateManager for ItemStateCache {
    fn root_state(&self) -> StateResult<Arc<ItemState>> {
        self.drain_events();
        let root = self.inner.read().root.clone();
        if let Some(root) = root {
            return self.item_state(&ItemId::Node(root));
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        Counters::bump(&self.counters.fetches);
        let state = self.persistent.root_state()?;
        let id = state.id();
        if let ItemId::Node(root) = &id {
            self.inner.write().root = Some(root.clone());
        }
        self.populate(id, &state, epoch);
        Ok(state)
    }

    fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>> {
        self.drain_events();
        if let Some(state) = self.inner.write().get(id) {
            Counters::bump(&self.counters.hits);
            return Ok(state);
        }

        Counters::bump(&self.counters.misses);
        let epoch = self.epoch.load(Ordering::SeqCst);
        Counters::bump(&self.counters.fetches);
        let state = self.persistent.item_state(id)?;
        tracing::debug!(%id, "fetched item state");
        self.populate(id.clone(), &state, epoch);
        Ok(state)
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        self.drain_events();
        if self.inner.read().peek(id).is_some() {
            return true;
        }
        self.persistent.has_item_state(id)
    }

    fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        self.drain_events();
        {
            let inner = self.inner.read();
            if let Some(refs) = inner.references.references_to(target) {
                return Ok(refs.clone());
            }
            if inner.unreferenced.contains(target) {
                return Err(StateError::NoSuchItemState(ItemId::Node(target.clone())));
            }
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        Counters::bump(&self.counters.fetches);
        let fetched = self.persistent.node_references(target);

        let mut inner = self.inner.write();
        if self.epoch.load(Ordering::SeqCst) == epoch {
            match &fetched {
                Ok(refs) => inner.references.insert(refs.clone()),
                Err(StateError::NoSuchItemState(_)) => {
                    inner.unreferenced.insert(target.clone());
                }
                Err(_) => {}
            }
        }
        fetched
    }

    fn has_node_references(&self, target: &NodeId) -> bool {
        match self.node_references(target) {
            Ok(refs) => !refs.is_empty(),
            Err(StateError::NoSuchItemState(_)) => false,
            Err(e) => {
                tracing::warn!(%target, error = %e, "reference probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangeEntry, Operation};
    use crate::state::{Name, NodeType, PropertyState, Revision, Value, Values};
    use crate::storage::{MemoryStore, PersistenceProvider};

    fn setup() -> (Arc<MemoryStore>, ItemStateCache) {
        let store = Arc::new(MemoryStore::new());
        let cache = ItemStateCache::new(PersistentLayer::new(store.clone()), &CacheConfig::default());
        store.subscribe(cache.invalidation_sender());
        (store, cache)
    }

    /// Commit a child of the root with a reference back to the root.
    fn commit_child(store: &MemoryStore) -> (NodeId, PropertyId) {
        let root = store.fetch_root().unwrap();
        let mut child = NodeState::new(NodeId::transient(), Some(root.id().clone()), NodeType::unstructured());
        let tmp = child.id().clone();
        child.properties.insert(Name::new("link").unwrap());
        let mut updated = root.clone();
        updated.children.add(Name::new("c").unwrap(), tmp.clone());
        let link = PropertyState::new(
            PropertyId::new(tmp.clone(), Name::new("link").unwrap()),
            Values::single(Value::Reference(root.id().clone())),
        )
        .unwrap();

        let mut log = ChangeLog::new();
        log.push(ChangeEntry::new(root.id().clone().into(), Operation::UpdateNode(updated), root.revision()))
            .unwrap();
        log.push(ChangeEntry::new(tmp.clone().into(), Operation::AddNode(child), None)).unwrap();
        log.push(ChangeEntry::new(link.id().clone().into(), Operation::AddProperty(link), None))
            .unwrap();
        let receipt = store.submit(&log).unwrap();
        let id = receipt.assigned[&tmp].clone();
        (id.clone(), PropertyId::new(id, Name::new("link").unwrap()))
    }

    #[test]
    fn test_read_through_and_hit() {
        let (_store, cache) = setup();
        let root = cache.root_state().unwrap();
        let again = cache.item_state(&root.id()).unwrap();

        assert!(Arc::ptr_eq(&root, &again));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_missing_item_is_not_cached() {
        let (_store, cache) = setup();
        let id = ItemId::Node(NodeId::generate());

        assert!(cache.item_state(&id).unwrap_err().is_not_found());
        assert!(!cache.is_cached(&id));
        assert!(!cache.has_item_state(&id));
    }

    #[test]
    fn test_external_change_forces_refetch() {
        let (store, cache) = setup();
        let before = cache.root_state().unwrap();

        commit_child(&store);

        let after = cache.root_state().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.revision(), Some(Revision(2)));
        assert_eq!(before.revision(), Some(Revision::INITIAL));
        assert!(cache.stats().invalidations > 0);
    }

    #[test]
    fn test_node_removal_evicts_cached_subtree() {
        let (store, cache) = setup();
        let (child, link) = commit_child(&store);
        let _child_state = cache.item_state(&ItemId::Node(child.clone())).unwrap();
        let _link_state = cache.item_state(&ItemId::Property(link.clone())).unwrap();

        cache.apply_event(&ChangeEvent::removed(child.clone()));

        assert!(!cache.inner.read().items.contains_key(&ItemId::Node(child)));
        assert!(!cache.inner.read().items.contains_key(&ItemId::Property(link)));
    }

    #[test]
    fn test_references_follow_property_events() {
        let (store, cache) = setup();
        let root = store.root_id();
        assert!(!cache.has_node_references(&root));

        let (_child, link) = commit_child(&store);

        let refs = cache.node_references(&root).unwrap();
        assert!(refs.contains(&link));
        assert!(cache.has_node_references(&root));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let (_store, cache) = setup();
        let root = cache.root_state().unwrap().id();

        cache.invalidate(&root);
        cache.invalidate(&root);

        assert!(!cache.is_cached(&root));
        assert!(cache.item_state(&root).is_ok());
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_overlapping_fetch_not_cached() {
        let (_store, cache) = setup();
        let root = cache.root_state().unwrap().id();
        cache.clear();

        let epoch = cache.epoch.load(Ordering::SeqCst);
        let state = cache.persistent.item_state(&root).unwrap();
        cache.invalidate(&root);
        cache.populate(root.clone(), &state, epoch);

        assert!(!cache.is_cached(&root));
    }

    #[test]
    fn test_weak_retention_releases_after_lru() {
        let store = Arc::new(MemoryStore::new());
        let cache = ItemStateCache::new(PersistentLayer::new(store.clone()), &CacheConfig::default().with_capacity(1));
        let (child, _) = commit_child(&store);

        let root = cache.root_state().unwrap().id();
        let held = cache.item_state(&ItemId::Node(child.clone())).unwrap();

        // root fell out of the LRU and nobody holds it
        assert!(!cache.is_cached(&root));
        assert!(cache.is_cached(&ItemId::Node(child)));
        drop(held);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stats_display() {
        let (_store, cache) = setup();
        cache.root_state().unwrap();
        let text = cache.stats().to_string();
        assert!(text.contains("Fetches: 1"));
    }
}
