//! In-process persistence provider.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::cache::{ChangeNotifier, InvalidationSender};
use crate::changelog::ChangeLog;
use crate::state::{
    ItemId, ItemState, NodeId, NodeReferences, NodeState, NodeType, ReferenceIndex, Revision,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::provider::{plan_batch, PersistenceProvider, SubmitReceipt};

/// A persistence provider that keeps the committed tree in memory.
///
/// Batches are validated completely before anything is applied, under one
/// write lock, so readers never observe half a batch. Change events are
/// published before that lock is released.
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    notifier: ChangeNotifier,
}

struct StoreInner {
    root: NodeId,
    items: HashMap<ItemId, ItemState>,
    references: ReferenceIndex,
    commits: u64,
}

impl MemoryStore {
    /// Create a store holding only a root node.
    pub fn new() -> Self {
        let root = NodeState::new(NodeId::generate(), None, NodeType::root()).into_existing(Revision::INITIAL);
        let root_id = root.id().clone();
        let mut items = HashMap::new();
        items.insert(ItemId::Node(root_id.clone()), ItemState::Node(root));

        Self {
            inner: RwLock::new(StoreInner {
                root: root_id,
                items,
                references: ReferenceIndex::new(),
                commits: 0,
            }),
            notifier: ChangeNotifier::new(),
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.inner.read().root.clone()
    }

    /// Number of persisted items, root included.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of accepted batches.
    pub fn commit_count(&self) -> u64 {
        self.inner.read().commits
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    fn revision_of(&self, id: &ItemId) -> Option<Revision> {
        self.items.get(id).and_then(ItemState::revision)
    }

    fn put(&mut self, id: ItemId, state: ItemState) {
        if let Some(ItemState::Property(old)) = self.items.get(&id) {
            self.references.remove_property(old);
        }
        if let ItemState::Property(p) = &state {
            self.references.record_property(p);
        }
        self.items.insert(id, state);
    }

    fn delete(&mut self, id: &ItemId) {
        match self.items.remove(id) {
            Some(ItemState::Property(p)) => self.references.remove_property(&p),
            Some(ItemState::Node(n)) => {
                for prop in n.property_ids() {
                    self.delete(&ItemId::Property(prop));
                }
            }
            None => {}
        }
    }
}

impl PersistenceProvider for MemoryStore {
    fn fetch_root(&self) -> StorageResult<NodeState> {
        let inner = self.inner.read();
        match inner.items.get(&ItemId::Node(inner.root.clone())) {
            Some(ItemState::Node(root)) => Ok(root.clone()),
            _ => Err(StorageError::Internal("root node missing".to_string())),
        }
    }

    fn fetch_item(&self, id: &ItemId) -> StorageResult<Option<ItemState>> {
        Ok(self.inner.read().items.get(id).cloned())
    }

    fn fetch_references(&self, target: &NodeId) -> StorageResult<Option<NodeReferences>> {
        Ok(self.inner.read().references.references_to(target).cloned())
    }

    fn submit(&self, log: &ChangeLog) -> StorageResult<SubmitReceipt> {
        let mut inner = self.inner.write();
        let plan = plan_batch(log, |id| Ok(inner.revision_of(id)))?;
        for (id, write) in &plan.writes {
            match write {
                Some(state) => inner.put(id.clone(), state.clone()),
                None => inner.delete(id),
            }
        }
        inner.commits += 1;

        // published under the write lock so feeds see batches in commit order
        self.notifier.publish(&plan.events);
        drop(inner);

        tracing::debug!(log = %log.id(), writes = plan.writes.len(), "memory store applied batch");
        Ok(plan.receipt)
    }

    fn subscribe(&self, feed: InvalidationSender) {
        self.notifier.subscribe(feed);
    }
}
