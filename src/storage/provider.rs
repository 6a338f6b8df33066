//! The persistence provider contract and the bottom read layer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cache::{ChangeEvent, InvalidationSender};
use crate::changelog::{ChangeLog, Operation};
use crate::state::{
    ItemId, ItemState, ItemStateManager, NodeId, NodeReferences, NodeState, Revision, StateError,
    StateResult,
};
use crate::storage::error::{StorageError, StorageResult};

/// What a provider returns for an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// transient node id -> permanent node id
    pub assigned: HashMap<NodeId, NodeId>,
    /// new revision of every written (non-removed) item, by permanent id
    pub revisions: HashMap<ItemId, Revision>,
}

/// Source of committed item state.
///
/// `submit` must apply every operation of the log or none of them.
pub trait PersistenceProvider: Send + Sync {
    fn fetch_root(&self) -> StorageResult<NodeState>;

    /// `Ok(None)` when the item does not exist.
    fn fetch_item(&self, id: &ItemId) -> StorageResult<Option<ItemState>>;

    /// `Ok(None)` when nothing references `target`.
    fn fetch_references(&self, target: &NodeId) -> StorageResult<Option<NodeReferences>>;

    fn submit(&self, log: &ChangeLog) -> StorageResult<SubmitReceipt>;

    /// Register a feed for change events of committed batches.
    fn subscribe(&self, _feed: InvalidationSender) {}
}

/// Adapts a provider to the read contract; a miss here does not exist.
#[derive(Clone)]
pub struct PersistentLayer {
    provider: Arc<dyn PersistenceProvider>,
}

impl PersistentLayer {
    pub fn new(provider: Arc<dyn PersistenceProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn PersistenceProvider> {
        &self.provider
    }

    /// Current persisted revision of `id`, `None` if it is gone.
    pub fn current_revision(&self, id: &ItemId) -> StateResult<Option<Revision>> {
        Ok(self.provider.fetch_item(id)?.and_then(|s| s.revision()))
    }
}

impl ItemStateManager for PersistentLayer {
    fn root_state(&self) -> StateResult<Arc<ItemState>> {
        Ok(Arc::new(ItemState::Node(self.provider.fetch_root()?)))
    }

    fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>> {
        match self.provider.fetch_item(id)? {
            Some(state) => Ok(Arc::new(state)),
            None => Err(StateError::NoSuchItemState(id.clone())),
        }
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        match self.provider.fetch_item(id) {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(%id, error = %e, "existence probe failed");
                false
            }
        }
    }

    fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        match self.provider.fetch_references(target)? {
            Some(refs) if !refs.is_empty() => Ok(refs),
            _ => Err(StateError::NoSuchItemState(ItemId::Node(target.clone()))),
        }
    }

    fn has_node_references(&self, target: &NodeId) -> bool {
        match self.provider.fetch_references(target) {
            Ok(found) => found.is_some_and(|r| !r.is_empty()),
            Err(e) => {
                tracing::warn!(%target, error = %e, "reference probe failed");
                false
            }
        }
    }
}

/// A validated batch, ready to be applied by a provider.
#[derive(Debug, Default)]
pub(crate) struct BatchPlan {
    /// permanent id -> new baseline, or `None` to delete
    pub writes: Vec<(ItemId, Option<ItemState>)>,
    pub receipt: SubmitReceipt,
    pub events: Vec<ChangeEvent>,
}

/// Validate `log` against the persisted revisions and compute its writes.
///
/// `current` reports the persisted revision of an item, `None` when absent.
/// Nothing is written here; the caller applies the plan only on success.
pub(crate) fn plan_batch<F>(log: &ChangeLog, mut current: F) -> StorageResult<BatchPlan>
where
    F: FnMut(&ItemId) -> StorageResult<Option<Revision>>,
{
    let mut plan = BatchPlan::default();

    for entry in log.entries() {
        if let Operation::AddNode(node) = &entry.operation {
            if node.id().is_transient() {
                plan.receipt.assigned.insert(node.id().clone(), NodeId::generate());
            }
        }
    }
    let assigned = &plan.receipt.assigned;

    let mut conflicts = Vec::new();
    for (id, base) in log.based_entries() {
        if current(id)? != Some(base) {
            conflicts.push(id.clone());
        }
    }
    if !conflicts.is_empty() {
        return Err(StorageError::ConcurrentModification { ids: conflicts });
    }

    let added: HashSet<NodeId> = log
        .added_nodes()
        .into_iter()
        .map(|id| assigned.get(id).unwrap_or(id).clone())
        .collect();
    let removed: HashSet<&NodeId> = log.removed_nodes();

    for entry in log.entries() {
        let id = entry.id.remapped(assigned);

        if entry.operation.is_add() {
            if current(&id)?.is_some() {
                return Err(StorageError::Rejected(format!("{} already exists", id)));
            }
            let parent = match &entry.operation {
                Operation::AddNode(node) => node.parent().cloned(),
                _ => Some(id.node_id().clone()),
            };
            if let Some(parent) = parent {
                let parent = assigned.get(&parent).unwrap_or(&parent).clone();
                let parent_exists =
                    added.contains(&parent) || current(&ItemId::Node(parent.clone()))?.is_some();
                if !parent_exists || removed.contains(&parent) {
                    return Err(StorageError::Rejected(format!(
                        "parent {} of {} does not exist",
                        parent, id
                    )));
                }
            }
        }

        let write = match entry.operation.state() {
            Some(mut state) => {
                state.remap(assigned);
                let revision = entry.base.map_or(Revision::INITIAL, Revision::next);
                plan.receipt.revisions.insert(id.clone(), revision);
                Some(state.into_existing(revision))
            }
            None => None,
        };

        plan.events.push(match &entry.operation {
            op if op.is_add() => ChangeEvent::added(id.clone()),
            op if op.is_removal() => ChangeEvent::removed(id.clone()),
            _ => ChangeEvent::modified(id.clone()),
        });
        plan.writes.push((id, write));
    }

    Ok(plan)
}
