//! Per-session layer of local edits.
//!
//! The overlay holds every not-yet-committed change of one session and
//! shadows the shared cache with it. Local copies are made copy-on-write from
//! the cached baseline, so the cache itself is never touched by an edit.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cache::ItemStateCache;
use crate::changelog::{ChangeEntry, ChangeLog, Operation, SaveCoordinator, SaveOutcome};
use crate::state::{
    ItemId, ItemState, ItemStateManager, ItemStatus, Lookup, Name, NodeId, NodeReferences,
    NodeState, NodeType, PropertyId, PropertyState, ReferenceIndex, ReferenceKind, Revision,
    StateError, StateResult, Values,
};

/// One locally changed item.
#[derive(Debug, Clone)]
struct OverlayEntry {
    /// the local state; its status is never `Existing`
    state: Arc<ItemState>,
    /// the committed baseline the local state was copied from
    base: Option<Arc<ItemState>>,
}

impl OverlayEntry {
    fn status(&self) -> ItemStatus {
        self.state.status()
    }

    fn base_revision(&self) -> Option<Revision> {
        self.base.as_ref().and_then(|b| b.revision())
    }
}

/// Local, uncommitted edits of one session over the shared cache.
///
/// Owned and mutated by a single session; reads fall through to the cache
/// for anything not changed here.
pub struct TransientOverlay {
    cache: Arc<ItemStateCache>,
    entries: HashMap<ItemId, OverlayEntry>,
    /// reference values that exist only locally
    added_refs: ReferenceIndex,
    /// committed reference values that are gone locally
    removed_refs: ReferenceIndex,
    /// items of a closed, not yet finished change log
    in_flight: HashSet<ItemId>,
}

impl TransientOverlay {
    pub fn new(cache: Arc<ItemStateCache>) -> Self {
        Self {
            cache,
            entries: HashMap::new(),
            added_refs: ReferenceIndex::new(),
            removed_refs: ReferenceIndex::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn cache(&self) -> &Arc<ItemStateCache> {
        &self.cache
    }

    /// check if any local edit is pending
    pub fn has_pending_changes(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Every locally changed item with its status, ordered by id.
    pub fn pending(&self) -> Vec<(ItemId, ItemStatus)> {
        let mut pending: Vec<_> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status()))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        pending
    }

    /// Status of `id` in this session's view; `None` if it does not exist.
    pub fn status_of(&self, id: &ItemId) -> Option<ItemStatus> {
        match self.entries.get(id) {
            Some(entry) => Some(entry.status()),
            None if self.cache.has_item_state(id) => Some(ItemStatus::Existing),
            None => None,
        }
    }

    fn lookup(&self, id: &ItemId) -> Lookup<Arc<ItemState>> {
        match self.entries.get(id) {
            Some(entry) if entry.status().is_removed() => Lookup::Removed,
            other => Lookup::from_option(other.map(|entry| Arc::clone(&entry.state))),
        }
    }

    // ------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------

    /// Create a child node of `parent`. Returns its transient id.
    pub fn add_node(&mut self, parent: &NodeId, name: Name, node_type: NodeType) -> StateResult<NodeId> {
        let id = NodeId::transient();
        let parent_item = ItemId::Node(parent.clone());
        self.node_mut(&parent_item)?.children.add(name, id.clone());

        let node = NodeState::new(id.clone(), Some(parent.clone()), node_type);
        self.entries.insert(
            ItemId::Node(id.clone()),
            OverlayEntry {
                state: Arc::new(ItemState::Node(node)),
                base: None,
            },
        );
        tracing::debug!(%parent, node = %id, "added node");
        Ok(id)
    }

    /// Create a property on `parent`.
    pub fn add_property(&mut self, parent: &NodeId, name: Name, values: Values) -> StateResult<PropertyId> {
        let id = PropertyId::new(parent.clone(), name.clone());
        let item = ItemId::Property(id.clone());
        if self.has_item_state(&item) {
            return Err(StateError::ItemExists(item));
        }
        if self.entries.contains_key(&item) {
            return Err(StateError::invalid(format!(
                "property {} was removed in this session; save or refresh before re-creating it",
                id
            )));
        }

        let property = PropertyState::new(id.clone(), values)?;
        self.node_mut(&ItemId::Node(parent.clone()))?.properties.insert(name);
        self.entries.insert(
            item.clone(),
            OverlayEntry {
                state: Arc::new(ItemState::Property(property)),
                base: None,
            },
        );
        self.index(&item);
        tracing::debug!(property = %id, "added property");
        Ok(id)
    }

    /// Replace the values of a visible property.
    ///
    /// Kind and multiplicity must stay the same.
    pub fn set_property(&mut self, id: &PropertyId, values: Values) -> StateResult<()> {
        let mut updated = self.property_state(id)?;
        updated.set_values(values)?;

        let item = ItemId::Property(id.clone());
        self.modify(&item)?;
        self.unindex(&item);
        if let Some(property) = self.entries.get_mut(&item).and_then(|e| Arc::make_mut(&mut e.state).as_property_mut()) {
            property.values = updated.values;
        }
        self.index(&item);
        Ok(())
    }

    /// Remove a node with its whole subtree, or a single property.
    pub fn remove_item(&mut self, id: &ItemId) -> StateResult<()> {
        let state = self.item_state(id)?;
        let Some(parent) = state.parent_id().cloned() else {
            return Err(StateError::invalid("the root node cannot be removed"));
        };

        let mut doomed = Vec::new();
        match id {
            ItemId::Node(node) => self.collect_subtree(node, &mut doomed)?,
            ItemId::Property(_) => doomed.push(id.clone()),
        }
        for item in &doomed {
            self.check_editable(item)?;
            self.check_fresh(item)?;
        }

        // every fetch happens before the first mutation
        let mut bases = HashMap::new();
        for item in &doomed {
            if !self.entries.contains_key(item) {
                bases.insert(item.clone(), self.cache.item_state(item)?);
            }
        }

        let parent_node = self.node_mut(&ItemId::Node(parent))?;
        match id {
            ItemId::Node(node) => {
                parent_node.children.remove(node);
            }
            ItemId::Property(property) => {
                parent_node.properties.remove(&property.name);
            }
        }

        for item in &doomed {
            self.mark_removed(item, bases.remove(item))?;
        }
        tracing::debug!(%id, items = doomed.len(), "removed item");
        Ok(())
    }

    /// Move `child` in front of `before`, or to the end.
    pub fn reorder_children(&mut self, parent: &NodeId, child: &NodeId, before: Option<&NodeId>) -> StateResult<()> {
        let visible = self.node_state(parent)?;
        for id in std::iter::once(child).chain(before) {
            if !visible.children().contains(id) {
                return Err(StateError::NoSuchItemState(ItemId::Node(id.clone())));
            }
        }

        let node = self.node_mut(&ItemId::Node(parent.clone()))?;
        if !node.children.reorder(child, before) {
            return Err(StateError::InternalConsistency(format!(
                "child {} vanished from {} while reordering",
                child, parent
            )));
        }
        Ok(())
    }

    /// Reconcile local edits in the subtree of `id` with the cache.
    ///
    /// With `discard_local` every local edit in scope is dropped, stale ones
    /// included, and a removed `id` is listed in its parent again. Otherwise
    /// edits whose baseline moved become stale and nothing is overwritten.
    pub fn refresh(&mut self, id: &ItemId, discard_local: bool) -> StateResult<()> {
        if let Some(entry) = self.entries.get(id) {
            if entry.status() == ItemStatus::New {
                return Err(StateError::invalid(format!(
                    "{} was never saved; remove it instead of refreshing",
                    id
                )));
            }
        }

        let scope = self.scoped_ids(id);
        if let Some(busy) = scope.iter().find(|item| self.in_flight.contains(*item)) {
            return Err(StateError::invalid(format!("{} is part of a save in progress", busy)));
        }

        if discard_local {
            let ancestors = self.ancestors(id);
            if let Some(removed) = ancestors
                .iter()
                .find(|node| self.status_of(&ItemId::Node((*node).clone())) == Some(ItemStatus::ExistingRemoved))
            {
                return Err(StateError::invalid(format!(
                    "{} lies under the removed node {}; refresh that node instead",
                    id, removed
                )));
            }
            if let Some(parent) = ancestors.first() {
                let parent = ItemId::Node(parent.clone());
                if self.in_flight.contains(&parent) {
                    return Err(StateError::invalid(format!("{} is part of a save in progress", parent)));
                }
            }

            for item in &scope {
                self.unindex(item);
                self.entries.remove(item);
            }
            if let Some(parent) = ancestors.first() {
                self.restore_link(parent, id);
            }
            tracing::debug!(%id, dropped = scope.len(), "refresh discarded local edits");
            return Ok(());
        }

        let mut conflicts = 0;
        for item in &scope {
            let Some(entry) = self.entries.get(item) else {
                continue;
            };
            let Some(base) = entry.base_revision() else {
                continue;
            };
            if entry.status().is_stale() {
                continue;
            }
            match self.cache.item_state(item) {
                Ok(current) if current.revision() == Some(base) => {}
                Ok(_) => {
                    self.mark_stale(item, ItemStatus::StaleModified);
                    conflicts += 1;
                }
                Err(StateError::NoSuchItemState(_)) if entry.status().is_removed() => {
                    // removed on both sides
                    self.unindex(item);
                    self.entries.remove(item);
                }
                Err(StateError::NoSuchItemState(_)) => {
                    self.mark_stale(item, ItemStatus::StaleDestroyed);
                    conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(%id, conflicts, "refresh merged with committed state");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    /// Assemble and close the change log for the subtree under `root`.
    pub fn build_change_log(&mut self, root: &NodeId) -> StateResult<ChangeLog> {
        let root_item = ItemId::Node(root.clone());
        match self.entries.get(&root_item).map(OverlayEntry::status) {
            Some(ItemStatus::New) => {
                return Err(StateError::invalid(format!("{} is new; save its parent instead", root)))
            }
            Some(ItemStatus::ExistingRemoved) => {
                return Err(StateError::invalid(format!("{} is removed; save its parent instead", root)))
            }
            Some(_) => {}
            None => {
                self.cache.item_state(&root_item)?;
            }
        }

        let scope = self.scoped_ids(&root_item);
        let stale: Vec<ItemId> = scope
            .iter()
            .filter(|id| self.entries.get(*id).is_some_and(|e| e.status().is_stale()))
            .cloned()
            .collect();
        if !stale.is_empty() {
            return Err(StateError::PendingChanges { ids: stale });
        }
        if let Some(busy) = scope.iter().find(|id| self.in_flight.contains(*id)) {
            return Err(StateError::invalid(format!("{} is already part of a save in progress", busy)));
        }

        let mut nodes = Vec::new();
        let mut properties = Vec::new();
        let mut removals = Vec::new();
        for id in &scope {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            let depth = self.ancestors(id).len();
            let change = Self::change_for(id, entry);
            if change.operation.is_removal() {
                removals.push((depth, change));
            } else if id.is_node() {
                nodes.push((depth, change));
            } else {
                properties.push((depth, change));
            }
        }
        nodes.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));
        properties.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));
        removals.sort_by(|a, b| (Reverse(a.0), &a.1.id).cmp(&(Reverse(b.0), &b.1.id)));

        let mut log = ChangeLog::new();
        for (_, change) in nodes.into_iter().chain(properties).chain(removals) {
            log.push(change)?;
        }
        Self::check_unsaved_targets(&log)?;
        log.close()?;

        self.in_flight.extend(log.item_ids().cloned());
        tracing::debug!(log = %log.id(), %root, entries = log.len(), "built change log");
        Ok(log)
    }

    /// Reference values may only name new nodes that the same log adds.
    fn check_unsaved_targets(log: &ChangeLog) -> StateResult<()> {
        let added = log.added_nodes();
        for property in log.entries().iter().filter_map(|e| e.operation.property()) {
            if let Some(target) = property
                .reference_targets()
                .into_iter()
                .find(|target| target.is_transient() && !added.contains(target))
            {
                return Err(StateError::invalid(format!(
                    "{} references the unsaved node {}; save a subtree that contains both",
                    property.id(),
                    target
                )));
            }
        }
        Ok(())
    }

    fn change_for(id: &ItemId, entry: &OverlayEntry) -> ChangeEntry {
        let base = entry.base_revision();
        let operation = match (entry.state.as_ref(), entry.status()) {
            (ItemState::Node(node), ItemStatus::New) => Operation::AddNode(node.clone()),
            (ItemState::Property(property), ItemStatus::New) => Operation::AddProperty(property.clone()),
            (ItemState::Node(_), ItemStatus::ExistingRemoved) => Operation::RemoveNode,
            (ItemState::Property(_), ItemStatus::ExistingRemoved) => Operation::RemoveProperty,
            (ItemState::Node(node), _) => {
                let reordered = entry
                    .base
                    .as_ref()
                    .and_then(|b| b.as_node())
                    .is_some_and(|b| only_reordered(node, b));
                if reordered {
                    Operation::ReorderChildren(node.clone())
                } else {
                    Operation::UpdateNode(node.clone())
                }
            }
            (ItemState::Property(property), _) => Operation::ModifyProperty(property.clone()),
        };
        ChangeEntry::new(id.clone(), operation, base)
    }

    /// Promote the entries of a committed log.
    ///
    /// Remaining entries are rewritten to the permanent ids.
    pub fn complete_save(&mut self, log: &ChangeLog, outcome: &SaveOutcome) {
        for id in log.item_ids() {
            self.entries.remove(id);
            self.in_flight.remove(id);
        }

        if !outcome.assigned.is_empty() {
            let entries = std::mem::take(&mut self.entries);
            self.entries = entries
                .into_iter()
                .map(|(id, mut entry)| {
                    Arc::make_mut(&mut entry.state).remap(&outcome.assigned);
                    (id.remapped(&outcome.assigned), entry)
                })
                .collect();
            self.in_flight = std::mem::take(&mut self.in_flight)
                .into_iter()
                .map(|id| id.remapped(&outcome.assigned))
                .collect();
        }
        self.rebuild_deltas();
        tracing::debug!(log = %log.id(), remaining = self.entries.len(), "promoted saved entries");
    }

    /// Release a log that did not commit. Local edits stay.
    ///
    /// On a concurrent modification the conflicting items become stale.
    pub fn abort_save(&mut self, log: &ChangeLog, error: &StateError) {
        for id in log.item_ids() {
            self.in_flight.remove(id);
        }

        let StateError::ConcurrentModification { ids } = error else {
            return;
        };
        for id in ids {
            let Some(base) = self.entries.get(id).and_then(OverlayEntry::base_revision) else {
                continue;
            };
            match self.cache.item_state(id) {
                Ok(current) if current.revision() == Some(base) => {}
                Ok(_) => self.mark_stale(id, ItemStatus::StaleModified),
                Err(StateError::NoSuchItemState(_)) => self.mark_stale(id, ItemStatus::StaleDestroyed),
                Err(e) => tracing::warn!(%id, error = %e, "could not re-check conflicting item"),
            }
        }
    }

    /// Build, commit and promote the subtree under `root`.
    pub fn save(&mut self, root: &NodeId, coordinator: &SaveCoordinator) -> StateResult<SaveOutcome> {
        let mut log = self.build_change_log(root)?;
        if log.is_empty() {
            coordinator.abort(&mut log)?;
            return Ok(SaveOutcome::empty(log.id()));
        }

        match coordinator.commit(&mut log) {
            Ok(outcome) => {
                self.complete_save(&log, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.abort_save(&log, &e);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_editable(&self, id: &ItemId) -> StateResult<()> {
        if self.in_flight.contains(id) {
            return Err(StateError::invalid(format!("{} is part of a save in progress", id)));
        }
        match self.entries.get(id) {
            Some(entry) if entry.status().is_stale() => Err(StateError::PendingChanges { ids: vec![id.clone()] }),
            _ => Ok(()),
        }
    }

    /// Compare an already modified item with the cache before using it again.
    fn check_fresh(&mut self, id: &ItemId) -> StateResult<()> {
        let Some(base) = self.entries.get(id).and_then(OverlayEntry::base_revision) else {
            return Ok(());
        };
        let next = match self.cache.item_state(id) {
            Ok(current) if current.revision() == Some(base) => return Ok(()),
            Ok(_) => ItemStatus::StaleModified,
            Err(StateError::NoSuchItemState(_)) => ItemStatus::StaleDestroyed,
            Err(e) => return Err(e),
        };
        self.mark_stale(id, next);
        Err(StateError::ConcurrentModification { ids: vec![id.clone()] })
    }

    fn mark_stale(&mut self, id: &ItemId, status: ItemStatus) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if let Err(e) = Arc::make_mut(&mut entry.state).set_status(status) {
            tracing::debug!(%id, error = %e, "item already stale");
        } else {
            tracing::debug!(%id, %status, "item became stale");
        }
    }

    /// Local copy of a visible item, marked modified.
    fn modify(&mut self, id: &ItemId) -> StateResult<&mut ItemState> {
        self.check_editable(id)?;
        self.check_fresh(id)?;

        if !self.entries.contains_key(id) {
            let base = self.cache.item_state(id)?;
            self.entries.insert(
                id.clone(),
                OverlayEntry {
                    state: Arc::clone(&base),
                    base: Some(base),
                },
            );
        }
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| StateError::NoSuchItemState(id.clone()))?;
        if entry.status().is_removed() {
            return Err(StateError::NoSuchItemState(id.clone()));
        }

        let state = Arc::make_mut(&mut entry.state);
        if state.status() != ItemStatus::New {
            state.set_status(ItemStatus::ExistingModified)?;
        }
        Ok(state)
    }

    fn node_mut(&mut self, id: &ItemId) -> StateResult<&mut NodeState> {
        self.modify(id)?
            .as_node_mut()
            .ok_or_else(|| StateError::NoSuchItemState(id.clone()))
    }

    /// Drop a new item, or mark an existing one removed.
    ///
    /// `base` is the committed state of an item without a local entry.
    fn mark_removed(&mut self, id: &ItemId, base: Option<Arc<ItemState>>) -> StateResult<()> {
        self.unindex(id);
        if self.entries.get(id).is_some_and(|e| e.status() == ItemStatus::New) {
            self.entries.remove(id);
            return Ok(());
        }

        if let (false, Some(base)) = (self.entries.contains_key(id), base) {
            self.entries.insert(
                id.clone(),
                OverlayEntry {
                    state: Arc::clone(&base),
                    base: Some(base),
                },
            );
        }
        let result = match self.entries.get_mut(id) {
            Some(entry) => Arc::make_mut(&mut entry.state).set_status(ItemStatus::ExistingRemoved),
            None => Err(StateError::NoSuchItemState(id.clone())),
        };
        self.index(id);
        result
    }

    /// Re-list the committed item `id` in the local copy of `parent`.
    ///
    /// Undoes the unlink of a discarded removal. The parent entry is dropped
    /// once it matches its baseline again.
    fn restore_link(&mut self, parent: &NodeId, id: &ItemId) {
        let parent_item = ItemId::Node(parent.clone());
        let Some(entry) = self.entries.get_mut(&parent_item) else {
            return;
        };
        let Some(base) = entry.base.clone() else {
            return;
        };
        let (Some(local), Some(base)) = (Arc::make_mut(&mut entry.state).as_node_mut(), base.as_node()) else {
            return;
        };

        match id {
            ItemId::Node(node) => {
                let Some(committed) = base.children().entry(node) else {
                    return;
                };
                if local.children.contains(node) {
                    return;
                }
                // in front of the next committed sibling still listed locally
                let next = base
                    .children()
                    .ids()
                    .skip_while(|sibling| *sibling != node)
                    .skip(1)
                    .find(|sibling| local.children.contains(sibling))
                    .cloned();
                local.children.add(committed.name.clone(), node.clone());
                if next.is_some() {
                    local.children.reorder(node, next.as_ref());
                }
            }
            ItemId::Property(property) => {
                if !base.has_property(&property.name) || local.has_property(&property.name) {
                    return;
                }
                local.properties.insert(property.name.clone());
            }
        }
        tracing::debug!(%parent, %id, "restored link to discarded removal");

        let unchanged = local.status() == ItemStatus::ExistingModified
            && local.children() == base.children()
            && local.properties == base.properties
            && local.node_type() == base.node_type()
            && local.parent() == base.parent();
        if unchanged {
            self.entries.remove(&parent_item);
        }
    }

    /// Properties, then children, then the node itself.
    fn collect_subtree(&self, node: &NodeId, out: &mut Vec<ItemId>) -> StateResult<()> {
        let state = self.node_state(node)?;
        out.extend(state.property_ids().into_iter().map(ItemId::Property));
        for child in state.children().ids() {
            self.collect_subtree(child, out)?;
        }
        out.push(ItemId::Node(node.clone()));
        Ok(())
    }

    fn parent_of(&self, node: &NodeId) -> Option<NodeId> {
        let id = ItemId::Node(node.clone());
        match self.entries.get(&id) {
            Some(entry) => entry.state.parent_id().cloned(),
            None => self.cache.item_state(&id).ok()?.parent_id().cloned(),
        }
    }

    /// Ancestor node ids of `id`, nearest first.
    fn ancestors(&self, id: &ItemId) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut next = match id {
            ItemId::Node(node) => self.parent_of(node),
            ItemId::Property(property) => Some(property.parent.clone()),
        };
        while let Some(node) = next {
            if ancestors.contains(&node) {
                break;
            }
            next = self.parent_of(&node);
            ancestors.push(node);
        }
        ancestors
    }

    /// Local entries at or below `id`.
    fn scoped_ids(&self, id: &ItemId) -> Vec<ItemId> {
        let mut scope: Vec<ItemId> = match id {
            ItemId::Property(_) => self.entries.keys().filter(|item| *item == id).cloned().collect(),
            ItemId::Node(root) => self
                .entries
                .keys()
                .filter(|item| *item == id || self.ancestors(item).contains(root))
                .cloned()
                .collect(),
        };
        scope.sort();
        scope
    }

    /// Add the reference delta contributed by the entry of `id`.
    fn index(&mut self, id: &ItemId) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        if let Some(base) = entry.base.as_ref().and_then(|b| b.as_property()) {
            self.removed_refs.record_property(base);
        }
        let Some(local) = entry.state.as_property() else {
            return;
        };
        if local.status().is_removed() {
            return;
        }
        let Some(kind) = ReferenceKind::of(local.kind()) else {
            return;
        };
        for target in local.reference_targets() {
            if !self.removed_refs.remove_reference(local.id(), target) {
                self.added_refs.record_reference(local.id(), kind, target);
            }
        }
    }

    /// Undo [`Self::index`] for the entry of `id`.
    fn unindex(&mut self, id: &ItemId) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        if let Some(local) = entry.state.as_property() {
            if let (false, Some(kind)) = (local.status().is_removed(), ReferenceKind::of(local.kind())) {
                for target in local.reference_targets() {
                    if !self.added_refs.remove_reference(local.id(), target) {
                        self.removed_refs.record_reference(local.id(), kind, target);
                    }
                }
            }
        }
        if let Some(base) = entry.base.as_ref().and_then(|b| b.as_property()) {
            self.removed_refs.remove_property(base);
        }
    }

    fn rebuild_deltas(&mut self) {
        self.added_refs.clear();
        self.removed_refs.clear();
        let ids: Vec<ItemId> = self.entries.keys().cloned().collect();
        for id in &ids {
            self.index(id);
        }
    }
}

/// check if `local` differs from `base` only in child order
fn only_reordered(local: &NodeState, base: &NodeState) -> bool {
    local.children() != base.children()
        && local.children().same_members(base.children())
        && local.node_type() == base.node_type()
        && local.parent() == base.parent()
        && local.properties == base.properties
}

impl ItemStateManager for TransientOverlay {
    fn root_state(&self) -> StateResult<Arc<ItemState>> {
        let root = self.cache.root_state()?;
        match self.lookup(&root.id()) {
            Lookup::Found(local) => Ok(local),
            Lookup::NotHere => Ok(root),
            Lookup::Removed => Err(StateError::InternalConsistency("root node removed locally".to_string())),
        }
    }

    fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>> {
        match self.lookup(id) {
            Lookup::Found(state) => Ok(state),
            Lookup::Removed => Err(StateError::NoSuchItemState(id.clone())),
            Lookup::NotHere => self.cache.item_state(id),
        }
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        match self.lookup(id) {
            Lookup::Found(_) => true,
            Lookup::Removed => false,
            Lookup::NotHere => self.cache.has_item_state(id),
        }
    }

    fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        let committed = if target.is_transient() {
            NodeReferences::new(target.clone())
        } else {
            self.cache.references_or_empty(target)?
        };
        let merged = NodeReferences::merged(
            target,
            Some(&committed),
            self.removed_refs.references_to(target),
            self.added_refs.references_to(target),
        );
        if merged.is_empty() {
            Err(StateError::NoSuchItemState(ItemId::Node(target.clone())))
        } else {
            Ok(merged)
        }
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
