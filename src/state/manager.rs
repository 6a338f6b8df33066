//! The read contract shared by every layer.

use std::sync::Arc;

use crate::state::error::{StateError, StateResult};
use crate::state::id::{ItemId, NodeId, PropertyId};
use crate::state::item::{ItemState, NodeState, PropertyState};
use crate::state::references::NodeReferences;

/// Uniform read access to item states.
///
/// Implemented by the persistent layer, the cache and the transient overlay.
/// Layers compose by read-through; only a miss at the bottom layer surfaces
/// as [`StateError::NoSuchItemState`].
pub trait ItemStateManager {
    /// The node state of the workspace root.
    fn root_state(&self) -> StateResult<Arc<ItemState>>;

    /// The item state for `id`.
    fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>>;

    /// Existence probe. Never fails for ordinary absence.
    fn has_item_state(&self, id: &ItemId) -> bool;

    /// Every property referencing `target`.
    ///
    /// Fails with `NoSuchItemState` when nothing references the target.
    fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences>;

    fn has_node_references(&self, target: &NodeId) -> bool;

    /// The node state for `id`, cloned out of the shared handle.
    fn node_state(&self, id: &NodeId) -> StateResult<NodeState> {
        let item_id = ItemId::Node(id.clone());
        match self.item_state(&item_id)?.as_node() {
            Some(node) => Ok(node.clone()),
            None => Err(StateError::NoSuchItemState(item_id)),
        }
    }

    fn property_state(&self, id: &PropertyId) -> StateResult<PropertyState> {
        let item_id = ItemId::Property(id.clone());
        match self.item_state(&item_id)?.as_property() {
            Some(property) => Ok(property.clone()),
            None => Err(StateError::NoSuchItemState(item_id)),
        }
    }

    /// References to `target`, empty when there are none.
    fn references_or_empty(&self, target: &NodeId) -> StateResult<NodeReferences> {
        match self.node_references(target) {
            Err(StateError::NoSuchItemState(_)) => Ok(NodeReferences::new(target.clone())),
            other => other,
        }
    }
}

/// Result of a single layer's private lookup.
#[derive(Debug, Clone)]
pub(crate) enum Lookup<T> {
    Found(T),
    /// Not held by this layer; ask the next one.
    NotHere,
    /// Removed in this layer; do not fall through.
    Removed,
}

impl<T> Lookup<T> {
    pub(crate) fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotHere,
        }
    }
}

impl<M: ItemStateManager + ?Sized> ItemStateManager for Arc<M> {
    fn root_state(&self) -> StateResult<Arc<ItemState>> {
        (**self).root_state()
    }

    fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>> {
        (**self).item_state(id)
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        (**self).has_item_state(id)
    }

    fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        (**self).node_references(target)
    }

    fn has_node_references(&self, target: &NodeId) -> bool {
        (**self).has_node_references(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::state::id::Name;
    use crate::state::item::{NodeType, Revision};
    use crate::state::references::ReferenceKind;
    use crate::state::value::Values;

    /// Fixed map of states, for exercising the default helpers.
    struct Fixed {
        root: NodeId,
        items: HashMap<ItemId, Arc<ItemState>>,
        refs: HashMap<NodeId, NodeReferences>,
    }

    impl ItemStateManager for Fixed {
        fn root_state(&self) -> StateResult<Arc<ItemState>> {
            self.item_state(&ItemId::Node(self.root.clone()))
        }

        fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>> {
            self.items
                .get(id)
                .cloned()
                .ok_or_else(|| StateError::NoSuchItemState(id.clone()))
        }

        fn has_item_state(&self, id: &ItemId) -> bool {
            self.items.contains_key(id)
        }

        fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
            self.refs
                .get(target)
                .cloned()
                .ok_or_else(|| StateError::NoSuchItemState(ItemId::Node(target.clone())))
        }

        fn has_node_references(&self, target: &NodeId) -> bool {
            self.refs.contains_key(target)
        }
    }

    fn fixture() -> (Fixed, PropertyId) {
        let root = NodeId::generate();
        let prop_id = PropertyId::new(root.clone(), Name::new("title").unwrap());
        let node = NodeState::new(root.clone(), None, NodeType::root())
            .with_properties([prop_id.name.clone()])
            .into_existing(Revision::INITIAL);
        let prop = PropertyState::new(prop_id.clone(), Values::single("home"))
            .unwrap()
            .into_existing(Revision::INITIAL);

        let mut items = HashMap::new();
        items.insert(ItemId::Node(root.clone()), Arc::new(ItemState::from(node)));
        items.insert(ItemId::Property(prop_id.clone()), Arc::new(ItemState::from(prop)));
        (
            Fixed {
                root,
                items,
                refs: HashMap::new(),
            },
            prop_id,
        )
    }

    #[test]
    fn test_typed_helpers_check_variant() {
        let (fixed, prop_id) = fixture();
        let root = fixed.node_state(&fixed.root).unwrap();
        assert!(root.is_root());

        assert!(fixed.property_state(&prop_id).is_ok());
        let err = fixed.node_state(&NodeId::generate()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_missing_references_are_empty() {
        let (mut fixed, prop_id) = fixture();
        let target = NodeId::generate();
        assert!(fixed.node_references(&target).unwrap_err().is_not_found());
        assert!(fixed.references_or_empty(&target).unwrap().is_empty());

        let mut refs = NodeReferences::new(target.clone());
        refs.record(prop_id, ReferenceKind::Weak);
        fixed.refs.insert(target.clone(), refs);
        assert_eq!(fixed.references_or_empty(&target).unwrap().len(), 1);
    }

    #[test]
    fn test_arc_delegation() {
        let (fixed, _) = fixture();
        let shared: Arc<dyn ItemStateManager> = Arc::new(fixed);
        assert!(shared.root_state().unwrap().is_node());
    }
}
