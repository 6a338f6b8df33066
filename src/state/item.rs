//! Node and property states.
//!
//! Relationships between items (parent, children, properties, references)
//! are stored as identifiers and resolved through an `ItemStateManager`,
//! never as direct links, so arbitrary reference graphs stay representable.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::error::{StateError, StateResult};
use crate::state::id::{ItemId, Name, NodeId, PropertyId};
use crate::state::status::ItemStatus;
use crate::state::value::{Value, ValueKind, Values};

/// Revision marker assigned by the persistence provider.
///
/// Incremented on every committed change to the item; compared by the save
/// coordinator for optimistic concurrency control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Primary type plus mixins. Interpreted by validators outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeType {
    pub primary: Name,
    #[serde(default)]
    pub mixins: BTreeSet<Name>,
}

impl NodeType {
    pub fn new(primary: Name) -> Self {
        Self {
            primary,
            mixins: BTreeSet::new(),
        }
    }

    /// add a mixin type
    pub fn with_mixin(mut self, mixin: Name) -> Self {
        self.mixins.insert(mixin);
        self
    }

    /// `nt:unstructured`
    pub fn unstructured() -> Self {
        Self::new(Name::from_static("nt:unstructured"))
    }

    /// `rep:root`
    pub fn root() -> Self {
        Self::new(Name::from_static("rep:root"))
    }
}

/// One child node entry of a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: Name,
    pub id: NodeId,
}

/// Ordered child node entries. Same-name siblings keep their order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEntries {
    entries: Vec<ChildEntry>,
}

impl ChildEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(entries: Vec<ChildEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn entry(&self, id: &NodeId) -> Option<&ChildEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// 1-based same-name-sibling index of a child.
    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        let entry = self.entry(id)?;
        let position = self
            .entries
            .iter()
            .filter(|e| e.name == entry.name)
            .position(|e| &e.id == id)?;
        Some(position + 1)
    }

    /// Child with the given name and 1-based same-name-sibling index.
    pub fn get(&self, name: &Name, index: usize) -> Option<&NodeId> {
        self.entries
            .iter()
            .filter(|e| &e.name == name)
            .nth(index.checked_sub(1)?)
            .map(|e| &e.id)
    }

    pub(crate) fn add(&mut self, name: Name, id: NodeId) {
        self.entries.push(ChildEntry { name, id });
    }

    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<ChildEntry> {
        let pos = self.entries.iter().position(|e| &e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Move `id` in front of `before`, or to the end.
    ///
    /// Returns false if either child is unknown.
    pub(crate) fn reorder(&mut self, id: &NodeId, before: Option<&NodeId>) -> bool {
        if before.is_some_and(|b| !self.contains(b)) {
            return false;
        }
        let Some(entry) = self.remove(id) else {
            return false;
        };
        match before.and_then(|b| self.entries.iter().position(|e| &e.id == b)) {
            Some(pos) => self.entries.insert(pos, entry),
            None => self.entries.push(entry),
        }
        true
    }

    /// check if both lists hold the same children, ignoring order
    pub fn same_members(&self, other: &ChildEntries) -> bool {
        let ours: BTreeSet<_> = self.ids().collect();
        let theirs: BTreeSet<_> = other.ids().collect();
        ours == theirs
    }

    pub(crate) fn remap(&mut self, assigned: &HashMap<NodeId, NodeId>) {
        for entry in &mut self.entries {
            if let Some(permanent) = assigned.get(&entry.id) {
                entry.id = permanent.clone();
            }
        }
    }

    pub fn to_vec(&self) -> Vec<ChildEntry> {
        self.entries.clone()
    }
}

/// In-memory state of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) node_type: NodeType,
    pub(crate) children: ChildEntries,
    pub(crate) properties: BTreeSet<Name>,
    pub(crate) status: ItemStatus,
    pub(crate) revision: Option<Revision>,
}

impl NodeState {
    /// A fresh node with status `NEW`.
    pub fn new(id: NodeId, parent: Option<NodeId>, node_type: NodeType) -> Self {
        Self {
            id,
            parent,
            node_type,
            children: ChildEntries::new(),
            properties: BTreeSet::new(),
            status: ItemStatus::New,
            revision: None,
        }
    }

    /// Mark as matching the persisted baseline at `revision`.
    pub fn into_existing(mut self, revision: Revision) -> Self {
        self.status = ItemStatus::Existing;
        self.revision = Some(revision);
        self
    }

    pub fn with_children(mut self, children: ChildEntries) -> Self {
        self.children = children;
        self
    }

    pub fn with_properties(mut self, names: impl IntoIterator<Item = Name>) -> Self {
        self.properties = names.into_iter().collect();
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Parent node; `None` only for the root.
    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn node_type(&self) -> &NodeType {
        &self.node_type
    }

    pub fn children(&self) -> &ChildEntries {
        &self.children
    }

    pub fn property_names(&self) -> impl Iterator<Item = &Name> {
        self.properties.iter()
    }

    pub fn has_property(&self, name: &Name) -> bool {
        self.properties.contains(name)
    }

    /// Ids of every property of this node.
    pub fn property_ids(&self) -> Vec<PropertyId> {
        self.properties
            .iter()
            .map(|name| PropertyId::new(self.id.clone(), name.clone()))
            .collect()
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub(crate) fn remap(&mut self, assigned: &HashMap<NodeId, NodeId>) {
        if let Some(permanent) = assigned.get(&self.id) {
            self.id = permanent.clone();
        }
        if let Some(parent) = self.parent.as_mut() {
            if let Some(permanent) = assigned.get(parent) {
                *parent = permanent.clone();
            }
        }
        self.children.remap(assigned);
    }
}

/// In-memory state of one property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyState {
    pub(crate) id: PropertyId,
    pub(crate) kind: ValueKind,
    pub(crate) values: Vec<Value>,
    pub(crate) multiple: bool,
    pub(crate) status: ItemStatus,
    pub(crate) revision: Option<Revision>,
}

impl PropertyState {
    /// A fresh property with status `NEW`.
    ///
    /// Fails if a multi-valued input mixes value kinds.
    pub fn new(id: PropertyId, values: Values) -> StateResult<Self> {
        let kind = values.kind();
        let multiple = values.is_multiple();
        let values = values.into_vec();
        check_kinds(&id, kind, &values)?;
        Ok(Self {
            id,
            kind,
            values,
            multiple,
            status: ItemStatus::New,
            revision: None,
        })
    }

    /// Mark as matching the persisted baseline at `revision`.
    pub fn into_existing(mut self, revision: Revision) -> Self {
        self.status = ItemStatus::Existing;
        self.revision = Some(revision);
        self
    }

    pub fn id(&self) -> &PropertyId {
        &self.id
    }

    pub fn name(&self) -> &Name {
        &self.id.name
    }

    pub fn parent(&self) -> &NodeId {
        &self.id.parent
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The value of a single-valued property.
    pub fn value(&self) -> Option<&Value> {
        if self.multiple {
            None
        } else {
            self.values.first()
        }
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    /// Targets of every reference value, one per value.
    pub fn reference_targets(&self) -> Vec<&NodeId> {
        if !self.kind.is_reference() {
            return Vec::new();
        }
        self.values.iter().filter_map(Value::target).collect()
    }

    /// check if this property holds strong references
    pub fn is_strong_reference(&self) -> bool {
        self.kind == ValueKind::Reference
    }

    /// Replace the values, keeping kind and multiplicity.
    pub(crate) fn set_values(&mut self, values: Values) -> StateResult<()> {
        if values.is_multiple() != self.multiple {
            return Err(StateError::invalid(format!(
                "cannot change multiplicity of property {}",
                self.id
            )));
        }
        if values.kind() != self.kind {
            return Err(StateError::ValueKind {
                property: self.id.clone(),
                expected: self.kind,
                found: values.kind(),
            });
        }
        let values = values.into_vec();
        check_kinds(&self.id, self.kind, &values)?;
        self.values = values;
        Ok(())
    }

    pub(crate) fn remap(&mut self, assigned: &HashMap<NodeId, NodeId>) {
        if let Some(permanent) = assigned.get(&self.id.parent) {
            self.id.parent = permanent.clone();
        }
        for value in &mut self.values {
            value.remap(assigned);
        }
    }
}

fn check_kinds(id: &PropertyId, kind: ValueKind, values: &[Value]) -> StateResult<()> {
    match values.iter().find(|v| v.kind() != kind) {
        Some(bad) => Err(StateError::ValueKind {
            property: id.clone(),
            expected: kind,
            found: bad.kind(),
        }),
        None => Ok(()),
    }
}

/// State of a node or a property.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    Node(NodeState),
    Property(PropertyState),
}

impl ItemState {
    pub fn id(&self) -> ItemId {
        match self {
            ItemState::Node(n) => ItemId::Node(n.id.clone()),
            ItemState::Property(p) => ItemId::Property(p.id.clone()),
        }
    }

    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Node(n) => n.status,
            ItemState::Property(p) => p.status,
        }
    }

    pub fn revision(&self) -> Option<Revision> {
        match self {
            ItemState::Node(n) => n.revision,
            ItemState::Property(p) => p.revision,
        }
    }

    /// The parent node (owner for properties). `None` for the root.
    pub fn parent_id(&self) -> Option<&NodeId> {
        match self {
            ItemState::Node(n) => n.parent.as_ref(),
            ItemState::Property(p) => Some(&p.id.parent),
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, ItemState::Node(_))
    }

    pub fn as_node(&self) -> Option<&NodeState> {
        match self {
            ItemState::Node(n) => Some(n),
            ItemState::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyState> {
        match self {
            ItemState::Property(p) => Some(p),
            ItemState::Node(_) => None,
        }
    }

    pub(crate) fn as_node_mut(&mut self) -> Option<&mut NodeState> {
        match self {
            ItemState::Node(n) => Some(n),
            ItemState::Property(_) => None,
        }
    }

    pub(crate) fn as_property_mut(&mut self) -> Option<&mut PropertyState> {
        match self {
            ItemState::Property(p) => Some(p),
            ItemState::Node(_) => None,
        }
    }

    /// Move to `to`, checking the state machine.
    pub(crate) fn set_status(&mut self, to: ItemStatus) -> StateResult<()> {
        let from = self.status();
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                id: self.id(),
                from,
                to,
            });
        }
        match self {
            ItemState::Node(n) => n.status = to,
            ItemState::Property(p) => p.status = to,
        }
        Ok(())
    }

    /// A fresh persisted baseline of this state at `revision`.
    pub fn into_existing(self, revision: Revision) -> Self {
        match self {
            ItemState::Node(n) => ItemState::Node(n.into_existing(revision)),
            ItemState::Property(p) => ItemState::Property(p.into_existing(revision)),
        }
    }

    pub(crate) fn set_revision(&mut self, revision: Option<Revision>) {
        match self {
            ItemState::Node(n) => n.revision = revision,
            ItemState::Property(p) => p.revision = revision,
        }
    }

    /// Rewrite transient ids (own id, parent, children, reference values).
    pub(crate) fn remap(&mut self, assigned: &HashMap<NodeId, NodeId>) {
        match self {
            ItemState::Node(n) => n.remap(assigned),
            ItemState::Property(p) => p.remap(assigned),
        }
    }
}

impl From<NodeState> for ItemState {
    fn from(n: NodeState) -> Self {
        ItemState::Node(n)
    }
}

impl From<PropertyState> for ItemState {
    fn from(p: PropertyState) -> Self {
        ItemState::Property(p)
    }
}
