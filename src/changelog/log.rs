//! Change log: an ordered, closed batch of item operations.
//!
//! A log is assembled by one transient overlay while `Open`, then handed to
//! the save coordinator, which moves it through validation to `Committed`
//! or `Aborted`. Once closed it never changes.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::state::{
    ItemId, ItemState, NodeId, NodeState, PropertyId, PropertyState, Revision, StateError,
    StateResult,
};

/// Lifecycle of a change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogState {
    /// accepting operations
    Open,
    /// handed to the coordinator; immutable
    Closed,
    Validating,
    Committed,
    Aborted,
}

impl LogState {
    fn can_transition_to(self, to: LogState) -> bool {
        use LogState::*;

        matches!(
            (self, to),
            (Open, Closed) | (Closed, Validating) | (Closed, Aborted) | (Validating, Committed) | (Validating, Aborted)
        )
    }

    /// check if the log has reached a final state
    pub fn is_finished(&self) -> bool {
        matches!(self, LogState::Committed | LogState::Aborted)
    }
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogState::Open => "OPEN",
            LogState::Closed => "CLOSED",
            LogState::Validating => "VALIDATING",
            LogState::Committed => "COMMITTED",
            LogState::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

/// One operation in a change log, carrying the state to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    AddNode(NodeState),
    /// Node type, child set or property names changed.
    UpdateNode(NodeState),
    /// Only the order of an unchanged child set changed.
    ReorderChildren(NodeState),
    RemoveNode,
    AddProperty(PropertyState),
    ModifyProperty(PropertyState),
    RemoveProperty,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddNode(_) => "add-node",
            Operation::UpdateNode(_) => "update-node",
            Operation::ReorderChildren(_) => "reorder-children",
            Operation::RemoveNode => "remove-node",
            Operation::AddProperty(_) => "add-property",
            Operation::ModifyProperty(_) => "modify-property",
            Operation::RemoveProperty => "remove-property",
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Operation::AddNode(_) | Operation::AddProperty(_))
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Operation::RemoveNode | Operation::RemoveProperty)
    }

    /// The state written by this operation; `None` for removals.
    pub fn state(&self) -> Option<ItemState> {
        match self {
            Operation::AddNode(n) | Operation::UpdateNode(n) | Operation::ReorderChildren(n) => {
                Some(ItemState::Node(n.clone()))
            }
            Operation::AddProperty(p) | Operation::ModifyProperty(p) => {
                Some(ItemState::Property(p.clone()))
            }
            Operation::RemoveNode | Operation::RemoveProperty => None,
        }
    }

    pub fn node(&self) -> Option<&NodeState> {
        match self {
            Operation::AddNode(n) | Operation::UpdateNode(n) | Operation::ReorderChildren(n) => Some(n),
            _ => None,
        }
    }

    pub fn property(&self) -> Option<&PropertyState> {
        match self {
            Operation::AddProperty(p) | Operation::ModifyProperty(p) => Some(p),
            _ => None,
        }
    }
}

/// An identifier paired with its operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub id: ItemId,
    pub operation: Operation,
    /// Revision the change was based on; `None` for additions.
    pub base: Option<Revision>,
}

impl ChangeEntry {
    pub fn new(id: ItemId, operation: Operation, base: Option<Revision>) -> Self {
        Self { id, operation, base }
    }
}

impl fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            Some(base) => write!(f, "{} {}@{}", self.operation.name(), self.id, base),
            None => write!(f, "{} {}", self.operation.name(), self.id),
        }
    }
}

/// An ordered batch of changes submitted together.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    id: Ulid,
    created_at: DateTime<Utc>,
    state: LogState,
    entries: Vec<ChangeEntry>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self {
            id: Ulid::new(),
            created_at: Utc::now(),
            state: LogState::Open,
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an operation. Only allowed while `Open`.
    pub fn push(&mut self, entry: ChangeEntry) -> StateResult<()> {
        if self.state != LogState::Open {
            return Err(StateError::invalid(format!(
                "change log {} is {}, cannot add {}",
                self.id, self.state, entry
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &ItemId> {
        self.entries.iter().map(|e| &e.id)
    }

    /// Nodes this log removes.
    pub fn removed_nodes(&self) -> HashSet<&NodeId> {
        self.entries
            .iter()
            .filter_map(|e| match (&e.id, &e.operation) {
                (ItemId::Node(id), Operation::RemoveNode) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Nodes this log adds (transient ids).
    pub fn added_nodes(&self) -> HashSet<&NodeId> {
        self.entries
            .iter()
            .filter_map(|e| match &e.operation {
                Operation::AddNode(n) => Some(n.id()),
                _ => None,
            })
            .collect()
    }

    /// Properties this log removes.
    pub fn removed_properties(&self) -> BTreeSet<&PropertyId> {
        self.entries
            .iter()
            .filter_map(|e| match (&e.id, &e.operation) {
                (ItemId::Property(id), Operation::RemoveProperty) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Items that must still carry their base revision at submit time.
    pub fn based_entries(&self) -> impl Iterator<Item = (&ItemId, Revision)> {
        self.entries.iter().filter_map(|e| e.base.map(|b| (&e.id, b)))
    }

    fn transition(&mut self, to: LogState) -> StateResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(StateError::invalid(format!(
                "change log {} cannot move from {} to {}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn close(&mut self) -> StateResult<()> {
        self.transition(LogState::Closed)
    }

    pub(crate) fn begin_validation(&mut self) -> StateResult<()> {
        self.transition(LogState::Validating)
    }

    pub(crate) fn mark_committed(&mut self) -> StateResult<()> {
        self.transition(LogState::Committed)
    }

    pub(crate) fn mark_aborted(&mut self) -> StateResult<()> {
        self.transition(LogState::Aborted)
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}
