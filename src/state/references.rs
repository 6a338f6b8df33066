//! Node reference index.
//!
//! Reverse index from a referenced node to the reference-typed properties
//! pointing at it. Multi-valued properties contribute one entry per value,
//! so the index is a multiset keyed by property.

use std::collections::{BTreeMap, HashMap};

use crate::state::id::{NodeId, PropertyId};
use crate::state::item::PropertyState;
use crate::state::value::ValueKind;

/// Strength of a reference. Strong references require the target to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Strong,
    Weak,
}

impl ReferenceKind {
    pub fn of(kind: ValueKind) -> Option<Self> {
        match kind {
            ValueKind::Reference => Some(ReferenceKind::Strong),
            ValueKind::WeakReference => Some(ReferenceKind::Weak),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Referrer {
    kind: ReferenceKind,
    count: usize,
}

/// Every property referencing one target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReferences {
    target: NodeId,
    referrers: BTreeMap<PropertyId, Referrer>,
}

impl NodeReferences {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            referrers: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// check if nothing references the target
    pub fn is_empty(&self) -> bool {
        self.referrers.is_empty()
    }

    /// Number of distinct referencing properties.
    pub fn len(&self) -> usize {
        self.referrers.len()
    }

    pub fn contains(&self, property: &PropertyId) -> bool {
        self.referrers.contains_key(property)
    }

    /// Number of values in `property` pointing at the target.
    pub fn count(&self, property: &PropertyId) -> usize {
        self.referrers.get(property).map_or(0, |r| r.count)
    }

    pub fn kind_of(&self, property: &PropertyId) -> Option<ReferenceKind> {
        self.referrers.get(property).map(|r| r.kind)
    }

    pub fn property_ids(&self) -> impl Iterator<Item = &PropertyId> {
        self.referrers.keys()
    }

    /// Properties holding strong references to the target.
    pub fn strong(&self) -> impl Iterator<Item = &PropertyId> {
        self.referrers
            .iter()
            .filter(|(_, r)| r.kind == ReferenceKind::Strong)
            .map(|(id, _)| id)
    }

    pub fn weak(&self) -> impl Iterator<Item = &PropertyId> {
        self.referrers
            .iter()
            .filter(|(_, r)| r.kind == ReferenceKind::Weak)
            .map(|(id, _)| id)
    }

    pub fn record(&mut self, property: PropertyId, kind: ReferenceKind) {
        self.referrers
            .entry(property)
            .and_modify(|r| r.count += 1)
            .or_insert(Referrer { kind, count: 1 });
    }

    /// Drop one value's worth of reference. Returns false if none was recorded.
    pub fn remove(&mut self, property: &PropertyId) -> bool {
        match self.referrers.get_mut(property) {
            Some(r) if r.count > 1 => {
                r.count -= 1;
                true
            }
            Some(_) => {
                self.referrers.remove(property);
                true
            }
            None => false,
        }
    }

    /// Committed references with local removals and additions applied.
    pub fn merged(
        target: &NodeId,
        base: Option<&NodeReferences>,
        removed: Option<&NodeReferences>,
        added: Option<&NodeReferences>,
    ) -> NodeReferences {
        let mut merged = base
            .cloned()
            .unwrap_or_else(|| NodeReferences::new(target.clone()));
        if let Some(removed) = removed {
            for (property, r) in &removed.referrers {
                for _ in 0..r.count {
                    merged.remove(property);
                }
            }
        }
        if let Some(added) = added {
            for (property, r) in &added.referrers {
                for _ in 0..r.count {
                    merged.record(property.clone(), r.kind);
                }
            }
        }
        merged
    }
}

/// Reverse index: target node id to referencing properties.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    entries: HashMap<NodeId, NodeReferences>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_reference(&mut self, property: &PropertyId, kind: ReferenceKind, target: &NodeId) {
        self.entries
            .entry(target.clone())
            .or_insert_with(|| NodeReferences::new(target.clone()))
            .record(property.clone(), kind);
    }

    /// Remove one reference; empty entries are dropped.
    pub fn remove_reference(&mut self, property: &PropertyId, target: &NodeId) -> bool {
        let Some(entry) = self.entries.get_mut(target) else {
            return false;
        };
        let removed = entry.remove(property);
        if entry.is_empty() {
            self.entries.remove(target);
        }
        removed
    }

    pub fn references_to(&self, target: &NodeId) -> Option<&NodeReferences> {
        self.entries.get(target)
    }

    /// Record every reference value of a property.
    pub fn record_property(&mut self, property: &PropertyState) {
        let Some(kind) = ReferenceKind::of(property.kind()) else {
            return;
        };
        for target in property.reference_targets() {
            self.record_reference(property.id(), kind, target);
        }
    }

    /// Remove every reference value of a property.
    pub fn remove_property(&mut self, property: &PropertyState) {
        for target in property.reference_targets() {
            self.remove_reference(property.id(), target);
        }
    }

    /// Store a complete entry, as fetched from the persistence provider.
    pub fn insert(&mut self, references: NodeReferences) {
        self.entries.insert(references.target.clone(), references);
    }

    /// Forget everything known about references to `target`.
    pub fn forget_target(&mut self, target: &NodeId) -> Option<NodeReferences> {
        self.entries.remove(target)
    }

    /// Forget every entry that lists `property` as a referrer.
    ///
    /// Returns the targets whose entries were dropped.
    pub fn forget_referrer(&mut self, property: &PropertyId) -> Vec<NodeId> {
        self.forget_where(|p| p == property)
    }

    /// Forget every entry with a referrer owned by `node`.
    pub fn forget_owner(&mut self, node: &NodeId) -> Vec<NodeId> {
        self.forget_where(|p| &p.parent == node)
    }

    fn forget_where(&mut self, pred: impl Fn(&PropertyId) -> bool) -> Vec<NodeId> {
        let targets: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, refs)| refs.property_ids().any(&pred))
            .map(|(target, _)| target.clone())
            .collect();
        for target in &targets {
            self.entries.remove(target);
        }
        targets
    }

    pub fn targets(&self) -> impl Iterator<Item = &NodeId> {
        self.entries.keys()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
