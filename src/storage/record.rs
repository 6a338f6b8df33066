//! Blob operations for node records.
//!
//! Each persisted node is stored as one JSON file holding the node's
//! structure and all of its properties, with per-item revisions for
//! optimistic concurrency checks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::{
    ChildEntries, ChildEntry, Name, NodeId, NodeState, NodeType, PropertyId, PropertyState,
    Revision, Value, ValueKind, Values,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, RecordPath};

/// a persisted node with its properties
///
/// The internal format stored in Git:
/// ```text
/// {
///   "_id": "01j9...",
///   "_revision": 3,
///   "_created_at": "xxxx-xx-xxT00:00:00Z",
///   "_updated_at": "xxxx-xx-xxT00:00:00Z",
///   "parent": "01j8...",
///   "type": { "primary": "nt:unstructured", "mixins": [] },
///   "children": [ { "name": "a", "id": "01ja..." } ],
///   "properties": {
///     "title": { "revision": 1, "kind": "String", "multiple": false,
///                "values": [ { "type": "String", "value": "x" } ] }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_revision")]
    pub revision: u64,
    #[serde(rename = "_created_at")]
    pub created_at: String,
    #[serde(rename = "_updated_at")]
    pub updated_at: String,
    #[serde(default)]
    pub parent: Option<NodeId>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub children: Vec<ChildEntry>,
    /// BTreeMap for consistent key ordering (important for git deduplication)
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyRecord>,
}

/// one property inside a node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub revision: u64,
    pub kind: ValueKind,
    pub multiple: bool,
    pub values: Vec<Value>,
}

impl PropertyRecord {
    pub fn from_state(state: &PropertyState, revision: Revision) -> Self {
        Self {
            revision: revision.0,
            kind: state.kind(),
            multiple: state.is_multiple(),
            values: state.values().to_vec(),
        }
    }
}

impl NodeRecord {
    /// create a record for a node persisted for the first time
    pub fn from_state(node: &NodeState, revision: Revision) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: node.id().to_string(),
            revision: revision.0,
            created_at: now.clone(),
            updated_at: now,
            parent: node.parent().cloned(),
            node_type: node.node_type().clone(),
            children: node.children().to_vec(),
            properties: BTreeMap::new(),
        }
    }

    /// overwrite the node's own structure, keeping its properties
    pub fn update_from(&mut self, node: &NodeState, revision: Revision) {
        self.revision = revision.0;
        self.updated_at = chrono::Utc::now().to_rfc3339();
        self.parent = node.parent().cloned();
        self.node_type = node.node_type().clone();
        self.children = node.children().to_vec();
    }

    pub fn set_property(&mut self, state: &PropertyState, revision: Revision) {
        self.properties
            .insert(state.name().to_string(), PropertyRecord::from_state(state, revision));
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    pub fn remove_property(&mut self, name: &Name) -> bool {
        self.properties.remove(name.as_str()).is_some()
    }

    fn node_id(&self) -> StorageResult<NodeId> {
        NodeId::new(self.id.as_str()).map_err(|e| StorageError::corrupted(self.path(), e.to_string()))
    }

    fn path(&self) -> String {
        format!("{}/{}.json", RecordPath::NODES_DIR, self.id)
    }

    /// the committed node state described by this record
    pub fn to_node_state(&self) -> StorageResult<NodeState> {
        let names = self
            .properties
            .keys()
            .map(|name| Name::new(name.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::corrupted(self.path(), e.to_string()))?;

        Ok(NodeState::new(self.node_id()?, self.parent.clone(), self.node_type.clone())
            .with_children(ChildEntries::from_vec(self.children.clone()))
            .with_properties(names)
            .into_existing(Revision(self.revision)))
    }

    /// the committed state of property `name`, if present
    pub fn property_state(&self, name: &Name) -> StorageResult<Option<PropertyState>> {
        let Some(record) = self.properties.get(name.as_str()) else {
            return Ok(None);
        };
        let values = if record.multiple {
            Values::multiple(record.kind, record.values.clone())
        } else {
            match record.values.first() {
                Some(value) if record.values.len() == 1 => Values::Single(value.clone()),
                _ => {
                    return Err(StorageError::corrupted(
                        self.path(),
                        format!("single-valued property {} has {} values", name, record.values.len()),
                    ))
                }
            }
        };
        let id = PropertyId::new(self.node_id()?, name.clone());
        let state = PropertyState::new(id, values)
            .map_err(|e| StorageError::corrupted(self.path(), e.to_string()))?;
        Ok(Some(state.into_existing(Revision(record.revision))))
    }

    /// every property state of the node
    pub fn property_states(&self) -> StorageResult<Vec<PropertyState>> {
        let mut states = Vec::with_capacity(self.properties.len());
        for name in self.properties.keys() {
            let name = Name::new(name.as_str()).map_err(|e| StorageError::corrupted(self.path(), e.to_string()))?;
            if let Some(state) = self.property_state(&name)? {
                states.push(state);
            }
        }
        Ok(states)
    }
}

/// workspace metadata stored at the tree root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub root: NodeId,
    pub created_at: String,
}

impl WorkspaceRecord {
    pub fn new(root: NodeId) -> Self {
        Self {
            root,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// serialize a node record to JSON bytes
pub fn serialize_record(record: &NodeRecord) -> StorageResult<Vec<u8>> {
    let bytes = serde_json::to_vec_pretty(record)?;
    Ok(bytes)
}

/// deserialize a node record from JSON bytes
///
/// validates that the id in the JSON matches the file it was read from
pub fn deserialize_record(bytes: &[u8], expected: &NodeId) -> StorageResult<NodeRecord> {
    let record: NodeRecord = serde_json::from_slice(bytes)?;

    if record.id != expected.as_str() {
        return Err(StorageError::corrupted(
            RecordPath::new(expected.clone()).to_string(),
            format!(
                "node id mismatch: file name suggests '{}' but content has '{}'",
                expected, record.id
            ),
        ));
    }

    Ok(record)
}

/// write a node record as a blob to the repository
pub fn write_record(repo: &git2::Repository, record: &NodeRecord) -> StorageResult<BlobId> {
    let bytes = serialize_record(record)?;
    let oid = repo.blob(&bytes)?;
    Ok(BlobId::new(oid))
}

pub fn write_workspace(repo: &git2::Repository, record: &WorkspaceRecord) -> StorageResult<BlobId> {
    let bytes = serde_json::to_vec_pretty(record)?;
    Ok(BlobId::new(repo.blob(&bytes)?))
}

/// read a blob's content from the repository
pub fn read_blob(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Vec<u8>> {
    let blob = repo.find_blob(blob_id.raw())?;
    Ok(blob.content().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> NodeState {
        let parent = NodeId::generate();
        let mut children = ChildEntries::new();
        children.add(Name::new("a").unwrap(), NodeId::generate());
        NodeState::new(NodeId::generate(), Some(parent), NodeType::unstructured()).with_children(children)
    }

    #[test]
    fn test_record_roundtrip_keeps_structure() {
        let node = sample_node();
        let mut record = NodeRecord::from_state(&node, Revision(3));
        let title = PropertyState::new(
            PropertyId::new(node.id().clone(), Name::new("title").unwrap()),
            Values::single("hello"),
        )
        .unwrap();
        record.set_property(&title, Revision(2));

        let bytes = serialize_record(&record).unwrap();
        let restored = deserialize_record(&bytes, node.id()).unwrap();

        let state = restored.to_node_state().unwrap();
        assert_eq!(state.revision(), Some(Revision(3)));
        assert_eq!(state.children(), node.children());
        assert!(state.has_property(title.name()));

        let prop = restored.property_state(title.name()).unwrap().unwrap();
        assert_eq!(prop.value(), Some(&Value::from("hello")));
        assert_eq!(prop.revision(), Some(Revision(2)));
    }

    #[test]
    fn test_serialization_format() {
        let record = NodeRecord::from_state(&sample_node(), Revision::INITIAL);
        let bytes = serialize_record(&record).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert!(parsed.get("_id").is_some());
        assert_eq!(parsed["_revision"], 1);
        assert_eq!(parsed["type"]["primary"], "nt:unstructured");
    }

    #[test]
    fn test_id_mismatch_detection() {
        let record = NodeRecord::from_state(&sample_node(), Revision::INITIAL);
        let bytes = serialize_record(&record).unwrap();

        let result = deserialize_record(&bytes, &NodeId::generate());
        assert!(matches!(result, Err(StorageError::CorruptedData { .. })));
    }

    #[test]
    fn test_single_valued_without_value_is_corrupt() {
        let mut record = NodeRecord::from_state(&sample_node(), Revision::INITIAL);
        record.properties.insert(
            "broken".to_string(),
            PropertyRecord {
                revision: 1,
                kind: ValueKind::String,
                multiple: false,
                values: vec![],
            },
        );
        let name = Name::new("broken").unwrap();
        assert!(matches!(
            record.property_state(&name),
            Err(StorageError::CorruptedData { .. })
        ));
    }
}
