//!  tree operations for node records.
//!
//! in Git, a tree is a directory. A workspace tree holds:
//! - `_workspace.json` with the root node id
//! - `nodes/` with one `{node_id}.json` record per node
//!
//! this module provides safe abstractions over Git's tree manipulation,
//! which is notoriously fiddly to get right.

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder as Git2TreeBuilder};

use crate::state::NodeId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::record::{self, NodeRecord, WorkspaceRecord};
use crate::storage::types::{BlobId, RecordPath, TreeId};

/// A read only handle to a git tree at a specific commit
///
/// think of it as a snapshot - it won't change even if new commits are made.
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    /// the nodes directory, if the tree has one
    fn nodes_tree(&self, repo: &'repo Repository) -> StorageResult<Option<Tree<'repo>>> {
        match self.tree.get_name(RecordPath::NODES_DIR) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(StorageError::corrupted(
                        RecordPath::NODES_DIR,
                        format!("expected a directory, found {:?}", entry.kind()),
                    ));
                }
                Ok(Some(repo.find_tree(entry.id())?))
            }
            None => Ok(None),
        }
    }

    /// read the workspace metadata
    pub fn workspace(&self, repo: &Repository) -> StorageResult<WorkspaceRecord> {
        let entry = self
            .tree
            .get_name(RecordPath::WORKSPACE_FILE)
            .ok_or_else(|| StorageError::corrupted(RecordPath::WORKSPACE_FILE, "missing workspace record"))?;
        let bytes = record::read_blob(repo, BlobId::new(entry.id()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// list every node id with a record
    pub fn list_nodes(&self, repo: &'repo Repository) -> StorageResult<Vec<NodeId>> {
        let Some(nodes) = self.nodes_tree(repo)? else {
            return Ok(Vec::new());
        };

        let ids = nodes
            .iter()
            .filter_map(|entry| {
                // only blobs (files)
                if entry.kind() != Some(ObjectType::Blob) {
                    return None;
                }
                RecordPath::parse_file_name(entry.name()?)
            })
            .collect();

        Ok(ids)
    }

    /// get the blob ID for a node record
    pub fn record_blob_id(&self, repo: &'repo Repository, id: &NodeId) -> StorageResult<Option<BlobId>> {
        let Some(nodes) = self.nodes_tree(repo)? else {
            return Ok(None);
        };

        let path = RecordPath::new(id.clone());
        let blob = match nodes.get_name(&path.file_name()) {
            Some(entry) if entry.kind() != Some(ObjectType::Blob) => {
                return Err(StorageError::corrupted(
                    path.to_string(),
                    format!("expected a file, found {:?}", entry.kind()),
                ));
            }
            Some(entry) => Some(BlobId::new(entry.id())),
            None => None,
        };
        Ok(blob)
    }

    /// read and decode a node record
    pub fn read_record(&self, repo: &'repo Repository, id: &NodeId) -> StorageResult<Option<NodeRecord>> {
        match self.record_blob_id(repo, id)? {
            Some(blob_id) => {
                let bytes = record::read_blob(repo, blob_id)?;
                Ok(Some(record::deserialize_record(&bytes, id)?))
            }
            None => Ok(None),
        }
    }
}

/// a mutable tree builder for making changes
///
/// this adds up changes and produces a new tree when its final
/// the original tree is not modified
///
/// # Usage Pattern
///
/// ```ignore
/// let mut mutator = TreeMutator::from_tree(repo, &tree)?;
/// mutator.upsert_record(&node_id, blob_id)?;
/// mutator.delete_record(&other_id)?;
/// let new_tree_id = mutator.write()?;
/// ```
pub struct TreeMutator<'repo> {
    root_builder: Git2TreeBuilder<'repo>,
    nodes_builder: Git2TreeBuilder<'repo>,
}

impl<'repo> TreeMutator<'repo> {
    /// create a new TreeMutator from an existing tree
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'repo>) -> StorageResult<Self> {
        let root_builder = repo.treebuilder(Some(tree.inner()))?;
        let nodes_builder = match tree.nodes_tree(repo)? {
            Some(nodes) => repo.treebuilder(Some(&nodes))?,
            None => repo.treebuilder(None)?,
        };
        Ok(Self {
            root_builder,
            nodes_builder,
        })
    }

    /// create a new TreeMutator for an empty tree
    pub fn empty(repo: &'repo Repository) -> StorageResult<Self> {
        Ok(Self {
            root_builder: repo.treebuilder(None)?,
            nodes_builder: repo.treebuilder(None)?,
        })
    }

    pub fn set_workspace(&mut self, blob_id: BlobId) -> StorageResult<()> {
        self.root_builder
            .insert(RecordPath::WORKSPACE_FILE, blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// insert or replace a node record
    pub fn upsert_record(&mut self, id: &NodeId, blob_id: BlobId) -> StorageResult<()> {
        let filename = RecordPath::new(id.clone()).file_name();
        self.nodes_builder.insert(&filename, blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// delete a node record
    pub fn delete_record(&mut self, id: &NodeId) -> StorageResult<()> {
        let path = RecordPath::new(id.clone());
        // git2 returns error if entry doesn't exist, but we want to verify it existed
        self.nodes_builder
            .remove(path.file_name())
            .map_err(|_| StorageError::Internal(format!("no record to delete at {}", path)))?;
        Ok(())
    }

    /// write all changes and return the new root tree ID
    pub fn write(mut self) -> StorageResult<TreeId> {
        let nodes_id = self.nodes_builder.write()?;
        self.root_builder
            .insert(RecordPath::NODES_DIR, nodes_id, FileMode::Tree.into())?;
        let root_id = self.root_builder.write()?;
        Ok(TreeId::new(root_id))
    }
}

/// create the first tree of a workspace: metadata plus the root record
pub fn create_initial_tree(repo: &Repository, root: &NodeRecord) -> StorageResult<TreeId> {
    let root_id = NodeId::new(root.id.as_str())
        .map_err(|e| StorageError::Internal(format!("invalid root id: {}", e)))?;
    let mut mutator = TreeMutator::empty(repo)?;
    let workspace = record::write_workspace(repo, &WorkspaceRecord::new(root_id.clone()))?;
    mutator.set_workspace(workspace)?;
    mutator.upsert_record(&root_id, record::write_record(repo, root)?)?;
    mutator.write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::state::{NodeState, NodeType, Revision};

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn root_record() -> NodeRecord {
        let root = NodeState::new(NodeId::generate(), None, NodeType::root());
        NodeRecord::from_state(&root, Revision::INITIAL)
    }

    #[test]
    fn test_initial_tree_layout() {
        let (_dir, repo) = setup_repo();
        let root = root_record();
        let tree_id = create_initial_tree(&repo, &root).unwrap();
        let handle = TreeHandle::new(repo.find_tree(tree_id.raw()).unwrap());

        let workspace = handle.workspace(&repo).unwrap();
        assert_eq!(workspace.root.as_str(), root.id);
        assert_eq!(handle.list_nodes(&repo).unwrap(), vec![workspace.root.clone()]);

        let read = handle.read_record(&repo, &workspace.root).unwrap().unwrap();
        assert_eq!(read, root);
    }

    #[test]
    fn test_upsert_and_delete_records() {
        let (_dir, repo) = setup_repo();
        let tree_id = create_initial_tree(&repo, &root_record()).unwrap();
        let handle = TreeHandle::new(repo.find_tree(tree_id.raw()).unwrap());

        let child = NodeState::new(NodeId::generate(), None, NodeType::unstructured());
        let blob = record::write_record(&repo, &NodeRecord::from_state(&child, Revision::INITIAL)).unwrap();

        let mut mutator = TreeMutator::from_tree(&repo, &handle).unwrap();
        mutator.upsert_record(child.id(), blob).unwrap();
        let tree_id = mutator.write().unwrap();

        let handle = TreeHandle::new(repo.find_tree(tree_id.raw()).unwrap());
        assert_eq!(handle.list_nodes(&repo).unwrap().len(), 2);
        assert!(handle.record_blob_id(&repo, child.id()).unwrap().is_some());

        let mut mutator = TreeMutator::from_tree(&repo, &handle).unwrap();
        mutator.delete_record(child.id()).unwrap();
        assert!(mutator.delete_record(&NodeId::generate()).is_err());
        let tree_id = mutator.write().unwrap();

        let handle = TreeHandle::new(repo.find_tree(tree_id.raw()).unwrap());
        assert!(handle.read_record(&repo, child.id()).unwrap().is_none());
        // metadata survives record edits
        assert!(handle.workspace(&repo).is_ok());
    }

    #[test]
    fn test_record_blob_id_lookups() {
        let (_dir, repo) = setup_repo();
        let root = root_record();
        let tree_id = create_initial_tree(&repo, &root).unwrap();
        let handle = TreeHandle::new(repo.find_tree(tree_id.raw()).unwrap());
        let root_id = handle.workspace(&repo).unwrap().root;

        assert!(handle.record_blob_id(&repo, &root_id).unwrap().is_some());
        assert!(handle.record_blob_id(&repo, &NodeId::generate()).unwrap().is_none());

        // a directory where a record file should be
        let bogus = NodeId::generate();
        let empty = repo.treebuilder(None).unwrap().write().unwrap();
        let mut nodes = repo.treebuilder(None).unwrap();
        nodes
            .insert(RecordPath::new(bogus.clone()).file_name(), empty, FileMode::Tree.into())
            .unwrap();
        let nodes = nodes.write().unwrap();
        let mut top = repo.treebuilder(None).unwrap();
        top.insert(RecordPath::NODES_DIR, nodes, FileMode::Tree.into()).unwrap();
        let handle = TreeHandle::new(repo.find_tree(top.write().unwrap()).unwrap());

        let err = handle.record_blob_id(&repo, &bogus).unwrap_err();
        assert!(matches!(err, StorageError::CorruptedData { .. }));
    }
}
