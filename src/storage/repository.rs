//!   Git-backed persistence provider.
//!
//!  This wraps `git2::Repository` with thread-safe access and implements
//!  [`PersistenceProvider`] on top of node records: reads resolve against the
//!  tree at `main`, and every accepted batch becomes one commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::Mutex;

use crate::cache::{ChangeNotifier, InvalidationSender};
use crate::changelog::ChangeLog;
use crate::state::{
    ItemId, ItemState, NodeId, NodeReferences, NodeState, NodeType, ReferenceKind, Revision,
};
use crate::storage::commit::{self, CommitBuilder, CommitInfo, CommitMessage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::provider::{plan_batch, BatchPlan, PersistenceProvider, SubmitReceipt};
use crate::storage::record::{self, NodeRecord};
use crate::storage::refs::RefManager;
use crate::storage::tree::{TreeHandle, TreeMutator};
use crate::storage::types::{BranchName, CommitId, GitSignature};

/// How often a batch is re-planned when `main` keeps moving.
const MAX_SUBMIT_ATTEMPTS: usize = 5;

/// The git-backed provider.
///
/// Clone this to share across threads - it uses Arc internally.
/// `git2::Repository` is not `Sync`, so access goes through a mutex; this
/// also serializes submits on one handle.
#[derive(Clone)]
pub struct GitRepository {
    inner: Arc<GitRepositoryInner>,
}

struct GitRepositoryInner {
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
    root: NodeId,
    notifier: ChangeNotifier,
}

impl GitRepository {
    /// Open an existing workspace repository.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path, GitSignature::treestate())
    }

    /// Open with a custom commit signature.
    pub fn open_with(path: impl AsRef<Path>, signature: GitSignature) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;

        let root = {
            let head = RefManager::head_commit(&repo)?;
            let tree = commit::get_tree_at_commit(&repo, head)?;
            tree.workspace(&repo)?.root
        };

        Ok(Self::from_parts(repo, path, signature, root))
    }

    /// Initialize a new workspace repository with an empty root node.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init_with(path, GitSignature::treestate())
    }

    pub fn init_with(path: impl AsRef<Path>, signature: GitSignature) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;

        let root = NodeState::new(NodeId::generate(), None, NodeType::root());
        let record = NodeRecord::from_state(&root, Revision::INITIAL);
        let commit_id = commit::create_initial_commit(&repo, &record, &signature)?;
        RefManager::init_main_branch(&repo, commit_id)?;

        tracing::info!(path = %path.display(), root = %root.id(), "initialized git workspace");
        Ok(Self::from_parts(repo, path, signature, root.id().clone()))
    }

    /// Open or initialize a repository.
    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    fn from_parts(repo: Repository, path: &Path, signature: GitSignature, root: NodeId) -> Self {
        Self {
            inner: Arc::new(GitRepositoryInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature,
                root,
                notifier: ChangeNotifier::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn root_id(&self) -> &NodeId {
        &self.inner.root
    }

    /// Execute a function with exclusive access to the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Get the current tip of `main`.
    pub fn head(&self) -> StorageResult<CommitId> {
        self.with_repo(|repo| RefManager::resolve_branch(repo, &BranchName::main()))
    }

    /// Save commits, most recent first.
    pub fn history(&self, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
        self.with_repo(|repo| {
            let head = RefManager::resolve_branch(repo, &BranchName::main())?;
            commit::save_history(repo, head, limit)
        })
    }

    /// Commit `log` on top of `head`, re-planning while `main` moves under it.
    ///
    /// A move that touched items of the log fails the revision check of the
    /// next plan; any other move is simply built upon. Events are published
    /// before the repository lock is released.
    fn submit_from(&self, repo: &Repository, log: &ChangeLog, mut head: CommitId) -> StorageResult<SubmitReceipt> {
        let main = BranchName::main();
        let mut attempt = 1;
        loop {
            let (plan, commit_id) = self.commit_batch(repo, log, head)?;
            match RefManager::update_branch_if_unchanged(repo, &main, head, commit_id) {
                Ok(()) => {
                    tracing::debug!(log = %log.id(), commit = %commit_id.short(), attempt, "git workspace committed batch");
                    self.inner.notifier.publish(&plan.events);
                    return Ok(plan.receipt);
                }
                Err(StorageError::ConcurrentModification { ids }) if ids.is_empty() && attempt < MAX_SUBMIT_ATTEMPTS => {
                    head = RefManager::resolve_branch(repo, &main)?;
                    attempt += 1;
                    tracing::debug!(log = %log.id(), head = %head.short(), attempt, "main moved, re-planning batch");
                }
                Err(StorageError::ConcurrentModification { .. }) => {
                    return Err(StorageError::ConcurrentModification {
                        ids: log.item_ids().cloned().collect(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Plan `log` against the tree at `head` and write it as a dangling commit.
    fn commit_batch(&self, repo: &Repository, log: &ChangeLog, head: CommitId) -> StorageResult<(BatchPlan, CommitId)> {
        let tree = commit::get_tree_at_commit(repo, head)?;
        let mut working = WorkingSet::new(repo, &tree);

        let plan = plan_batch(log, |id| working.revision_of(id))?;
        for (id, write) in &plan.writes {
            working.apply(id, write.as_ref())?;
        }

        let mut mutator = TreeMutator::from_tree(repo, &tree)?;
        for (id, record) in &working.records {
            match record {
                Some(record) => mutator.upsert_record(id, record::write_record(repo, record)?)?,
                None if tree.record_blob_id(repo, id)?.is_some() => mutator.delete_record(id)?,
                None => {}
            }
        }
        let new_tree = mutator.write()?;

        let commit_id = CommitBuilder::new(repo)
            .tree(new_tree)
            .parent(head)
            .message(CommitMessage::save(log.len(), &log.id().to_string()))
            .signature(self.inner.signature.clone())
            .commit()?;
        Ok((plan, commit_id))
    }

    /// Read a node record at the tip of `main`.
    fn read_head_record(&self, id: &NodeId) -> StorageResult<Option<NodeRecord>> {
        self.with_repo(|repo| {
            let head = RefManager::resolve_branch(repo, &BranchName::main())?;
            let tree = commit::get_tree_at_commit(repo, head)?;
            tree.read_record(repo, id)
        })
    }
}

/// Records touched by one batch, loaded lazily from the base tree.
struct WorkingSet<'a, 'repo> {
    repo: &'repo Repository,
    tree: &'a TreeHandle<'repo>,
    records: HashMap<NodeId, Option<NodeRecord>>,
}

impl<'a, 'repo> WorkingSet<'a, 'repo> {
    fn new(repo: &'repo Repository, tree: &'a TreeHandle<'repo>) -> Self {
        Self {
            repo,
            tree,
            records: HashMap::new(),
        }
    }

    fn record(&mut self, id: &NodeId) -> StorageResult<&mut Option<NodeRecord>> {
        if !self.records.contains_key(id) {
            let loaded = self.tree.read_record(self.repo, id)?;
            self.records.insert(id.clone(), loaded);
        }
        self.records
            .get_mut(id)
            .ok_or_else(|| StorageError::Internal(format!("record {} not loaded", id)))
    }

    fn revision_of(&mut self, id: &ItemId) -> StorageResult<Option<Revision>> {
        let record = self.record(id.node_id())?;
        Ok(match (id, record.as_ref()) {
            (ItemId::Node(_), Some(r)) => Some(Revision(r.revision)),
            (ItemId::Property(p), Some(r)) => r.properties.get(p.name.as_str()).map(|p| Revision(p.revision)),
            (_, None) => None,
        })
    }

    fn apply(&mut self, id: &ItemId, write: Option<&ItemState>) -> StorageResult<()> {
        let slot = self.record(id.node_id())?;
        match (id, write) {
            (ItemId::Node(_), Some(ItemState::Node(node))) => {
                let revision = node.revision().unwrap_or(Revision::INITIAL);
                if let Some(existing) = slot.as_mut() {
                    existing.update_from(node, revision);
                } else {
                    *slot = Some(NodeRecord::from_state(node, revision));
                }
            }
            (ItemId::Node(_), None) => *slot = None,
            (ItemId::Property(_), Some(ItemState::Property(prop))) => {
                let revision = prop.revision().unwrap_or(Revision::INITIAL);
                let owner = slot
                    .as_mut()
                    .ok_or_else(|| StorageError::Rejected(format!("owner of {} does not exist", id)))?;
                owner.set_property(prop, revision);
            }
            (ItemId::Property(p), None) => {
                if let Some(owner) = slot.as_mut() {
                    owner.remove_property(&p.name);
                }
            }
            _ => return Err(StorageError::Internal(format!("state does not match id {}", id))),
        }
        Ok(())
    }
}

impl PersistenceProvider for GitRepository {
    fn fetch_root(&self) -> StorageResult<NodeState> {
        let root = self.root_id();
        self.read_head_record(root)?
            .ok_or_else(|| StorageError::corrupted(format!("nodes/{}.json", root), "root record missing"))?
            .to_node_state()
    }

    fn fetch_item(&self, id: &ItemId) -> StorageResult<Option<ItemState>> {
        let Some(record) = self.read_head_record(id.node_id())? else {
            return Ok(None);
        };
        match id {
            ItemId::Node(_) => Ok(Some(ItemState::Node(record.to_node_state()?))),
            ItemId::Property(p) => Ok(record.property_state(&p.name)?.map(ItemState::Property)),
        }
    }

    fn fetch_references(&self, target: &NodeId) -> StorageResult<Option<NodeReferences>> {
        self.with_repo(|repo| {
            let head = RefManager::resolve_branch(repo, &BranchName::main())?;
            let tree = commit::get_tree_at_commit(repo, head)?;
            let mut refs = NodeReferences::new(target.clone());

            for id in tree.list_nodes(repo)? {
                let Some(record) = tree.read_record(repo, &id)? else {
                    continue;
                };
                for prop in record.property_states()? {
                    let Some(kind) = ReferenceKind::of(prop.kind()) else {
                        continue;
                    };
                    for t in prop.reference_targets() {
                        if t == target {
                            refs.record(prop.id().clone(), kind);
                        }
                    }
                }
            }

            Ok((!refs.is_empty()).then_some(refs))
        })
    }

    fn submit(&self, log: &ChangeLog) -> StorageResult<SubmitReceipt> {
        self.with_repo(|repo| {
            let head = RefManager::resolve_branch(repo, &BranchName::main())?;
            self.submit_from(repo, log, head)
        })
    }

    fn subscribe(&self, feed: InvalidationSender) {
        self.inner.notifier.subscribe(feed);
    }
}
