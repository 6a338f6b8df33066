//!  Commit creation and history traversal
//!
//!  commits are the atomic units of change in Git. In a git-backed workspace:
//! - initialization creates the first commit
//! - every accepted save creates exactly one commit on `main`
//!
//! this module handles commit creation and history walking

use chrono::{DateTime, TimeZone, Utc};
use git2::{Repository, Sort};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::record::NodeRecord;
use crate::storage::tree::TreeHandle;
use crate::storage::types::{CommitId, GitSignature, TreeId};

/// information about a commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub tree_id: TreeId,
    pub parent_ids: Vec<CommitId>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitInfo {
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let author = commit.author();
        let time = commit.time();
        let timestamp = Utc
            .timestamp_opt(time.seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            id: CommitId::new(commit.id()),
            tree_id: TreeId::new(commit.tree_id()),
            parent_ids: commit.parent_ids().map(CommitId::new).collect(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("Unknown").to_string(),
            author_email: author.email().unwrap_or("unknown@unknown").to_string(),
            timestamp,
        }
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }

    /// check if this commit was produced by a save
    pub fn is_save(&self) -> bool {
        self.message.starts_with(CommitMessage::SAVE_TAG)
    }

    /// Id of the change log a save commit recorded.
    pub fn log_id(&self) -> Option<&str> {
        if !self.is_save() {
            return None;
        }
        self.summary().rsplit_once(CommitMessage::LOG_PREFIX).map(|(_, id)| id)
    }
}

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
    update_ref: Option<String>,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::treestate(),
            update_ref: None,
        }
    }

    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// update a ref (branch) to point to this commit
    pub fn update_ref(mut self, refname: impl Into<String>) -> Self {
        self.update_ref = Some(refname.into());
        self
    }

    /// create the commit and return its ID
    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let sig = self.signature.to_git2_signature()?;

        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| self.repo.find_commit(id.raw()))
            .collect::<Result<_, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self.repo.commit(
            self.update_ref.as_deref(),
            &sig,
            &sig,
            &self.message,
            &tree,
            &parent_refs,
        )?;

        Ok(CommitId::new(oid))
    }
}

/// get the tree snapshot at a specific commit
pub fn get_tree_at_commit(repo: &Repository, commit_id: CommitId) -> StorageResult<TreeHandle<'_>> {
    let commit = repo
        .find_commit(commit_id.raw())
        .map_err(|_| StorageError::CommitNotFound(commit_id.to_string()))?;

    let tree = commit.tree()?;
    Ok(TreeHandle::new(tree))
}

/// create the initial commit for a new workspace
pub fn create_initial_commit(
    repo: &Repository,
    root: &NodeRecord,
    signature: &GitSignature,
) -> StorageResult<CommitId> {
    let tree_id = crate::storage::tree::create_initial_tree(repo, root)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message(CommitMessage::init(&root.id))
        .signature(signature.clone())
        .update_ref("HEAD")
        .commit()
}

/// Save commits reachable from `start`, most recent first.
///
/// Initialization and other non-save commits are skipped; `limit` counts
/// saves only.
pub fn save_history(repo: &Repository, start: CommitId, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
    let mut revwalk = repo.revwalk()?;
    revwalk.push(start.raw())?;
    revwalk.set_sorting(Sort::TIME | Sort::TOPOLOGICAL)?;

    let mut saves = Vec::new();
    for oid in revwalk {
        if limit.is_some_and(|n| saves.len() >= n) {
            break;
        }
        let info = CommitInfo::from_git2(&repo.find_commit(oid?)?);
        if info.is_save() {
            saves.push(info);
        }
    }
    Ok(saves)
}

/// message formatting for workspace commits
pub struct CommitMessage;

impl CommitMessage {
    pub const SAVE_TAG: &'static str = "[SAVE]";
    const LOG_PREFIX: &'static str = " log:";

    /// format a message for workspace initialization
    pub fn init(root: &str) -> String {
        format!("[INIT] workspace root {}", root)
    }

    /// format a message for an accepted save
    pub fn save(changes: usize, log_id: &str) -> String {
        format!("{} {} change(s){}{}", Self::SAVE_TAG, changes, Self::LOG_PREFIX, log_id)
    }
}
