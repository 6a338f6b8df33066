//! Save coordinator - validates and commits closed change logs.
//!
//! A closed log goes through these checks while `Validating`:
//! - no reference value may name a transient node the log does not add
//! - referential integrity against the prospective post-commit state
//! - optimistic concurrency against the persisted revisions
//! - injected validators (schema and type rules live outside this crate)
//!
//! Then it is submitted to the provider as one all-or-nothing batch. Once the
//! provider has accepted, the cache must install the new baseline; a failure
//! there is fatal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use ulid::Ulid;

use crate::cache::ItemStateCache;
use crate::changelog::log::{ChangeLog, Operation};
use crate::state::{ItemId, ItemStateManager, NodeId, PropertyId, Revision, StateError, StateResult};
use crate::storage::{StorageError, SubmitReceipt};

/// Structural checks injected into the coordinator.
pub trait ChangeValidator: Send + Sync {
    /// Reject the log with a reason, or accept it.
    fn validate(&self, log: &ChangeLog) -> Result<(), String>;
}

impl<F> ChangeValidator for F
where
    F: Fn(&ChangeLog) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, log: &ChangeLog) -> Result<(), String> {
        self(log)
    }
}

/// Result of a committed save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub log_id: Ulid,
    /// transient node id -> permanent node id
    pub assigned: HashMap<NodeId, NodeId>,
    /// new revision of every written item
    pub revisions: HashMap<ItemId, Revision>,
    /// every item of the log, by permanent id
    pub promoted: Vec<ItemId>,
}

impl SaveOutcome {
    /// An outcome for a save with nothing to commit.
    pub fn empty(log_id: Ulid) -> Self {
        Self {
            log_id,
            assigned: HashMap::new(),
            revisions: HashMap::new(),
            promoted: Vec::new(),
        }
    }

    pub(crate) fn from_receipt(log: &ChangeLog, receipt: SubmitReceipt) -> Self {
        let promoted = log.item_ids().map(|id| id.remapped(&receipt.assigned)).collect();
        Self {
            log_id: log.id(),
            assigned: receipt.assigned,
            revisions: receipt.revisions,
            promoted,
        }
    }

    /// The permanent id for `id`; ids that were never transient map to themselves.
    pub fn resolve(&self, id: &NodeId) -> NodeId {
        self.assigned.get(id).unwrap_or(id).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty()
    }
}

/// Commits change logs through one provider.
///
/// Logs over disjoint items commit in parallel; a log waits only for
/// in-progress logs that share an item with it.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct SaveCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    cache: Arc<ItemStateCache>,
    validators: RwLock<Vec<Arc<dyn ChangeValidator>>>,
    check_references: bool,
    /// items of the logs being committed right now
    busy: ItemLocks,
}

/// Set of item ids claimed by in-progress commits.
#[derive(Default)]
struct ItemLocks {
    claimed: Mutex<HashSet<ItemId>>,
    released: Condvar,
}

impl ItemLocks {
    /// Claim every id at once, waiting while any is claimed elsewhere.
    fn claim(&self, ids: Vec<ItemId>) -> ItemClaim<'_> {
        let mut claimed = self.claimed.lock();
        while ids.iter().any(|id| claimed.contains(id)) {
            self.released.wait(&mut claimed);
        }
        claimed.extend(ids.iter().cloned());
        ItemClaim { locks: self, ids }
    }
}

/// Releases its ids when dropped.
struct ItemClaim<'a> {
    locks: &'a ItemLocks,
    ids: Vec<ItemId>,
}

impl Drop for ItemClaim<'_> {
    fn drop(&mut self) {
        let mut claimed = self.locks.claimed.lock();
        for id in &self.ids {
            claimed.remove(id);
        }
        self.locks.released.notify_all();
    }
}

impl SaveCoordinator {
    pub fn new(cache: Arc<ItemStateCache>) -> Self {
        Self::with_reference_checks(cache, true)
    }

    pub fn with_reference_checks(cache: Arc<ItemStateCache>, check_references: bool) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                validators: RwLock::new(Vec::new()),
                check_references,
                busy: ItemLocks::default(),
            }),
        }
    }

    pub fn add_validator(&self, validator: Arc<dyn ChangeValidator>) {
        self.inner.validators.write().push(validator);
    }

    pub fn cache(&self) -> &Arc<ItemStateCache> {
        &self.inner.cache
    }

    /// Validate and commit a closed log.
    ///
    /// On any failure before the provider accepts, the log is `Aborted` and
    /// nothing was written.
    pub fn commit(&self, log: &mut ChangeLog) -> StateResult<SaveOutcome> {
        log.begin_validation()?;
        let _claim = self.inner.busy.claim(claimed_ids(log));
        tracing::debug!(log = %log.id(), entries = log.len(), "validating change log");

        let receipt = match self.validate(log).and_then(|()| self.submit(log)) {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(log = %log.id(), error = %e, "save aborted");
                log.mark_aborted()?;
                return Err(e);
            }
        };

        let outcome = SaveOutcome::from_receipt(log, receipt);
        if let Err(e) = log
            .mark_committed()
            .and_then(|()| self.inner.cache.apply_commit(log, &outcome))
        {
            tracing::error!(log = %log.id(), error = %e, "bookkeeping failed after the provider accepted the commit");
            return Err(match e {
                fatal @ StateError::InternalConsistency(_) => fatal,
                other => StateError::InternalConsistency(other.to_string()),
            });
        }

        tracing::info!(
            log = %log.id(),
            entries = log.len(),
            assigned = outcome.assigned.len(),
            "change log committed"
        );
        Ok(outcome)
    }

    /// Cancel a closed log before it is submitted.
    pub fn abort(&self, log: &mut ChangeLog) -> StateResult<()> {
        log.mark_aborted()?;
        tracing::debug!(log = %log.id(), "change log cancelled");
        Ok(())
    }

    fn validate(&self, log: &ChangeLog) -> StateResult<()> {
        check_transient_references(log)?;
        if self.inner.check_references {
            self.check_referential_integrity(log)?;
        }
        self.check_revisions(log)?;
        for validator in self.inner.validators.read().iter() {
            validator.validate(log).map_err(StateError::Validation)?;
        }
        Ok(())
    }

    fn submit(&self, log: &ChangeLog) -> StateResult<SubmitReceipt> {
        self.inner
            .cache
            .persistent()
            .provider()
            .submit(log)
            .map_err(|e| match e {
                StorageError::ConcurrentModification { ids } => StateError::ConcurrentModification { ids },
                other => StateError::ItemState(other),
            })
    }

    /// Every based entry must still carry its base revision.
    fn check_revisions(&self, log: &ChangeLog) -> StateResult<()> {
        let persistent = self.inner.cache.persistent();
        let mut conflicts = Vec::new();
        for (id, base) in log.based_entries() {
            if persistent.current_revision(id)? != Some(base) {
                conflicts.push(id.clone());
            }
        }
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(StateError::ConcurrentModification { ids: conflicts })
        }
    }

    /// No strong reference may dangle once the log is applied.
    fn check_referential_integrity(&self, log: &ChangeLog) -> StateResult<()> {
        let cache = &self.inner.cache;
        let removed_nodes = log.removed_nodes();
        let removed_properties = log.removed_properties();
        let rewritten: HashMap<&PropertyId, Vec<&NodeId>> = log
            .entries()
            .iter()
            .filter_map(|e| match (&e.id, &e.operation) {
                (ItemId::Property(id), Operation::ModifyProperty(p)) => Some((id, p.reference_targets())),
                _ => None,
            })
            .collect();

        for &target in &removed_nodes {
            let references = cache.references_or_empty(target)?;
            for property in references.strong() {
                if removed_nodes.contains(&property.parent) || removed_properties.contains(property) {
                    continue;
                }
                if let Some(targets) = rewritten.get(property) {
                    if !targets.contains(&target) {
                        continue;
                    }
                }
                return Err(StateError::ReferentialIntegrity {
                    target: target.clone(),
                    property: property.clone(),
                });
            }
        }

        let added_nodes: HashSet<&NodeId> = log.added_nodes();
        for entry in log.entries() {
            let Some(property) = entry.operation.property() else {
                continue;
            };
            if !property.is_strong_reference() {
                continue;
            }
            for target in property.reference_targets() {
                let exists = added_nodes.contains(target)
                    || (!removed_nodes.contains(target) && cache.has_item_state(&ItemId::Node(target.clone())));
                if !exists {
                    return Err(StateError::ReferentialIntegrity {
                        target: target.clone(),
                        property: property.id().clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Ids a commit of `log` must hold exclusively.
///
/// Strong reference targets are included, so a log that removes a node
/// never validates alongside one that starts referencing it.
fn claimed_ids(log: &ChangeLog) -> Vec<ItemId> {
    let mut ids: HashSet<ItemId> = log.item_ids().cloned().collect();
    for property in log.entries().iter().filter_map(|e| e.operation.property()) {
        if property.is_strong_reference() {
            ids.extend(property.reference_targets().into_iter().cloned().map(ItemId::Node));
        }
    }
    ids.into_iter().collect()
}

/// Placeholder ids never reach the provider inside reference values.
fn check_transient_references(log: &ChangeLog) -> StateResult<()> {
    let added_nodes = log.added_nodes();
    for property in log.entries().iter().filter_map(|e| e.operation.property()) {
        if let Some(target) = property
            .reference_targets()
            .into_iter()
            .find(|target| target.is_transient() && !added_nodes.contains(target))
        {
            return Err(StateError::ReferentialIntegrity {
                target: target.clone(),
                property: property.id().clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::changelog::ChangeEntry;
    use crate::state::{Name, NodeState, NodeType, PropertyState, Value, Values};
    use crate::storage::{MemoryStore, PersistenceProvider, PersistentLayer};

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: SaveCoordinator,
    }

    fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ItemStateCache::new(PersistentLayer::new(store.clone()), &CacheConfig::default()));
        store.subscribe(cache.invalidation_sender());
        Fixture {
            store,
            coordinator: SaveCoordinator::new(cache),
        }
    }

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    /// Log adding node `n` under the root, optionally with a strong reference.
    fn add_under_root(store: &MemoryStore, n: &str, reference: Option<&NodeId>) -> (ChangeLog, NodeId) {
        let root = store.fetch_root().unwrap();
        let mut node = NodeState::new(NodeId::transient(), Some(root.id().clone()), NodeType::unstructured());
        let tmp = node.id().clone();
        let mut updated = root.clone();
        updated.children.add(name(n), tmp.clone());

        let mut log = ChangeLog::new();
        log.push(ChangeEntry::new(root.id().clone().into(), Operation::UpdateNode(updated), root.revision()))
            .unwrap();
        if let Some(target) = reference {
            node.properties.insert(name("ref"));
            let prop = PropertyState::new(
                PropertyId::new(tmp.clone(), name("ref")),
                Values::single(Value::Reference(target.clone())),
            )
            .unwrap();
            log.push(ChangeEntry::new(tmp.clone().into(), Operation::AddNode(node), None)).unwrap();
            log.push(ChangeEntry::new(prop.id().clone().into(), Operation::AddProperty(prop), None))
                .unwrap();
        } else {
            log.push(ChangeEntry::new(tmp.clone().into(), Operation::AddNode(node), None)).unwrap();
        }
        log.close().unwrap();
        (log, tmp)
    }

    fn remove_from_root(store: &MemoryStore, victims: &[&NodeId]) -> ChangeLog {
        let root = store.fetch_root().unwrap();
        let mut updated = root.clone();
        let mut log = ChangeLog::new();
        for victim in victims {
            updated.children.remove(victim);
        }
        log.push(ChangeEntry::new(root.id().clone().into(), Operation::UpdateNode(updated), root.revision()))
            .unwrap();
        for victim in victims {
            let node = store.fetch_item(&ItemId::Node((*victim).clone())).unwrap().unwrap();
            for prop in node.as_node().unwrap().property_ids() {
                log.push(ChangeEntry::new(prop.into(), Operation::RemoveProperty, Some(Revision::INITIAL)))
                    .unwrap();
            }
            log.push(ChangeEntry::new((*victim).clone().into(), Operation::RemoveNode, node.revision()))
                .unwrap();
        }
        log.close().unwrap();
        log
    }

    #[test]
    fn test_commit_assigns_ids_and_updates_cache() {
        let f = setup();
        let (mut log, tmp) = add_under_root(&f.store, "a", None);

        let outcome = f.coordinator.commit(&mut log).unwrap();
        assert_eq!(log.state(), crate::changelog::LogState::Committed);

        let permanent = outcome.resolve(&tmp);
        assert!(!permanent.is_transient());
        assert!(outcome.promoted.contains(&ItemId::Node(permanent.clone())));

        let cached = f.coordinator.cache().node_state(&permanent).unwrap();
        assert_eq!(cached.status(), crate::state::ItemStatus::Existing);
        assert_eq!(cached.revision(), Some(Revision::INITIAL));
    }

    #[test]
    fn test_removing_referenced_node_is_rejected() {
        let f = setup();
        let (mut log, tmp) = add_under_root(&f.store, "target", None);
        let target = f.coordinator.commit(&mut log).unwrap().resolve(&tmp);
        let (mut log, tmp) = add_under_root(&f.store, "referrer", Some(&target));
        let referrer = f.coordinator.commit(&mut log).unwrap().resolve(&tmp);

        let mut log = remove_from_root(&f.store, &[&target]);
        let err = f.coordinator.commit(&mut log).unwrap_err();
        assert!(matches!(err, StateError::ReferentialIntegrity { .. }));
        assert_eq!(log.state(), crate::changelog::LogState::Aborted);
        assert!(f.store.fetch_item(&ItemId::Node(target.clone())).unwrap().is_some());

        let mut log = remove_from_root(&f.store, &[&referrer, &target]);
        f.coordinator.commit(&mut log).unwrap();
        assert!(f.store.fetch_item(&ItemId::Node(target)).unwrap().is_none());
    }

    #[test]
    fn test_reference_to_missing_node_is_rejected() {
        let f = setup();
        let ghost = NodeId::generate();
        let (mut log, _) = add_under_root(&f.store, "a", Some(&ghost));

        let err = f.coordinator.commit(&mut log).unwrap_err();
        assert!(matches!(err, StateError::ReferentialIntegrity { ref target, .. } if target == &ghost));
        assert_eq!(f.store.commit_count(), 0);
    }

    #[test]
    fn test_stale_revision_is_concurrent_modification() {
        let f = setup();
        let (mut first, _) = add_under_root(&f.store, "a", None);
        let (mut second, _) = add_under_root(&f.store, "b", None);

        f.coordinator.commit(&mut first).unwrap();
        let err = f.coordinator.commit(&mut second).unwrap_err();
        assert!(matches!(err, StateError::ConcurrentModification { ref ids } if ids.len() == 1));
        assert!(err.is_retryable());
        assert_eq!(f.store.commit_count(), 1);
    }

    #[test]
    fn test_validator_rejection_aborts() {
        let f = setup();
        f.coordinator
            .add_validator(Arc::new(|log: &ChangeLog| -> Result<(), String> {
                if log.len() > 1 {
                    Err("too many changes".to_string())
                } else {
                    Ok(())
                }
            }));
        let (mut log, _) = add_under_root(&f.store, "a", None);

        let err = f.coordinator.commit(&mut log).unwrap_err();
        assert!(matches!(err, StateError::Validation(ref m) if m == "too many changes"));
        assert_eq!(f.store.commit_count(), 0);
    }

    #[test]
    fn test_abort_before_submission() {
        let f = setup();
        let (mut log, _) = add_under_root(&f.store, "a", None);
        f.coordinator.abort(&mut log).unwrap();
        assert!(f.coordinator.commit(&mut log).is_err());
        assert_eq!(f.store.commit_count(), 0);
    }

    fn add_property(owner: &NodeId, n: &str, value: Value) -> ChangeLog {
        let prop = PropertyState::new(PropertyId::new(owner.clone(), name(n)), Values::single(value)).unwrap();
        let mut log = ChangeLog::new();
        log.push(ChangeEntry::new(prop.id().clone().into(), Operation::AddProperty(prop), None))
            .unwrap();
        log.close().unwrap();
        log
    }

    #[test]
    fn test_disjoint_commits_do_not_wait_for_each_other() {
        let f = setup();
        let (mut log, tmp) = add_under_root(&f.store, "a", None);
        let a = f.coordinator.commit(&mut log).unwrap().resolve(&tmp);
        let (mut log, tmp) = add_under_root(&f.store, "b", None);
        let b = f.coordinator.commit(&mut log).unwrap().resolve(&tmp);

        // hold the commit of a/p inside validation until released
        let stalled = ItemId::Property(PropertyId::new(a.clone(), name("p")));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let gate = Mutex::new((entered_tx, release_rx));
        f.coordinator.add_validator(Arc::new(move |log: &ChangeLog| -> Result<(), String> {
            if log.item_ids().any(|id| id == &stalled) {
                let gate = gate.lock();
                gate.0.send(()).map_err(|e| e.to_string())?;
                gate.1
                    .recv_timeout(std::time::Duration::from_secs(10))
                    .map_err(|e| e.to_string())?;
            }
            Ok(())
        }));

        let coordinator = f.coordinator.clone();
        let slow = std::thread::spawn(move || {
            let mut log = add_property(&a, "p", Value::from("slow"));
            coordinator.commit(&mut log)
        });
        entered_rx.recv().unwrap();

        let mut fast = add_property(&b, "q", Value::from("fast"));
        f.coordinator.commit(&mut fast).unwrap();
        assert!(!slow.is_finished());
        assert_eq!(f.store.commit_count(), 3);

        release_tx.send(()).unwrap();
        slow.join().unwrap().unwrap();
        assert_eq!(f.store.commit_count(), 4);
    }

    #[test]
    fn test_claims_cover_strong_reference_targets() {
        let target = NodeId::generate();
        let owner = NodeId::generate();
        let log = add_property(&owner, "r", Value::Reference(target.clone()));
        let claimed = claimed_ids(&log);
        assert!(claimed.contains(&ItemId::Node(target)));

        let weak = add_property(&owner, "w", Value::WeakReference(NodeId::generate()));
        assert_eq!(claimed_ids(&weak).len(), 1);
    }

    #[test]
    fn test_reference_to_unsaved_node_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(ItemStateCache::new(PersistentLayer::new(store.clone()), &CacheConfig::default()));
        let coordinator = SaveCoordinator::with_reference_checks(cache, false);
        let placeholder = NodeId::transient();

        let mut log = add_property(&store.root_id(), "w", Value::WeakReference(placeholder.clone()));
        let err = coordinator.commit(&mut log).unwrap_err();
        assert!(matches!(err, StateError::ReferentialIntegrity { ref target, .. } if target == &placeholder));
        assert_eq!(store.commit_count(), 0);
    }
}
