//! Sessions: one overlay of local edits per logical user.

use std::sync::Arc;

use crate::changelog::{ChangeLog, SaveOutcome};
use crate::overlay::TransientOverlay;
use crate::state::{
    ItemId, ItemState, ItemStateManager, ItemStatus, Name, NodeId, NodeReferences, NodeType,
    PropertyId, StateError, StateResult, Values,
};
use crate::workspace::api::Workspace;

/// A unit of editing work against a workspace.
///
/// Reads see this session's uncommitted edits layered over the shared cache.
/// A session is not shared between threads; open one per thread instead.
pub struct Session {
    id: String,
    workspace: Workspace,
    overlay: TransientOverlay,
}

impl Session {
    pub(crate) fn new(workspace: Workspace, id: String) -> Self {
        let overlay = TransientOverlay::new(Arc::clone(workspace.cache()));
        Self { id, workspace, overlay }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn add_node(&mut self, parent: &NodeId, name: Name, node_type: NodeType) -> StateResult<NodeId> {
        self.overlay.add_node(parent, name, node_type)
    }

    pub fn add_property(&mut self, parent: &NodeId, name: Name, values: Values) -> StateResult<PropertyId> {
        self.overlay.add_property(parent, name, values)
    }

    pub fn set_property(&mut self, id: &PropertyId, values: Values) -> StateResult<()> {
        self.overlay.set_property(id, values)
    }

    pub fn remove_item(&mut self, id: &ItemId) -> StateResult<()> {
        self.overlay.remove_item(id)
    }

    pub fn reorder_children(&mut self, parent: &NodeId, child: &NodeId, before: Option<&NodeId>) -> StateResult<()> {
        self.overlay.reorder_children(parent, child, before)
    }

    /// See [`TransientOverlay::refresh`].
    pub fn refresh(&mut self, id: &ItemId, discard_local: bool) -> StateResult<()> {
        self.overlay.refresh(id, discard_local)
    }

    /// Save the local edits under `root`.
    pub fn save(&mut self, root: &NodeId) -> StateResult<SaveOutcome> {
        tracing::debug!(session = %self.id, %root, "saving");
        self.overlay.save(root, self.workspace.coordinator())
    }

    /// Save every local edit.
    pub fn save_all(&mut self) -> StateResult<SaveOutcome> {
        let root = self.workspace.root_id().clone();
        self.save(&root)
    }

    /// Close the edits under `root` into a log without submitting it.
    ///
    /// Items in the log stay frozen until [`Self::commit_prepared`] or
    /// [`Self::abort`] is called with it.
    pub fn prepare(&mut self, root: &NodeId) -> StateResult<ChangeLog> {
        self.overlay.build_change_log(root)
    }

    /// Commit a log returned by [`Self::prepare`].
    pub fn commit_prepared(&mut self, log: &mut ChangeLog) -> StateResult<SaveOutcome> {
        if log.is_empty() {
            self.workspace.coordinator().abort(log)?;
            return Ok(SaveOutcome::empty(log.id()));
        }
        match self.workspace.coordinator().commit(log) {
            Ok(outcome) => {
                self.overlay.complete_save(log, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.overlay.abort_save(log, &e);
                Err(e)
            }
        }
    }

    /// Cancel a prepared log. The local edits stay pending.
    pub fn abort(&mut self, log: &mut ChangeLog) -> StateResult<()> {
        self.workspace.coordinator().abort(log)?;
        self.overlay
            .abort_save(log, &StateError::invalid(format!("save {} cancelled", log.id())));
        Ok(())
    }

    pub fn has_pending_changes(&self) -> bool {
        self.overlay.has_pending_changes()
    }

    pub fn pending(&self) -> Vec<(ItemId, ItemStatus)> {
        self.overlay.pending()
    }

    pub fn status_of(&self, id: &ItemId) -> Option<ItemStatus> {
        self.overlay.status_of(id)
    }
}

impl ItemStateManager for Session {
    fn root_state(&self) -> StateResult<Arc<ItemState>> {
        self.overlay.root_state()
    }

    fn item_state(&self, id: &ItemId) -> StateResult<Arc<ItemState>> {
        self.overlay.item_state(id)
    }

    fn has_item_state(&self, id: &ItemId) -> bool {
        self.overlay.has_item_state(id)
    }

    fn node_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        self.overlay.node_references(target)
    }

    fn has_node_references(&self, target: &NodeId) -> bool {
        self.overlay.has_node_references(target)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.overlay.has_pending_changes() {
            tracing::warn!(session = %self.id, pending = self.overlay.pending().len(), "session dropped with unsaved changes");
        }
        self.workspace.mark_completed(&self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pending", &self.overlay.pending().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use crate::cache::ChangeEvent;
    use crate::changelog::Operation;
    use crate::state::Value;
    use crate::workspace::WorkspaceConfig;

    fn name(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    #[test]
    fn test_add_save_and_external_invalidation() {
        let ws = Workspace::in_memory().unwrap();
        let root = ws.root_id().clone();
        let mut session = ws.session();

        let a = session.add_node(&root, name("A"), NodeType::unstructured()).unwrap();
        assert_eq!(session.status_of(&ItemId::Node(a.clone())), Some(ItemStatus::New));
        let p = session.add_property(&a, name("p"), Values::single("x")).unwrap();
        assert_eq!(p.parent, a);

        let outcome = session.save_all().unwrap();
        assert_eq!(outcome.assigned.len(), 1);
        let a = outcome.resolve(&a);
        assert!(!a.is_transient());

        let cache = ws.cache();
        let node = cache.node_state(&a).unwrap();
        assert_eq!(node.status(), ItemStatus::Existing);
        assert!(node.has_property(&name("p")));
        let prop = cache.property_state(&PropertyId::new(a.clone(), name("p"))).unwrap();
        assert_eq!(prop.value(), Some(&Value::from("x")));
        assert_eq!(prop.status(), ItemStatus::Existing);

        let misses = cache.stats().misses;
        cache.node_state(&a).unwrap();
        assert_eq!(cache.stats().misses, misses);

        ws.invalidation_sender().send(ChangeEvent::modified(a.clone())).unwrap();
        cache.node_state(&a).unwrap();
        assert_eq!(cache.stats().misses, misses + 1);
    }

    #[test]
    fn test_round_trip_matches_pre_commit_view() {
        let ws = Workspace::in_memory().unwrap();
        let root = ws.root_id().clone();
        let mut session = ws.session();

        let a = session.add_node(&root, name("a"), NodeType::unstructured()).unwrap();
        let b = session.add_node(&a, name("b"), NodeType::unstructured()).unwrap();
        session.add_property(&b, name("n"), Values::single(42i64)).unwrap();
        session
            .add_property(&a, name("tags"), Values::multiple(crate::state::ValueKind::String, vec!["x".into(), "y".into()]))
            .unwrap();

        let before_b = session.node_state(&b).unwrap();
        let outcome = session.save_all().unwrap();
        let (a, b) = (outcome.resolve(&a), outcome.resolve(&b));

        let committed_a = ws.cache().node_state(&a).unwrap();
        assert_eq!(committed_a.children().ids().cloned().collect::<Vec<_>>(), vec![b.clone()]);
        let committed_b = ws.cache().node_state(&b).unwrap();
        assert_eq!(committed_b.parent(), Some(&a));
        assert_eq!(
            committed_b.property_names().collect::<Vec<_>>(),
            before_b.property_names().collect::<Vec<_>>()
        );
        let tags = ws.cache().property_state(&PropertyId::new(a.clone(), name("tags"))).unwrap();
        assert_eq!(tags.values(), &[Value::from("x"), Value::from("y")]);

        for id in [ItemId::Node(root), ItemId::Node(a), ItemId::Node(b)] {
            assert_eq!(session.status_of(&id), Some(ItemStatus::Existing));
        }
    }

    #[test]
    fn test_referential_integrity_on_removal() {
        let ws = Workspace::in_memory().unwrap();
        let root = ws.root_id().clone();
        let mut session = ws.session();
        let target = session.add_node(&root, name("target"), NodeType::unstructured()).unwrap();
        let holder = session.add_node(&root, name("holder"), NodeType::unstructured()).unwrap();
        session
            .add_property(&holder, name("ref"), Values::single(Value::Reference(target.clone())))
            .unwrap();
        let outcome = session.save_all().unwrap();
        let (target, holder) = (outcome.resolve(&target), outcome.resolve(&holder));

        session.remove_item(&ItemId::Node(target.clone())).unwrap();
        let err = session.save_all().unwrap_err();
        assert!(matches!(err, StateError::ReferentialIntegrity { .. }));
        assert!(ws.cache().has_item_state(&ItemId::Node(target.clone())));

        session.remove_item(&ItemId::Node(holder.clone())).unwrap();
        session.save_all().unwrap();
        assert!(!ws.cache().has_item_state(&ItemId::Node(target)));
        assert!(!ws.cache().has_item_state(&ItemId::Node(holder)));
    }

    #[test]
    fn test_refresh_discard_restores_committed_view() {
        let ws = Workspace::in_memory().unwrap();
        let root = ws.root_id().clone();
        let mut session = ws.session();
        let a = session.add_node(&root, name("a"), NodeType::unstructured()).unwrap();
        let p = session.add_property(&a, name("p"), Values::single("x")).unwrap();
        let outcome = session.save_all().unwrap();
        let (a, p) = (outcome.resolve(&a), PropertyId::new(outcome.resolve(&p.parent), p.name));

        session.set_property(&p, Values::single("changed")).unwrap();
        let extra = session.add_node(&a, name("extra"), NodeType::unstructured()).unwrap();
        assert!(session.has_pending_changes());

        session.refresh(&ItemId::Node(a.clone()), true).unwrap();
        assert!(!session.has_pending_changes());
        assert_eq!(session.status_of(&ItemId::Node(extra)), None);
        assert_eq!(session.node_state(&a).unwrap(), ws.cache().node_state(&a).unwrap());
        assert_eq!(session.property_state(&p).unwrap().value(), Some(&Value::from("x")));
    }

    #[test]
    fn test_prepare_then_abort_keeps_edits() {
        let ws = Workspace::in_memory().unwrap();
        let root = ws.root_id().clone();
        let mut session = ws.session();
        session.add_node(&root, name("a"), NodeType::unstructured()).unwrap();

        let mut log = session.prepare(&root).unwrap();
        assert!(session.add_node(&root, name("b"), NodeType::unstructured()).is_err());
        session.abort(&mut log).unwrap();
        assert_eq!(log.state(), crate::changelog::LogState::Aborted);

        session.add_node(&root, name("b"), NodeType::unstructured()).unwrap();
        let mut log = session.prepare(&root).unwrap();
        let outcome = session.commit_prepared(&mut log).unwrap();
        assert_eq!(outcome.assigned.len(), 2);
        assert!(!session.has_pending_changes());
    }

    #[test]
    fn test_empty_save_is_a_no_op() {
        let ws = Workspace::in_memory().unwrap();
        let mut session = ws.session();
        let outcome = session.save_all().unwrap();
        assert!(outcome.is_empty());
    }

    #[test]
    fn test_concurrent_disjoint_sessions_do_not_block() {
        // saves that modify a property named `p` wait in validation until released
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let gate = parking_lot::Mutex::new((entered_tx, release_rx));
        let ws = Workspace::in_memory()
            .unwrap()
            .with_validator(move |log: &ChangeLog| -> Result<(), String> {
                let stalls = log.entries().iter().any(|e| {
                    matches!(&e.operation, Operation::ModifyProperty(p) if p.name().as_str() == "p")
                });
                if stalls {
                    let gate = gate.lock();
                    gate.0.send(()).map_err(|e| e.to_string())?;
                    gate.1.recv_timeout(Duration::from_secs(10)).map_err(|e| e.to_string())?;
                }
                Ok(())
            });

        let root = ws.root_id().clone();
        let mut setup = ws.session();
        let a = setup.add_node(&root, name("a"), NodeType::unstructured()).unwrap();
        let pa = setup.add_property(&a, name("p"), Values::single(0i64)).unwrap();
        let pb = setup.add_property(&a, name("q"), Values::single(0i64)).unwrap();
        let outcome = setup.save_all().unwrap();
        let a = outcome.resolve(&a);
        let (pa, pb) = (PropertyId::new(a.clone(), pa.name), PropertyId::new(a.clone(), pb.name));

        let slow = {
            let (ws, root, pa) = (ws.clone(), root.clone(), pa.clone());
            thread::spawn(move || {
                let mut session = ws.session();
                session.set_property(&pa, Values::single(1i64)).unwrap();
                session.save(&root)
            })
        };
        entered_rx.recv().unwrap();

        let mut fast = ws.session();
        fast.set_property(&pb, Values::single(2i64)).unwrap();
        fast.save(&root).unwrap();
        assert!(!slow.is_finished());
        assert_eq!(ws.cache().property_state(&pb).unwrap().value(), Some(&Value::Long(2)));

        release_tx.send(()).unwrap();
        slow.join().unwrap().unwrap();
        assert_eq!(ws.cache().property_state(&pa).unwrap().value(), Some(&Value::Long(1)));
    }

    #[test]
    fn test_overlapping_sessions_second_committer_conflicts() {
        let ws = Workspace::in_memory().unwrap();
        let root = ws.root_id().clone();
        let mut first = ws.session();
        let p = first.add_property(&root, name("counter"), Values::single(0i64)).unwrap();
        first.save_all().unwrap();

        let mut second = ws.session();
        first.set_property(&p, Values::single(1i64)).unwrap();
        second.set_property(&p, Values::single(2i64)).unwrap();

        first.save_all().unwrap();
        let err = second.save_all().unwrap_err();
        assert!(matches!(err, StateError::ConcurrentModification { ref ids } if ids == &[ItemId::Property(p.clone())]));
        assert!(err.is_retryable());
        assert_eq!(second.status_of(&ItemId::Property(p.clone())), Some(ItemStatus::StaleModified));

        second.refresh(&ItemId::Property(p.clone()), true).unwrap();
        second.set_property(&p, Values::single(2i64)).unwrap();
        second.save_all().unwrap();
        assert_eq!(ws.cache().property_state(&p).unwrap().value(), Some(&Value::Long(2)));
    }

    #[test]
    fn test_git_sessions_see_each_other() {
        let dir = tempfile::TempDir::new().unwrap();
        let ws = Workspace::open_git(WorkspaceConfig::new(dir.path())).unwrap();
        let root = ws.root_id().clone();

        let mut writer = ws.session();
        let reader = ws.session();
        let a = writer.add_node(&root, name("a"), NodeType::unstructured()).unwrap();
        assert!(!reader.has_item_state(&ItemId::Node(a.clone())));

        let a = writer.save_all().unwrap().resolve(&a);
        assert!(reader.has_item_state(&ItemId::Node(a.clone())));
        assert!(reader.root_state().unwrap().as_node().unwrap().children().contains(&a));
    }
}
