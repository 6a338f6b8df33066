//! External change notifications.
//!
//! Providers publish one [`ChangeEvent`] per committed item change. Caches
//! consume them from a plain `mpsc` channel, in delivery order.

use std::fmt;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;

use crate::state::ItemId;

/// What happened to an item in the persisted tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// A single external change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub id: ItemId,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(id: impl Into<ItemId>, kind: ChangeKind) -> Self {
        Self { id: id.into(), kind }
    }

    pub fn added(id: impl Into<ItemId>) -> Self {
        Self::new(id, ChangeKind::Added)
    }

    pub fn modified(id: impl Into<ItemId>) -> Self {
        Self::new(id, ChangeKind::Modified)
    }

    pub fn removed(id: impl Into<ItemId>) -> Self {
        Self::new(id, ChangeKind::Removed)
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Handle for delivering change events to one cache.
pub type InvalidationSender = Sender<ChangeEvent>;

/// Fan-out of change events to every subscribed feed.
///
/// Feeds whose receiver was dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    feeds: Mutex<Vec<InvalidationSender>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, feed: InvalidationSender) {
        self.feeds.lock().push(feed);
    }

    /// Deliver `events` to every feed, in order.
    pub fn publish(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let mut feeds = self.feeds.lock();
        feeds.retain(|feed| events.iter().all(|event| feed.send(event.clone()).is_ok()));
        tracing::debug!(events = events.len(), feeds = feeds.len(), "published change events");
    }

    pub fn subscriber_count(&self) -> usize {
        self.feeds.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    use crate::state::NodeId;

    #[test]
    fn test_publish_in_order() {
        let notifier = ChangeNotifier::new();
        let (tx, rx) = channel();
        notifier.subscribe(tx);

        let id = NodeId::generate();
        notifier.publish(&[ChangeEvent::added(id.clone()), ChangeEvent::modified(id.clone())]);

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].kind, ChangeKind::Added);
        assert_eq!(received[1].kind, ChangeKind::Modified);
        assert_eq!(received[1].to_string(), format!("modified {}", id));
    }

    #[test]
    fn test_disconnected_feeds_pruned() {
        let notifier = ChangeNotifier::new();
        let (tx1, rx1) = channel();
        let (tx2, _rx2) = channel();
        notifier.subscribe(tx1);
        notifier.subscribe(tx2);
        drop(rx1);

        notifier.publish(&[ChangeEvent::removed(NodeId::generate())]);
        assert_eq!(notifier.subscriber_count(), 1);
    }
}
