//! Item status and the transitions between statuses.
//!
//! Legality is checked here and nowhere else. The overlay and the save
//! coordinator go through [`ItemStatus::can_transition_to`] for every change;
//! only a discarding refresh bypasses it by dropping the local copy.

use std::fmt;

/// Status of an item state relative to the persisted baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ItemStatus {
    /// Created locally, never persisted.
    New,
    /// Matches the last known persisted value.
    #[default]
    Existing,
    /// Changed locally; persisted baseline known.
    ExistingModified,
    /// Removed locally; persisted baseline known.
    ExistingRemoved,
    /// Changed locally, but the baseline changed externally since.
    StaleModified,
    /// The baseline was removed externally while local changes exist.
    StaleDestroyed,
}

impl ItemStatus {
    /// Check whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: ItemStatus) -> bool {
        use ItemStatus::*;

        match (self, to) {
            (New, New | Existing | ExistingRemoved) => true,
            (Existing, ExistingModified | ExistingRemoved | StaleModified | StaleDestroyed) => true,
            (
                ExistingModified,
                ExistingModified | Existing | ExistingRemoved | StaleModified | StaleDestroyed,
            ) => true,
            (ExistingRemoved, Existing | StaleModified | StaleDestroyed) => true,
            (StaleModified, StaleDestroyed) => true,
            _ => false,
        }
    }

    /// Stale items cannot be saved or edited until refreshed.
    pub fn is_stale(&self) -> bool {
        matches!(self, ItemStatus::StaleModified | ItemStatus::StaleDestroyed)
    }

    /// check if the item carries local changes
    pub fn is_transient(&self) -> bool {
        !matches!(self, ItemStatus::Existing)
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, ItemStatus::ExistingRemoved)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::New => "NEW",
            ItemStatus::Existing => "EXISTING",
            ItemStatus::ExistingModified => "EXISTING_MODIFIED",
            ItemStatus::ExistingRemoved => "EXISTING_REMOVED",
            ItemStatus::StaleModified => "STALE_MODIFIED",
            ItemStatus::StaleDestroyed => "STALE_DESTROYED",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ItemStatus::*;

    #[test]
    fn test_save_cycle_transitions() {
        assert!(New.can_transition_to(Existing));
        assert!(Existing.can_transition_to(ExistingModified));
        assert!(ExistingModified.can_transition_to(Existing));
        assert!(ExistingModified.can_transition_to(StaleModified));
    }

    #[test]
    fn test_removal_from_any_live_state() {
        for from in [New, Existing, ExistingModified] {
            assert!(from.can_transition_to(ExistingRemoved), "{} -> removed", from);
        }
        for from in [Existing, ExistingModified, ExistingRemoved, StaleModified] {
            assert!(from.can_transition_to(StaleDestroyed), "{} -> destroyed", from);
        }
    }

    #[test]
    fn test_no_way_back_from_stale() {
        for to in [New, Existing, ExistingModified, ExistingRemoved, StaleModified] {
            assert!(!StaleDestroyed.can_transition_to(to));
        }
        assert!(!StaleModified.can_transition_to(Existing));
        assert!(!StaleModified.can_transition_to(ExistingModified));
        assert!(!StaleModified.can_transition_to(ExistingRemoved));
    }

    #[test]
    fn test_new_never_becomes_modified() {
        assert!(!New.can_transition_to(ExistingModified));
        assert!(!Existing.can_transition_to(New));
    }
}
