use std::collections::HashSet;

use crate::tree::NodeId;

/// Enables history behavior for a composite state. When a state carrying
/// `History` is exited and later re-entered, it restores previously active
/// substates instead of resolving its initial child afresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// Remember only the direct child state that was active when last
    /// exited. On re-entry, restore that child and resolve initial-child
    /// logic normally from there on down.
    Shallow,
    /// Remember the entire hierarchy of substates that was active when
    /// last exited. On re-entry, restore the exact nested configuration.
    Deep,
}

/// Stores the previously active descendants for a single history-enabled
/// state. Owned by the engine, keyed by the history state's `NodeId`.
#[derive(Default, Clone)]
pub struct HistoryState(pub HashSet<NodeId>);

impl HistoryState {
    pub fn record(&mut self, active: impl IntoIterator<Item = NodeId>) {
        self.0.clear();
        self.0.extend(active);
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.0.contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn recording_replaces_previous_entry() {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        let a = map.insert(());
        let b = map.insert(());
        let mut history = HistoryState::default();
        history.record([a]);
        assert!(history.contains(a));
        history.record([b]);
        assert!(!history.contains(a));
        assert!(history.contains(b));
    }
}
