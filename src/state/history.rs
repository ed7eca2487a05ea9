//! Linear undo/redo history.

use crate::types::Timestamp;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;

use super::action::{action_types, StateAction};
use super::document::StateDocument;

/// One committed state and the action that produced it.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub state: Arc<StateDocument>,
    pub action: StateAction,
    pub timestamp: Timestamp,
}

/// Ordered entries with a cursor at the current state.
///
/// Committing while the cursor is behind the tail discards the entries ahead
/// of it. The oldest entries fall off once `max_entries` is exceeded.
#[derive(Debug)]
pub(crate) struct History {
    entries: VecDeque<HistoryEntry>,
    cursor: usize,
    max_entries: usize,
}

impl History {
    pub fn new(initial: Arc<StateDocument>, max_entries: usize) -> Self {
        let mut entries = VecDeque::new();
        entries.push_back(HistoryEntry {
            state: initial,
            action: StateAction::new(action_types::INIT, Value::Null),
            timestamp: Timestamp::now(),
        });
        Self {
            entries,
            cursor: 0,
            max_entries: max_entries.max(1),
        }
    }

    pub fn commit(&mut self, state: Arc<StateDocument>, action: StateAction) {
        self.entries.truncate(self.cursor + 1);
        self.entries.push_back(HistoryEntry {
            state,
            action,
            timestamp: Timestamp::now(),
        });
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len() - 1;
    }

    pub fn undo(&mut self) -> Option<Arc<StateDocument>> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        Some(Arc::clone(&self.entries[self.cursor].state))
    }

    pub fn redo(&mut self) -> Option<Arc<StateDocument>> {
        if self.cursor + 1 >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        Some(Arc::clone(&self.entries[self.cursor].state))
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Apply `patches` to every entry, so moving the cursor never reverts
    /// them. `current` replaces the entry under the cursor.
    pub fn rebase(&mut self, patches: &Map<String, Value>, current: &Arc<StateDocument>) {
        let cursor = self.cursor;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.state = if i == cursor {
                Arc::clone(current)
            } else {
                Arc::new(entry.state.apply_patches(patches))
            };
        }
    }

    /// Drop everything except the current entry.
    pub fn clear(&mut self) {
        if let Some(current) = self.entries.remove(self.cursor) {
            self.entries.clear();
            self.entries.push_back(current);
        }
        self.cursor = 0;
    }
}
