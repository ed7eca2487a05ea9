//! Named snapshots, independent of the history.

use crate::types::{SnapshotId, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

use super::document::StateDocument;

/// A labelled copy of the document at a point in time.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub label: String,
    pub state: Arc<StateDocument>,
    pub timestamp: Timestamp,
}

#[derive(Debug)]
pub(crate) struct SnapshotRegistry {
    snapshots: VecDeque<Snapshot>,
    next_id: u64,
    max_snapshots: usize,
}

impl SnapshotRegistry {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: VecDeque::new(),
            next_id: 1,
            max_snapshots: max_snapshots.max(1),
        }
    }

    pub fn create(&mut self, label: String, state: Arc<StateDocument>) -> Snapshot {
        let snapshot = Snapshot {
            id: SnapshotId(self.next_id),
            label,
            state,
            timestamp: Timestamp::now(),
        };
        self.next_id += 1;
        self.snapshots.push_back(snapshot.clone());

        while self.snapshots.len() > self.max_snapshots {
            if let Some(dropped) = self.snapshots.pop_front() {
                tracing::debug!(snapshot = %dropped.id, label = %dropped.label, "Dropped oldest snapshot");
            }
        }
        snapshot
    }

    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub fn list(&self) -> Vec<Snapshot> {
        self.snapshots.iter().cloned().collect()
    }

    pub fn remove(&mut self, id: SnapshotId) -> bool {
        match self.snapshots.iter().position(|s| s.id == id) {
            Some(pos) => self.snapshots.remove(pos).is_some(),
            None => false,
        }
    }
}
