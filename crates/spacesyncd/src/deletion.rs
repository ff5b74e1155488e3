//! Deletion state
//!
//! Owns the set of tombstoned object ids for one space. The sync paths
//! only consult it: the filter keeps tombstoned objects from being
//! resurrected by a reconciliation round, and the event channel tells
//! subscribers to drop reconciliation state for freshly deleted objects.
//! Subscription is an explicit broadcast channel; consumers react to
//! published events rather than registering callbacks.

use parking_lot::RwLock;
use spacesync_core::types::ObjectId;
use std::collections::HashSet;
use tokio::sync::broadcast;

/// Published when an object is tombstoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeletionEvent {
    pub id: ObjectId,
}

/// Tombstone owner for one space.
pub struct DeletionState {
    deleted: RwLock<HashSet<ObjectId>>,
    events: broadcast::Sender<DeletionEvent>,
}

impl Default for DeletionState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeletionState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            deleted: RwLock::new(HashSet::new()),
            events,
        }
    }

    /// Tombstone an object and publish the event. Idempotent; repeat
    /// deletions publish nothing.
    pub fn add(&self, id: ObjectId) {
        let inserted = self.deleted.write().insert(id);
        if inserted {
            // No receivers is fine; the tombstone itself is the record
            let _ = self.events.send(DeletionEvent { id });
        }
    }

    /// Whether the id is tombstoned.
    pub fn exists(&self, id: &ObjectId) -> bool {
        self.deleted.read().contains(id)
    }

    /// Drop tombstoned ids, preserving the relative order of survivors.
    pub fn filter(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        let deleted = self.deleted.read();
        ids.iter()
            .filter(|id| !deleted.contains(id))
            .copied()
            .collect()
    }

    /// Subscribe to deletion events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeletionEvent> {
        self.events.subscribe()
    }
}
