//! Per-object change-DAG storage
//!
//! One storage instance per object: the content-addressed change set, the
//! current frontier ("heads"), and change ids referenced as parents but
//! not yet retrievable ("orphans"). Every mutating operation takes the
//! object's write lock, every read its read lock, and any collection that
//! escapes the lock boundary is a copy.

use parking_lot::RwLock;
use spacesync_core::crypto::{derive_object_id, raw_change_from_signed};
use spacesync_core::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Change-DAG storage errors
#[derive(Debug, Error)]
pub enum DagError {
    /// The signal the retrieval layer uses to know a change must be
    /// requested from a peer
    #[error("change not found: {0}")]
    NotFound(ChangeId),
    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),
    #[error("object already registered: {0}")]
    AlreadyRegistered(ObjectId),
    #[error("core error: {0}")]
    Core(#[from] spacesync_core::Error),
}

/// Storage contract for one object's change DAG.
pub trait ObjectStorage: Send + Sync {
    /// Stable identifier, fixed at creation.
    fn id(&self) -> ObjectId;

    /// Immutable metadata.
    fn header(&self) -> ObjectHeader;

    /// Snapshot copy of the current frontier.
    fn heads(&self) -> Vec<ChangeId>;

    /// Replace the entire frontier atomically.
    fn set_heads(&self, new_heads: &[ChangeId]);

    /// Snapshot copy of the unresolved-parent set.
    fn orphans(&self) -> Vec<ChangeId>;

    fn add_orphans(&self, ids: &[ChangeId]);

    fn remove_orphans(&self, ids: &[ChangeId]);

    /// Idempotent upsert keyed by the content-derived id.
    fn add_raw_change(&self, change: RawChange);

    /// Encode a structured change and store it via the raw path.
    /// An encoding failure leaves storage unmutated.
    fn add_change(&self, change: &SignedChange) -> Result<RawChange, DagError>;

    fn get_change(&self, id: &ChangeId) -> Result<RawChange, DagError>;
}

struct DagState {
    changes: HashMap<ChangeId, RawChange>,
    heads: Vec<ChangeId>,
    orphans: Vec<ChangeId>,
}

/// In-memory object storage guarded by one reader/writer lock.
pub struct InMemoryObjectStorage {
    id: ObjectId,
    header: ObjectHeader,
    state: RwLock<DagState>,
}

impl InMemoryObjectStorage {
    /// Create storage for a new object rooted at `first_change`.
    pub fn create(
        space: SpaceId,
        kind: ObjectKind,
        first_change: RawChange,
    ) -> Result<Self, DagError> {
        let header = ObjectHeader {
            space,
            first_change: first_change.id,
            kind,
        };
        let id = derive_object_id(&header)?;

        let mut changes = HashMap::new();
        let heads = vec![first_change.id];
        changes.insert(first_change.id, first_change);

        Ok(Self {
            id,
            header,
            state: RwLock::new(DagState {
                changes,
                heads,
                orphans: Vec::new(),
            }),
        })
    }

    /// The id of the root change (also recorded in the header).
    pub fn root_id(&self) -> ChangeId {
        self.header.first_change
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn header(&self) -> ObjectHeader {
        self.header.clone()
    }

    fn heads(&self) -> Vec<ChangeId> {
        self.state.read().heads.clone()
    }

    fn set_heads(&self, new_heads: &[ChangeId]) {
        let mut state = self.state.write();
        state.heads.clear();
        state.heads.extend_from_slice(new_heads);
    }

    fn orphans(&self) -> Vec<ChangeId> {
        self.state.read().orphans.clone()
    }

    fn add_orphans(&self, ids: &[ChangeId]) {
        let mut state = self.state.write();
        state.orphans.extend_from_slice(ids);
    }

    fn remove_orphans(&self, ids: &[ChangeId]) {
        let mut state = self.state.write();
        state.orphans.retain(|o| !ids.contains(o));
    }

    fn add_raw_change(&self, change: RawChange) {
        // Content-derived id: concurrent duplicate inserts are byte-identical
        self.state.write().changes.insert(change.id, change);
    }

    fn add_change(&self, change: &SignedChange) -> Result<RawChange, DagError> {
        let raw = raw_change_from_signed(change)?;
        self.add_raw_change(raw.clone());
        Ok(raw)
    }

    fn get_change(&self, id: &ChangeId) -> Result<RawChange, DagError> {
        self.state
            .read()
            .changes
            .get(id)
            .cloned()
            .ok_or(DagError::NotFound(*id))
    }
}

/// Registry of object storages for one space.
pub trait StorageProvider: Send + Sync {
    fn object_storage(&self, id: &ObjectId) -> Result<Arc<dyn ObjectStorage>, DagError>;

    fn insert(&self, storage: Arc<dyn ObjectStorage>) -> Result<(), DagError>;

    fn object_ids(&self) -> Vec<ObjectId>;
}

/// In-memory object registry.
#[derive(Default)]
pub struct InMemoryStorageProvider {
    objects: RwLock<HashMap<ObjectId, Arc<dyn ObjectStorage>>>,
}

impl InMemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageProvider for InMemoryStorageProvider {
    fn object_storage(&self, id: &ObjectId) -> Result<Arc<dyn ObjectStorage>, DagError> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or(DagError::UnknownObject(*id))
    }

    fn insert(&self, storage: Arc<dyn ObjectStorage>) -> Result<(), DagError> {
        let mut objects = self.objects.write();
        let id = storage.id();
        if objects.contains_key(&id) {
            return Err(DagError::AlreadyRegistered(id));
        }
        objects.insert(id, storage);
        Ok(())
    }

    fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spacesync_core::crypto::{derive_change_id, verify_change_id};

    fn raw_change(data: &[u8]) -> RawChange {
        let payload = data.to_vec();
        RawChange {
            id: derive_change_id(&payload),
            payload,
            signature: vec![0; 64],
        }
    }

    fn test_storage() -> InMemoryObjectStorage {
        InMemoryObjectStorage::create(SpaceId([1; 32]), ObjectKind::Document, raw_change(b"root"))
            .unwrap()
    }

    #[test]
    fn test_create_roots_frontier() {
        let storage = test_storage();
        let root = storage.root_id();

        assert_eq!(storage.heads(), vec![root]);
        assert_eq!(storage.header().first_change, root);
        assert!(storage.get_change(&root).is_ok());
    }

    #[test]
    fn test_set_heads_replaces_completely() {
        let storage = test_storage();
        let h1 = ChangeId([10; 32]);
        let h2 = ChangeId([11; 32]);
        let h3 = ChangeId([12; 32]);

        storage.set_heads(&[h1, h2]);
        assert_eq!(storage.heads(), vec![h1, h2]);

        // No prior head ids leak into a later replacement
        storage.set_heads(&[h3]);
        assert_eq!(storage.heads(), vec![h3]);
    }

    #[test]
    fn test_heads_snapshot_is_not_an_alias() {
        let storage = test_storage();
        storage.set_heads(&[ChangeId([1; 32])]);

        let snapshot = storage.heads();
        storage.set_heads(&[ChangeId([2; 32])]);

        assert_eq!(snapshot, vec![ChangeId([1; 32])]);
    }

    #[test]
    fn test_add_raw_change_idempotent() {
        let storage = test_storage();
        let change = raw_change(b"op-1");

        storage.add_raw_change(change.clone());
        storage.add_raw_change(change.clone());

        assert_eq!(storage.get_change(&change.id).unwrap(), change);
    }

    #[test]
    fn test_get_change_not_found() {
        let storage = test_storage();
        let missing = ChangeId([99; 32]);

        assert!(matches!(
            storage.get_change(&missing),
            Err(DagError::NotFound(id)) if id == missing
        ));
    }

    #[test]
    fn test_add_change_derives_verifiable_id() {
        let storage = test_storage();
        let signed = SignedChange {
            body: ChangeBody {
                object: storage.id(),
                prev_ids: vec![storage.root_id()],
                author: [5; 32],
                timestamp_ms: 42,
                data: b"edit".to_vec(),
            },
            signature: vec![7; 64],
        };

        let raw = storage.add_change(&signed).unwrap();
        verify_change_id(&raw).unwrap();
        assert_eq!(storage.get_change(&raw.id).unwrap(), raw);
    }

    #[test]
    fn test_orphan_lifecycle() {
        let storage = test_storage();
        let o1 = ChangeId([21; 32]);
        let o2 = ChangeId([22; 32]);
        let o3 = ChangeId([23; 32]);

        storage.add_orphans(&[o1, o2]);
        storage.add_orphans(&[o3]);
        assert_eq!(storage.orphans(), vec![o1, o2, o3]);

        storage.remove_orphans(&[o2]);
        assert_eq!(storage.orphans(), vec![o1, o3]);
    }

    #[test]
    fn test_concurrent_distinct_inserts_never_drop() {
        let storage = Arc::new(test_storage());
        let mut handles = Vec::new();

        for t in 0..8u8 {
            let storage = storage.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u32 {
                    let mut data = vec![t];
                    data.extend_from_slice(&i.to_le_bytes());
                    storage.add_raw_change(raw_change(&data));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..8u8 {
            for i in 0..100u32 {
                let mut data = vec![t];
                data.extend_from_slice(&i.to_le_bytes());
                let id = derive_change_id(&data);
                assert!(storage.get_change(&id).is_ok());
            }
        }
    }

    #[test]
    fn test_provider_registry() {
        let provider = InMemoryStorageProvider::new();
        let storage = Arc::new(test_storage());
        let id = storage.id();

        assert!(matches!(
            provider.object_storage(&id),
            Err(DagError::UnknownObject(_))
        ));

        provider.insert(storage.clone()).unwrap();
        assert_eq!(provider.object_storage(&id).unwrap().id(), id);
        assert!(matches!(
            provider.insert(storage),
            Err(DagError::AlreadyRegistered(_))
        ));
    }
}
