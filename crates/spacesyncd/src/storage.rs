//! Persistent space-level storage using sled
//!
//! Holds what must survive a restart: space headers, the space-level
//! reconciliation fingerprint, the acl and settings root ids, and space
//! tombstones. Values are postcard-encoded.

use sled::Db;
use spacesync_core::types::*;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Space not found: {0}")]
    SpaceNotFound(SpaceId),
}

/// Storage backend for spacesyncd
pub struct SpaceStorage {
    db: Db,
    /// Header tree: space_id -> SpaceHeaderWithId
    headers: sled::Tree,
    /// Fingerprint tree: space_id -> aggregate hash
    hashes: sled::Tree,
    /// Acl root tree: space_id -> ObjectId
    acl_roots: sled::Tree,
    /// Settings root tree: space_id -> ObjectId
    settings_roots: sled::Tree,
    /// Tombstone tree: space_id -> ()
    tombstones: sled::Tree,
}

impl SpaceStorage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let headers = db.open_tree("space_headers")?;
        let hashes = db.open_tree("space_hashes")?;
        let acl_roots = db.open_tree("acl_roots")?;
        let settings_roots = db.open_tree("settings_roots")?;
        let tombstones = db.open_tree("space_tombstones")?;

        Ok(Self {
            db,
            headers,
            hashes,
            acl_roots,
            settings_roots,
            tombstones,
        })
    }

    /// Store the identifying material of a space (from creation or a
    /// bootstrap push). Idempotent: the header is content-addressed.
    pub fn register_space(&self, payload: &SpacePushPayload) -> Result<(), StoreError> {
        let key = payload.header.id.0;
        self.headers
            .insert(key, postcard::to_allocvec(&payload.header)?)?;
        self.acl_roots
            .insert(key, postcard::to_allocvec(&payload.acl_root_id)?)?;
        self.settings_roots
            .insert(key, postcard::to_allocvec(&payload.settings_root_id)?)?;
        Ok(())
    }

    /// Get a space header by id
    pub fn space_header(&self, space: &SpaceId) -> Result<SpaceHeaderWithId, StoreError> {
        match self.headers.get(space.0)? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Err(StoreError::SpaceNotFound(*space)),
        }
    }

    /// Check if a space is known
    pub fn has_space(&self, space: &SpaceId) -> Result<bool, StoreError> {
        Ok(self.headers.contains_key(space.0)?)
    }

    /// Get the acl root object id
    pub fn acl_root_id(&self, space: &SpaceId) -> Result<ObjectId, StoreError> {
        match self.acl_roots.get(space.0)? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Err(StoreError::SpaceNotFound(*space)),
        }
    }

    /// Get the settings root object id
    pub fn settings_root_id(&self, space: &SpaceId) -> Result<ObjectId, StoreError> {
        match self.settings_roots.get(space.0)? {
            Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
            None => Err(StoreError::SpaceNotFound(*space)),
        }
    }

    /// Persist the space-level reconciliation fingerprint
    pub fn write_space_hash(&self, space: &SpaceId, hash: &Bytes32) -> Result<(), StoreError> {
        self.hashes.insert(space.0, hash.as_slice())?;
        Ok(())
    }

    /// Read back the persisted fingerprint
    pub fn space_hash(&self, space: &SpaceId) -> Result<Option<Bytes32>, StoreError> {
        match self.hashes.get(space.0)? {
            Some(bytes) => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Tombstone a space. The header stays so pushes of a deleted space
    /// remain distinguishable from pushes of an unknown one.
    pub fn delete_space(&self, space: &SpaceId) -> Result<(), StoreError> {
        self.tombstones.insert(space.0, &[])?;
        self.hashes.remove(space.0)?;
        Ok(())
    }

    /// Check if a space is tombstoned
    pub fn is_space_deleted(&self, space: &SpaceId) -> Result<bool, StoreError> {
        Ok(self.tombstones.contains_key(space.0)?)
    }

    /// All known space ids
    pub fn space_ids(&self) -> Result<Vec<SpaceId>, StoreError> {
        let mut ids = Vec::new();
        for result in self.headers.iter() {
            let (key, _) = result?;
            let mut id = [0u8; 32];
            id.copy_from_slice(&key);
            ids.push(SpaceId(id));
        }
        Ok(ids)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// One space's view of the storage, as the sync orchestrator sees it.
pub struct SpaceStoreView {
    storage: Arc<SpaceStorage>,
    space: SpaceId,
}

impl SpaceStoreView {
    pub fn new(storage: Arc<SpaceStorage>, space: SpaceId) -> Self {
        Self { storage, space }
    }
}

impl crate::syncer::SpaceStore for SpaceStoreView {
    fn space_header(&self) -> Result<SpaceHeaderWithId, StoreError> {
        self.storage.space_header(&self.space)
    }

    fn acl_root_id(&self) -> Result<ObjectId, StoreError> {
        self.storage.acl_root_id(&self.space)
    }

    fn settings_root_id(&self) -> Result<ObjectId, StoreError> {
        self.storage.settings_root_id(&self.space)
    }

    fn write_space_hash(&self, hash: Bytes32) -> Result<(), StoreError> {
        self.storage.write_space_hash(&self.space, &hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn push_payload(seed: u8) -> SpacePushPayload {
        let raw = RawSpaceHeader {
            payload: vec![seed; 24],
            signature: vec![seed; 64],
        };
        SpacePushPayload {
            header: SpaceHeaderWithId {
                id: spacesync_core::crypto::derive_space_id(&raw),
                raw,
            },
            acl_root_id: ObjectId([seed + 1; 32]),
            settings_root_id: ObjectId([seed + 2; 32]),
        }
    }

    #[test]
    fn test_register_and_read_space() {
        let dir = tempdir().unwrap();
        let storage = SpaceStorage::open(dir.path()).unwrap();
        let payload = push_payload(1);
        let space = payload.header.id;

        assert!(!storage.has_space(&space).unwrap());
        assert!(matches!(
            storage.space_header(&space),
            Err(StoreError::SpaceNotFound(_))
        ));

        storage.register_space(&payload).unwrap();
        assert!(storage.has_space(&space).unwrap());
        assert_eq!(storage.space_header(&space).unwrap(), payload.header);
        assert_eq!(storage.acl_root_id(&space).unwrap(), payload.acl_root_id);
        assert_eq!(
            storage.settings_root_id(&space).unwrap(),
            payload.settings_root_id
        );
        assert_eq!(storage.space_ids().unwrap(), vec![space]);
    }

    #[test]
    fn test_space_hash_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = SpaceStorage::open(dir.path()).unwrap();
        let space = SpaceId([3; 32]);

        assert_eq!(storage.space_hash(&space).unwrap(), None);
        storage.write_space_hash(&space, &[42; 32]).unwrap();
        assert_eq!(storage.space_hash(&space).unwrap(), Some([42; 32]));
    }

    #[test]
    fn test_deleted_space_stays_known() {
        let dir = tempdir().unwrap();
        let storage = SpaceStorage::open(dir.path()).unwrap();
        let payload = push_payload(5);
        let space = payload.header.id;

        storage.register_space(&payload).unwrap();
        storage.write_space_hash(&space, &[1; 32]).unwrap();
        storage.delete_space(&space).unwrap();

        // Deleted is distinct from unknown
        assert!(storage.is_space_deleted(&space).unwrap());
        assert!(storage.has_space(&space).unwrap());
        assert_eq!(storage.space_hash(&space).unwrap(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let payload = push_payload(7);
        let space = payload.header.id;

        {
            let storage = SpaceStorage::open(dir.path()).unwrap();
            storage.register_space(&payload).unwrap();
            storage.write_space_hash(&space, &[9; 32]).unwrap();
            storage.flush().unwrap();
        }

        let storage = SpaceStorage::open(dir.path()).unwrap();
        assert_eq!(storage.space_header(&space).unwrap(), payload.header);
        assert_eq!(storage.space_hash(&space).unwrap(), Some([9; 32]));
    }
}
