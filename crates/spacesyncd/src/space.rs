//! Per-space assembly
//!
//! Builds one space's sync stack: object registry, diff container, and
//! orchestrator, wired to the shared storage and the per-space deletion
//! state. All collaborators are constructed explicitly and injected; no
//! process-wide registries.

use crate::container::DiffContainer;
use crate::dag::{DagError, InMemoryObjectStorage, InMemoryStorageProvider, ObjectStorage, StorageProvider};
use crate::deletion::DeletionState;
use crate::storage::{SpaceStorage, SpaceStoreView};
use crate::syncer::{
    AclSyncer, CredentialProvider, DiffSyncer, PeerProvider, SyncError, TreeSyncer,
};
use async_trait::async_trait;
use spacesync_core::canonical::canonical_bytes;
use spacesync_core::crypto::{credential_sign_bytes, derive_change_id, derive_space_id};
use spacesync_core::types::*;
use spacesync_net::crypto::KeyPair;
use spacesync_net::peer::PeerId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One replicated space: its object DAGs and its sync machinery.
pub struct SpaceSync {
    id: SpaceId,
    container: Arc<DiffContainer>,
    objects: Arc<dyn StorageProvider>,
    deletion: Arc<DeletionState>,
    syncer: Arc<DiffSyncer>,
}

impl SpaceSync {
    /// Assemble the sync stack for a space already present in storage.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SpaceId,
        storage: Arc<SpaceStorage>,
        objects: Arc<dyn StorageProvider>,
        deletion: Arc<DeletionState>,
        peers: Arc<dyn PeerProvider>,
        credentials: Arc<dyn CredentialProvider>,
        tree_syncer: Arc<dyn TreeSyncer>,
        acl: Arc<dyn AclSyncer>,
    ) -> Self {
        let container = Arc::new(DiffContainer::new());
        let store = Arc::new(SpaceStoreView::new(storage, id));
        let syncer = Arc::new(DiffSyncer::new(
            id,
            container.clone(),
            store,
            peers,
            deletion.clone(),
            credentials,
            tree_syncer,
            acl,
        ));

        let space = Self {
            id,
            container,
            objects,
            deletion,
            syncer,
        };
        space.seed_container();
        space
    }

    /// Fill the container from the registered objects' frontiers. Writes
    /// the fingerprint only when something was seeded, so a fresh restart
    /// with no objects keeps the persisted hash.
    fn seed_container(&self) {
        let ids = self.objects.object_ids();
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            if let Ok(object) = self.objects.object_storage(id) {
                self.syncer.update_heads(*id, &object.heads());
            }
        }
        debug!("seeded {} elements for space {}", ids.len(), self.id);
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn syncer(&self) -> Arc<DiffSyncer> {
        self.syncer.clone()
    }

    pub fn container(&self) -> Arc<DiffContainer> {
        self.container.clone()
    }

    /// Run one reconciliation round.
    pub async fn sync(&self) -> Result<(), SyncError> {
        self.syncer.sync().await
    }

    /// Evaluate ranges for an inbound diff request.
    pub fn ranges(&self, ranges: &[DiffRange]) -> Vec<RangeResult> {
        self.container.precalculated_diff().ranges(ranges)
    }

    /// Register a new object and fold its frontier into the diff.
    pub fn add_object(&self, object: Arc<dyn ObjectStorage>) -> Result<(), DagError> {
        let id = object.id();
        let heads = object.heads();
        self.objects.insert(object)?;
        self.syncer.update_heads(id, &heads);
        Ok(())
    }

    /// Apply a local frontier change: storage first, then the
    /// reconciliation state, so a concurrent sync reading the container
    /// never observes heads storage has not committed.
    pub fn update_heads(&self, id: ObjectId, heads: &[ChangeId]) -> Result<(), DagError> {
        if heads.is_empty() {
            return Err(spacesync_core::Error::EmptyHeads.into());
        }
        let object = self.objects.object_storage(&id)?;
        object.set_heads(heads);
        self.syncer.update_heads(id, heads);
        Ok(())
    }

    /// Tombstone an object. The deletion listener drops its element.
    pub fn tombstone_object(&self, id: ObjectId) {
        self.deletion.add(id);
    }

    /// React to published deletion events until the space is dropped.
    pub fn start_deletion_listener(&self) -> JoinHandle<()> {
        let mut events = self.deletion.subscribe();
        let syncer = self.syncer.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                syncer.remove_objects(&[event.id]);
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Space creation
// ---------------------------------------------------------------------------

/// Everything a freshly created space consists of.
pub struct SpaceInit {
    pub push: SpacePushPayload,
    pub acl: Arc<InMemoryObjectStorage>,
    pub settings: Arc<InMemoryObjectStorage>,
}

/// Create the identity material of a new space: signed header, acl root,
/// and settings root.
pub fn create_space(owner: &KeyPair, seed: Bytes32, timestamp_ms: u64) -> Result<SpaceInit, DagError> {
    let header = SpaceHeader {
        owner: owner.public_key(),
        timestamp_ms,
        seed,
    };
    let payload = canonical_bytes(&header)?;
    let signature = owner.sign(&payload).to_vec();
    let raw = RawSpaceHeader { payload, signature };
    let space_id = derive_space_id(&raw);
    let header = SpaceHeaderWithId { id: space_id, raw };

    let acl = Arc::new(InMemoryObjectStorage::create(
        space_id,
        ObjectKind::Acl,
        root_change(owner, space_id, b"acl-root", timestamp_ms),
    )?);
    let settings = Arc::new(InMemoryObjectStorage::create(
        space_id,
        ObjectKind::Settings,
        root_change(owner, space_id, b"settings-root", timestamp_ms),
    )?);

    Ok(SpaceInit {
        push: SpacePushPayload {
            header,
            acl_root_id: acl.id(),
            settings_root_id: settings.id(),
        },
        acl,
        settings,
    })
}

fn root_change(owner: &KeyPair, space: SpaceId, tag: &[u8], timestamp_ms: u64) -> RawChange {
    let mut payload = space.0.to_vec();
    payload.extend_from_slice(tag);
    payload.extend_from_slice(&timestamp_ms.to_le_bytes());
    RawChange {
        id: derive_change_id(&payload),
        signature: owner.sign(&payload).to_vec(),
        payload,
    }
}

// ---------------------------------------------------------------------------
// Daemon-side collaborators
// ---------------------------------------------------------------------------

/// Credential provider backed by the node key: the credential is the
/// node's signature over the header, verifiable by the push receiver.
pub struct KeyCredentialProvider {
    keypair: KeyPair,
}

impl KeyCredentialProvider {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl CredentialProvider for KeyCredentialProvider {
    async fn get_credential(&self, header: &SpaceHeaderWithId) -> Result<Vec<u8>, SyncError> {
        Ok(self.keypair.sign(&credential_sign_bytes(header)).to_vec())
    }
}

/// A batch of ids one peer should be asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalBatch {
    pub peer: PeerId,
    pub changed: Vec<ObjectId>,
    pub new: Vec<ObjectId>,
}

/// Tree syncer handing id batches to an external retrieval worker over a
/// queue. The daemon core decides WHAT to fetch; pulling change payloads
/// is the consumer's job.
pub struct QueueTreeSyncer {
    queue: mpsc::UnboundedSender<RetrievalBatch>,
}

impl QueueTreeSyncer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RetrievalBatch>) {
        let (queue, rx) = mpsc::unbounded_channel();
        (Self { queue }, rx)
    }
}

#[async_trait]
impl TreeSyncer for QueueTreeSyncer {
    async fn sync_all(
        &self,
        peer: PeerId,
        changed: Vec<ObjectId>,
        new: Vec<ObjectId>,
    ) -> Result<(), SyncError> {
        if changed.is_empty() && new.is_empty() {
            return Ok(());
        }
        info!(
            "queueing retrieval from {}: {} changed, {} new",
            peer,
            changed.len(),
            new.len()
        );
        self.queue
            .send(RetrievalBatch { peer, changed, new })
            .map_err(|_| SyncError::Retrieval("retrieval worker gone".into()))
    }
}

/// Acl collaborator delegating to the retrieval path with priority: the
/// acl DAG is fetched on its own before ordinary objects.
pub struct AclState {
    id: ObjectId,
    tree_syncer: Arc<dyn TreeSyncer>,
}

impl AclState {
    pub fn new(id: ObjectId, tree_syncer: Arc<dyn TreeSyncer>) -> Self {
        Self { id, tree_syncer }
    }
}

#[async_trait]
impl AclSyncer for AclState {
    fn id(&self) -> ObjectId {
        self.id
    }

    async fn sync_with_peer(&self, peer: PeerId) -> Result<(), SyncError> {
        self.tree_syncer
            .sync_all(peer, vec![self.id], Vec::new())
            .await
    }
}
