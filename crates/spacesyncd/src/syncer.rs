//! Per-space sync orchestrator
//!
//! Runs one reconciliation round per responsible peer: negotiates the
//! diff capability, classifies the remote condition, filters tombstoned
//! ids out of the result, gives the access-control DAG priority, and
//! hands the surviving id lists to the retrieval collaborator. Also the
//! single writer of reconciliation state for local head updates.

use crate::container::DiffContainer;
use crate::deletion::DeletionState;
use crate::diff::{DiffError, RemoteDiff};
use crate::storage::StoreError;
use async_trait::async_trait;
use spacesync_core::types::*;
use spacesync_net::handshake::{ChannelError, HandshakeError};
use spacesync_net::peer::PeerId;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer directory error: {0}")]
    PeerDirectory(String),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("diff failed: {0}")]
    Diff(#[from] DiffError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("object retrieval failed: {0}")]
    Retrieval(String),
    #[error("acl sync failed: {0}")]
    Acl(String),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Peer directory: who replicates this space, plus connection access.
#[async_trait]
pub trait PeerProvider: Send + Sync {
    async fn get_responsible_peers(&self) -> Result<Vec<PeerId>, SyncError>;

    /// Acquire a remote-diff handle over a live connection to the peer.
    async fn remote_diff(&self, peer: PeerId) -> Result<Arc<dyn RemoteDiff>, SyncError>;

    async fn send_peer(&self, peer: PeerId, request: SpacePushRequest) -> Result<(), SyncError>;
}

/// Order-preserving tombstone lookup.
pub trait DeletionFilter: Send + Sync {
    fn filter(&self, ids: &[ObjectId]) -> Vec<ObjectId>;
    fn exists(&self, id: &ObjectId) -> bool;
}

impl DeletionFilter for DeletionState {
    fn filter(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        DeletionState::filter(self, ids)
    }

    fn exists(&self, id: &ObjectId) -> bool {
        DeletionState::exists(self, id)
    }
}

/// Issues a credential the push receiver can verify against the header.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self, header: &SpaceHeaderWithId) -> Result<Vec<u8>, SyncError>;
}

/// Retrieval collaborator: fetches the actual changes behind the ids.
#[async_trait]
pub trait TreeSyncer: Send + Sync {
    async fn sync_all(
        &self,
        peer: PeerId,
        changed: Vec<ObjectId>,
        new: Vec<ObjectId>,
    ) -> Result<(), SyncError>;
}

/// Access-control collaborator. Validation of ordinary changes may depend
/// on acl state, so its DAG reconciles before the rest.
#[async_trait]
pub trait AclSyncer: Send + Sync {
    fn id(&self) -> ObjectId;
    async fn sync_with_peer(&self, peer: PeerId) -> Result<(), SyncError>;
}

/// Storage collaborator surface the orchestrator needs.
pub trait SpaceStore: Send + Sync {
    fn space_header(&self) -> Result<SpaceHeaderWithId, StoreError>;
    fn acl_root_id(&self) -> Result<ObjectId, StoreError>;
    fn settings_root_id(&self) -> Result<ObjectId, StoreError>;
    fn write_space_hash(&self, hash: Bytes32) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// DiffSyncer
// ---------------------------------------------------------------------------

enum PeerOutcome {
    Synced,
    /// Bootstrap push delivered; the round is complete
    Bootstrapped,
    /// Peer unusable this round, move on
    Skipped,
}

/// Per-space sync controller.
pub struct DiffSyncer {
    space_id: SpaceId,
    container: Arc<DiffContainer>,
    store: Arc<dyn SpaceStore>,
    peers: Arc<dyn PeerProvider>,
    deletion: Arc<dyn DeletionFilter>,
    credentials: Arc<dyn CredentialProvider>,
    tree_syncer: Arc<dyn TreeSyncer>,
    acl: Arc<dyn AclSyncer>,
}

impl DiffSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        space_id: SpaceId,
        container: Arc<DiffContainer>,
        store: Arc<dyn SpaceStore>,
        peers: Arc<dyn PeerProvider>,
        deletion: Arc<dyn DeletionFilter>,
        credentials: Arc<dyn CredentialProvider>,
        tree_syncer: Arc<dyn TreeSyncer>,
        acl: Arc<dyn AclSyncer>,
    ) -> Self {
        Self {
            space_id,
            container,
            store,
            peers,
            deletion,
            credentials,
            tree_syncer,
            acl,
        }
    }

    /// Run one reconciliation round against every responsible peer.
    ///
    /// A failing peer lookup is fatal and happens before any peer
    /// interaction. A successful bootstrap push ends the round early: the
    /// receiver has nothing to diff until it ingests the push.
    pub async fn sync(&self) -> Result<(), SyncError> {
        let peers = self.peers.get_responsible_peers().await?;
        debug!("start diff sync for space {} with {} peers", self.space_id, peers.len());

        for peer in peers {
            match self.sync_with_peer(peer).await? {
                PeerOutcome::Synced => {}
                PeerOutcome::Bootstrapped => return Ok(()),
                PeerOutcome::Skipped => continue,
            }
        }
        Ok(())
    }

    async fn sync_with_peer(&self, peer: PeerId) -> Result<PeerOutcome, SyncError> {
        let remote = match self.peers.remote_diff(peer).await {
            Ok(remote) => remote,
            Err(SyncError::Handshake(err)) => {
                // Unreachable this round, not a space-level condition
                warn!("peer {} unreachable: {}", peer, err);
                return Ok(PeerOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };

        let (supported, diff) = self.container.diff_type_check(remote.as_ref()).await?;
        if !supported {
            warn!("peer {} does not support our diff type, skipping", peer);
            return Ok(PeerOutcome::Skipped);
        }

        let (new_ids, changed_ids, removed_ids) = match diff.diff(remote.as_ref()).await {
            Ok(result) => result,
            Err(DiffError::SpaceMissing) => {
                self.push_space(peer).await?;
                return Ok(PeerOutcome::Bootstrapped);
            }
            Err(DiffError::SpaceDeleted) => {
                info!("peer {} marks space {} as deleted, skipping", peer, self.space_id);
                return Ok(PeerOutcome::Skipped);
            }
            Err(DiffError::Unexpected(reason)) => {
                warn!("unexpected condition from peer {}: {}", peer, reason);
                return Ok(PeerOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };

        // Tombstoned objects must never be reintroduced by sync
        let new_ids = self.deletion.filter(&new_ids);
        let mut changed_ids = self.deletion.filter(&changed_ids);
        let removed_ids = self.deletion.filter(&removed_ids);
        if !removed_ids.is_empty() {
            // Only the remote lacks these; eventual convergence, not
            // deletion, reconciles them
            debug!("peer {} lacks {} objects we hold", peer, removed_ids.len());
        }

        // Acl changes reconcile before ordinary retrieval
        let acl_id = self.acl.id();
        if let Some(pos) = changed_ids.iter().position(|id| *id == acl_id) {
            self.acl.sync_with_peer(peer).await?;
            changed_ids.remove(pos);
        }

        debug!(
            "diff with peer {} done: {} new, {} changed",
            peer,
            new_ids.len(),
            changed_ids.len()
        );
        self.tree_syncer.sync_all(peer, changed_ids, new_ids).await?;
        Ok(PeerOutcome::Synced)
    }

    /// Bootstrap push: hand the space-identifying material to a peer
    /// that has never heard of the space. Idempotent and safe to retry
    /// on a later round.
    async fn push_space(&self, peer: PeerId) -> Result<(), SyncError> {
        let header = self.store.space_header()?;
        let acl_root_id = self.store.acl_root_id()?;
        let settings_root_id = self.store.settings_root_id()?;
        let credential = self.credentials.get_credential(&header).await?;

        info!("pushing space {} to peer {}", self.space_id, peer);
        self.peers
            .send_peer(
                peer,
                SpacePushRequest {
                    payload: SpacePushPayload {
                        header,
                        acl_root_id,
                        settings_root_id,
                    },
                    credential,
                },
            )
            .await
    }

    /// Fold a local frontier change into the reconciliation state.
    ///
    /// Tombstoned objects are a complete no-op. Otherwise the element
    /// digest preserves the caller's head order, and the recomputed
    /// aggregate hash is persisted so the space fingerprint tracks every
    /// local write.
    pub fn update_heads(&self, id: ObjectId, heads: &[ChangeId]) {
        if self.deletion.exists(&id) {
            return;
        }
        self.container.set(Element {
            id,
            head: concat_heads(heads),
        });
        self.write_hash();
    }

    /// Drop reconciliation state for deleted objects.
    pub fn remove_objects(&self, ids: &[ObjectId]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.container.remove(id);
        }
        self.write_hash();
    }

    fn write_hash(&self) {
        let hash = self.container.precalculated_diff().hash();
        if let Err(err) = self.store.write_space_hash(hash) {
            error!("failed to persist space hash for {}: {}", self.space_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Diff;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use spacesync_net::handshake::HandshakeFailure;

    // -- recording mocks ----------------------------------------------------

    enum RemoteFixture {
        Engine(Arc<Diff>),
        Missing,
        Deleted,
        Unexpected,
        WrongType,
        Unreachable,
    }

    struct FailingRemote {
        diff_type: DiffType,
        error: fn() -> DiffError,
    }

    #[async_trait]
    impl RemoteDiff for FailingRemote {
        async fn diff_type(&self) -> Result<DiffType, DiffError> {
            Ok(self.diff_type)
        }

        async fn ranges(&self, _ranges: &[DiffRange]) -> Result<Vec<RangeResult>, DiffError> {
            Err((self.error)())
        }
    }

    struct MockPeers {
        peers: Mutex<Vec<(PeerId, RemoteFixture)>>,
        fail_lookup: bool,
        acquired: Mutex<Vec<PeerId>>,
        pushes: Mutex<Vec<(PeerId, SpacePushRequest)>>,
    }

    impl MockPeers {
        fn new(peers: Vec<(PeerId, RemoteFixture)>) -> Self {
            Self {
                peers: Mutex::new(peers),
                fail_lookup: false,
                acquired: Mutex::new(Vec::new()),
                pushes: Mutex::new(Vec::new()),
            }
        }

        fn failing_lookup() -> Self {
            Self {
                fail_lookup: true,
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl PeerProvider for MockPeers {
        async fn get_responsible_peers(&self) -> Result<Vec<PeerId>, SyncError> {
            if self.fail_lookup {
                return Err(SyncError::PeerDirectory("some error".into()));
            }
            Ok(self.peers.lock().iter().map(|(id, _)| *id).collect())
        }

        async fn remote_diff(&self, peer: PeerId) -> Result<Arc<dyn RemoteDiff>, SyncError> {
            self.acquired.lock().push(peer);
            let peers = self.peers.lock();
            let fixture = peers
                .iter()
                .find(|(id, _)| *id == peer)
                .map(|(_, f)| f)
                .expect("unknown peer requested");
            match fixture {
                RemoteFixture::Engine(diff) => Ok(diff.clone()),
                RemoteFixture::Missing => Ok(Arc::new(FailingRemote {
                    diff_type: DiffType::RangeHash,
                    error: || DiffError::SpaceMissing,
                })),
                RemoteFixture::Deleted => Ok(Arc::new(FailingRemote {
                    diff_type: DiffType::RangeHash,
                    error: || DiffError::SpaceDeleted,
                })),
                RemoteFixture::Unexpected => Ok(Arc::new(FailingRemote {
                    diff_type: DiffType::RangeHash,
                    error: || DiffError::Unexpected("remote panic".into()),
                })),
                RemoteFixture::WrongType => Ok(Arc::new(FailingRemote {
                    diff_type: DiffType::FullSet,
                    error: || DiffError::Unexpected("must not be called".into()),
                })),
                RemoteFixture::Unreachable => Err(SyncError::Handshake(HandshakeError {
                    remote_addr: "10.0.0.1:4870".into(),
                    source: HandshakeFailure::Closed,
                })),
            }
        }

        async fn send_peer(&self, peer: PeerId, request: SpacePushRequest) -> Result<(), SyncError> {
            self.pushes.lock().push((peer, request));
            Ok(())
        }
    }

    struct MockStore {
        header: SpaceHeaderWithId,
        acl_root: ObjectId,
        settings_root: ObjectId,
        hashes: Mutex<Vec<Bytes32>>,
    }

    impl MockStore {
        fn new() -> Self {
            let raw = RawSpaceHeader {
                payload: b"space-header".to_vec(),
                signature: vec![1; 64],
            };
            Self {
                header: SpaceHeaderWithId {
                    id: spacesync_core::crypto::derive_space_id(&raw),
                    raw,
                },
                acl_root: ObjectId([0xaa; 32]),
                settings_root: ObjectId([0xbb; 32]),
                hashes: Mutex::new(Vec::new()),
            }
        }
    }

    impl SpaceStore for MockStore {
        fn space_header(&self) -> Result<SpaceHeaderWithId, StoreError> {
            Ok(self.header.clone())
        }

        fn acl_root_id(&self) -> Result<ObjectId, StoreError> {
            Ok(self.acl_root)
        }

        fn settings_root_id(&self) -> Result<ObjectId, StoreError> {
            Ok(self.settings_root)
        }

        fn write_space_hash(&self, hash: Bytes32) -> Result<(), StoreError> {
            self.hashes.lock().push(hash);
            Ok(())
        }
    }

    struct MockCredentials;

    #[async_trait]
    impl CredentialProvider for MockCredentials {
        async fn get_credential(
            &self,
            _header: &SpaceHeaderWithId,
        ) -> Result<Vec<u8>, SyncError> {
            Ok(b"credential".to_vec())
        }
    }

    struct MockTreeSyncer {
        calls: Mutex<Vec<(PeerId, Vec<ObjectId>, Vec<ObjectId>)>>,
        fail: bool,
    }

    impl MockTreeSyncer {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl TreeSyncer for MockTreeSyncer {
        async fn sync_all(
            &self,
            peer: PeerId,
            changed: Vec<ObjectId>,
            new: Vec<ObjectId>,
        ) -> Result<(), SyncError> {
            self.calls.lock().push((peer, changed, new));
            if self.fail {
                return Err(SyncError::Retrieval("tree syncer down".into()));
            }
            Ok(())
        }
    }

    struct MockAcl {
        id: ObjectId,
        synced: Mutex<Vec<PeerId>>,
    }

    impl MockAcl {
        fn new() -> Self {
            Self {
                id: ObjectId([0xac; 32]),
                synced: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AclSyncer for MockAcl {
        fn id(&self) -> ObjectId {
            self.id
        }

        async fn sync_with_peer(&self, peer: PeerId) -> Result<(), SyncError> {
            self.synced.lock().push(peer);
            Ok(())
        }
    }

    // -- fixture ------------------------------------------------------------

    struct Fixture {
        container: Arc<DiffContainer>,
        peers: Arc<MockPeers>,
        deletion: Arc<DeletionState>,
        store: Arc<MockStore>,
        tree: Arc<MockTreeSyncer>,
        acl: Arc<MockAcl>,
        syncer: DiffSyncer,
    }

    fn peer(seed: u8) -> PeerId {
        PeerId([seed; 32])
    }

    fn object(seed: u8) -> ObjectId {
        ObjectId([seed; 32])
    }

    fn fixture(peers: MockPeers) -> Fixture {
        fixture_with(peers, MockTreeSyncer::new())
    }

    fn fixture_with(peers: MockPeers, tree: MockTreeSyncer) -> Fixture {
        let container = Arc::new(DiffContainer::new());
        let peers = Arc::new(peers);
        let deletion = Arc::new(DeletionState::new());
        let store = Arc::new(MockStore::new());
        let tree = Arc::new(tree);
        let acl = Arc::new(MockAcl::new());
        let syncer = DiffSyncer::new(
            SpaceId([0x51; 32]),
            container.clone(),
            store.clone(),
            peers.clone(),
            deletion.clone(),
            Arc::new(MockCredentials),
            tree.clone(),
            acl.clone(),
        );
        Fixture {
            container,
            peers,
            deletion,
            store,
            tree,
            acl,
            syncer,
        }
    }

    /// Remote engine diverging from the local container: `new_ids` exist
    /// only remotely, `changed_ids` exist on both sides with different
    /// frontiers.
    fn diverging_engine(
        fx: &Fixture,
        new_ids: &[ObjectId],
        changed_ids: &[ObjectId],
    ) -> Arc<Diff> {
        let remote = Arc::new(Diff::new());
        for id in new_ids {
            remote.set(Element {
                id: *id,
                head: "remote-only".into(),
            });
        }
        for id in changed_ids {
            fx.container.set(Element {
                id: *id,
                head: "local-frontier".into(),
            });
            remote.set(Element {
                id: *id,
                head: "remote-frontier".into(),
            });
        }
        remote
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn test_sync_delegates_filtered_ids() {
        let p1 = peer(1);
        let n1 = object(10);
        let c1 = object(20);

        let fx = fixture(MockPeers::new(Vec::new()));
        let remote = diverging_engine(&fx, &[n1], &[c1]);
        fx.peers.peers.lock().push((p1, RemoteFixture::Engine(remote)));

        fx.syncer.sync().await.unwrap();

        let calls = fx.tree.calls.lock();
        assert_eq!(calls.as_slice(), &[(p1, vec![c1], vec![n1])]);
        assert!(fx.acl.synced.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_acl_changed_reconciles_acl_first() {
        let p1 = peer(1);
        let c1 = object(20);

        let fx = fixture(MockPeers::new(Vec::new()));
        let acl_id = fx.acl.id;
        let remote = diverging_engine(&fx, &[], &[c1, acl_id]);
        fx.peers.peers.lock().push((p1, RemoteFixture::Engine(remote)));

        fx.syncer.sync().await.unwrap();

        // Acl synced with the peer, and its id stripped before delegation
        assert_eq!(fx.acl.synced.lock().as_slice(), &[p1]);
        let calls = fx.tree.calls.lock();
        assert_eq!(calls.len(), 1);
        let (called_peer, changed, new) = &calls[0];
        assert_eq!(*called_peer, p1);
        assert_eq!(changed.as_slice(), &[c1]);
        assert!(new.is_empty());
    }

    #[tokio::test]
    async fn test_sync_peer_lookup_failure_is_fatal() {
        let fx = fixture(MockPeers::failing_lookup());

        let err = fx.syncer.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::PeerDirectory(_)));
        // No peer interaction of any kind
        assert!(fx.peers.acquired.lock().is_empty());
        assert!(fx.tree.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_heads_on_tombstoned_id_is_noop() {
        let fx = fixture(MockPeers::new(Vec::new()));
        let deleted = object(7);
        fx.deletion.add(deleted);

        fx.syncer.update_heads(deleted, &[ChangeId([1; 32])]);

        assert_eq!(fx.container.precalculated_diff().len(), 0);
        assert!(fx.store.hashes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_update_heads_sets_element_and_writes_hash_once() {
        let fx = fixture(MockPeers::new(Vec::new()));
        let id = object(9);
        let h1 = ChangeId([0x11; 32]);
        let h2 = ChangeId([0x22; 32]);

        fx.syncer.update_heads(id, &[h1, h2]);

        let engine = fx.container.precalculated_diff();
        let results = engine.ranges(&[DiffRange {
            from: ObjectId::MIN,
            to: ObjectId::MAX,
            limit: 16,
        }]);
        assert_eq!(
            results[0].elements.as_slice(),
            &[Element {
                id,
                head: concat_heads(&[h1, h2]),
            }]
        );
        assert_eq!(fx.store.hashes.lock().as_slice(), &[engine.hash()]);
    }

    #[tokio::test]
    async fn test_sync_space_missing_pushes_bootstrap_once() {
        let p1 = peer(1);
        let p2 = peer(2);
        let fx = fixture(MockPeers::new(vec![
            (p1, RemoteFixture::Missing),
            (p2, RemoteFixture::Missing),
        ]));

        fx.syncer.sync().await.unwrap();

        // Exactly one push, built from the space's current material, and
        // the round ends before the second peer is contacted
        let pushes = fx.peers.pushes.lock();
        assert_eq!(pushes.len(), 1);
        let (pushed_peer, request) = &pushes[0];
        assert_eq!(*pushed_peer, p1);
        assert_eq!(request.payload.header, fx.store.header);
        assert_eq!(request.payload.acl_root_id, fx.store.acl_root);
        assert_eq!(request.payload.settings_root_id, fx.store.settings_root);
        assert_eq!(request.credential, b"credential");

        assert_eq!(fx.peers.acquired.lock().as_slice(), &[p1]);
        assert!(fx.tree.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_space_deleted_is_swallowed() {
        let fx = fixture(MockPeers::new(vec![(peer(1), RemoteFixture::Deleted)]));

        fx.syncer.sync().await.unwrap();

        assert!(fx.tree.calls.lock().is_empty());
        assert!(fx.peers.pushes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_unexpected_is_swallowed() {
        let fx = fixture(MockPeers::new(vec![(peer(1), RemoteFixture::Unexpected)]));

        fx.syncer.sync().await.unwrap();

        assert!(fx.tree.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_skips_deleted_peer_then_syncs_next() {
        let p1 = peer(1);
        let p2 = peer(2);
        let n1 = object(10);

        let fx = fixture(MockPeers::new(Vec::new()));
        let remote = diverging_engine(&fx, &[n1], &[]);
        {
            let mut peers = fx.peers.peers.lock();
            peers.push((p1, RemoteFixture::Deleted));
            peers.push((p2, RemoteFixture::Engine(remote)));
        }

        fx.syncer.sync().await.unwrap();

        let calls = fx.tree.calls.lock();
        assert_eq!(calls.as_slice(), &[(p2, vec![], vec![n1])]);
    }

    #[tokio::test]
    async fn test_sync_unreachable_peer_is_skipped() {
        let fx = fixture(MockPeers::new(vec![(peer(1), RemoteFixture::Unreachable)]));

        fx.syncer.sync().await.unwrap();

        assert!(fx.tree.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_unsupported_diff_type_is_skipped() {
        let fx = fixture(MockPeers::new(vec![(peer(1), RemoteFixture::WrongType)]));

        fx.syncer.sync().await.unwrap();

        assert!(fx.tree.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_filters_tombstoned_ids_preserving_order() {
        let p1 = peer(1);
        // Ids chosen so the diff returns them in this order
        let n1 = object(0x10);
        let n2 = object(0x20);
        let n3 = object(0x30);
        let c1 = object(0x40);

        let fx = fixture(MockPeers::new(Vec::new()));
        let remote = diverging_engine(&fx, &[n1, n2, n3], &[c1]);
        fx.peers.peers.lock().push((p1, RemoteFixture::Engine(remote)));

        fx.deletion.add(n2);
        fx.deletion.add(c1);

        fx.syncer.sync().await.unwrap();

        let calls = fx.tree.calls.lock();
        assert_eq!(calls.as_slice(), &[(p1, vec![], vec![n1, n3])]);
    }

    #[tokio::test]
    async fn test_sync_retrieval_failure_propagates() {
        let p1 = peer(1);
        let n1 = object(10);

        let mut tree = MockTreeSyncer::new();
        tree.fail = true;
        let fx = fixture_with(MockPeers::new(Vec::new()), tree);
        let remote = diverging_engine(&fx, &[n1], &[]);
        fx.peers.peers.lock().push((p1, RemoteFixture::Engine(remote)));

        let err = fx.syncer.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Retrieval(_)));
    }

    #[tokio::test]
    async fn test_remove_objects_drops_elements_and_writes_hash() {
        let fx = fixture(MockPeers::new(Vec::new()));
        let keep = object(1);
        let gone = object(2);
        fx.syncer.update_heads(keep, &[ChangeId([1; 32])]);
        fx.syncer.update_heads(gone, &[ChangeId([2; 32])]);
        let writes_before = fx.store.hashes.lock().len();

        fx.syncer.remove_objects(&[gone]);

        let engine = fx.container.precalculated_diff();
        assert_eq!(engine.len(), 1);
        let hashes = fx.store.hashes.lock();
        assert_eq!(hashes.len(), writes_before + 1);
        assert_eq!(*hashes.last().unwrap(), engine.hash());
    }
}
