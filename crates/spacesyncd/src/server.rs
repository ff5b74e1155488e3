//! spacesyncd server - main service loop
//!
//! Owns the node identity, the space registry, and the periodic sync
//! driver. Inbound connections are upgraded to a secure channel before
//! any sync message is handled; diff requests are answered from the
//! per-space containers, with unknown and tombstoned spaces kept
//! distinguishable on the wire.

use crate::config::Config;
use crate::dag::{DagError, InMemoryStorageProvider};
use crate::deletion::DeletionState;
use crate::diff::RemoteDiff;
use crate::remote::WireRemoteDiff;
use crate::space::{
    create_space, AclState, KeyCredentialProvider, QueueTreeSyncer, RetrievalBatch, SpaceSync,
};
use crate::storage::{SpaceStorage, StoreError};
use crate::syncer::{PeerProvider, SyncError, TreeSyncer};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use spacesync_core::crypto::verify_space_id;
use spacesync_core::types::*;
use spacesync_net::crypto::KeyPair;
use spacesync_net::framing::FrameType;
use spacesync_net::handshake::{ChannelError, HandshakeError, SecureChannel};
use spacesync_net::messages::{
    DiffRequest, DiffResponse, DiffTypeResponse, Pong, SpacePushAck, WireMessage,
};
use spacesync_net::peer::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Dag error: {0}")]
    Dag(#[from] DagError),
}

// ---------------------------------------------------------------------------
// Peer directory
// ---------------------------------------------------------------------------

/// Address book of peers this node can dial.
pub struct PeerDirectory {
    keypair: KeyPair,
    peers: RwLock<HashMap<PeerId, SocketAddr>>,
}

impl PeerDirectory {
    pub fn new(keypair: KeyPair) -> Self {
        Self {
            keypair,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Dial an address, learn the peer's authenticated identity, and
    /// record it.
    pub async fn discover(&self, addr: SocketAddr) -> Result<PeerId, HandshakeError> {
        let stream = TcpStream::connect(addr).await.map_err(|err| HandshakeError {
            remote_addr: addr.to_string(),
            source: err.into(),
        })?;
        let channel = SecureChannel::connect(stream, &self.keypair, addr.to_string()).await?;
        let peer = channel.peer_id();
        self.peers.write().insert(peer, addr);
        Ok(peer)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Open an authenticated channel to a known peer.
    async fn connect(&self, peer: PeerId) -> Result<SecureChannel<TcpStream>, SyncError> {
        let addr = self
            .peers
            .read()
            .get(&peer)
            .copied()
            .ok_or_else(|| SyncError::PeerDirectory(format!("no address for peer {}", peer)))?;
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            SyncError::Handshake(HandshakeError {
                remote_addr: addr.to_string(),
                source: err.into(),
            })
        })?;
        Ok(SecureChannel::connect(stream, &self.keypair, addr.to_string()).await?)
    }
}

/// Peer-directory collaborator for one space. Membership policy: every
/// known peer replicates every space this node holds.
pub struct NetPeerProvider {
    directory: Arc<PeerDirectory>,
    space: SpaceId,
}

impl NetPeerProvider {
    pub fn new(directory: Arc<PeerDirectory>, space: SpaceId) -> Self {
        Self { directory, space }
    }
}

#[async_trait]
impl PeerProvider for NetPeerProvider {
    async fn get_responsible_peers(&self) -> Result<Vec<PeerId>, SyncError> {
        Ok(self.directory.peer_ids())
    }

    async fn remote_diff(&self, peer: PeerId) -> Result<Arc<dyn RemoteDiff>, SyncError> {
        let channel = self.directory.connect(peer).await?;
        Ok(Arc::new(WireRemoteDiff::new(self.space, channel)))
    }

    async fn send_peer(&self, peer: PeerId, request: SpacePushRequest) -> Result<(), SyncError> {
        let mut channel = self.directory.connect(peer).await?;
        let ack: SpacePushAck = channel.request(&request).await?;
        match ack {
            SpacePushAck::Ok => Ok(()),
            SpacePushAck::Rejected(reason) => Err(SyncError::PeerDirectory(format!(
                "space push rejected by {}: {}",
                peer, reason
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Server state
pub struct Server {
    config: Config,
    keypair: KeyPair,
    storage: Arc<SpaceStorage>,
    directory: Arc<PeerDirectory>,
    /// Active spaces
    spaces: RwLock<HashMap<SpaceId, Arc<SpaceSync>>>,
    /// Background task handles, aborted on shutdown
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let keypair = load_or_create_key(&config.data_dir.join("node.key"))?;
        let storage = Arc::new(SpaceStorage::open(config.data_dir.join("db"))?);
        let directory = Arc::new(PeerDirectory::new(keypair.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            keypair,
            storage,
            directory,
            spaces: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    /// The node's identity.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.keypair.public_key())
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    /// Look up an active space.
    pub fn space(&self, id: &SpaceId) -> Option<Arc<SpaceSync>> {
        self.spaces.read().get(id).cloned()
    }

    /// Dial a peer and record its identity.
    pub async fn connect_peer(&self, addr: SocketAddr) -> Result<PeerId, HandshakeError> {
        self.directory.discover(addr).await
    }

    /// Create a brand new space owned by this node.
    pub fn create_space(&self) -> Result<SpaceId, ServerError> {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let init = create_space(&self.keypair, seed, timestamp_ms)?;
        let id = init.push.header.id;
        self.storage.register_space(&init.push)?;
        let space = self.register_space_sync(id)?;
        space.add_object(init.acl)?;
        space.add_object(init.settings)?;
        info!("created space {}", id);
        Ok(id)
    }

    /// Rebuild sync state for every space present in storage.
    fn bootstrap_spaces(&self) -> Result<(), ServerError> {
        for id in self.storage.space_ids()? {
            if self.storage.is_space_deleted(&id)? {
                continue;
            }
            self.register_space_sync(id)?;
        }
        let count = self.spaces.read().len();
        if count > 0 {
            info!("restored {} spaces from storage", count);
        }
        Ok(())
    }

    /// Wire one space's sync stack and register it.
    fn register_space_sync(&self, id: SpaceId) -> Result<Arc<SpaceSync>, ServerError> {
        let objects = Arc::new(InMemoryStorageProvider::new());
        let deletion = Arc::new(DeletionState::new());
        let (tree_syncer, retrieval_rx) = QueueTreeSyncer::new();
        let tree_syncer: Arc<dyn TreeSyncer> = Arc::new(tree_syncer);
        let acl_root = self.storage.acl_root_id(&id)?;

        let space = Arc::new(SpaceSync::new(
            id,
            self.storage.clone(),
            objects,
            deletion,
            Arc::new(NetPeerProvider::new(self.directory.clone(), id)),
            Arc::new(KeyCredentialProvider::new(self.keypair.clone())),
            tree_syncer.clone(),
            Arc::new(AclState::new(acl_root, tree_syncer)),
        ));

        let mut tasks = self.tasks.lock();
        tasks.push(space.start_deletion_listener());
        tasks.push(spawn_retrieval_worker(retrieval_rx));
        drop(tasks);

        self.spaces.write().insert(id, space.clone());
        Ok(space)
    }

    /// Run the server
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        info!(
            "starting spacesyncd on {} (peer {})",
            self.config.listen,
            self.peer_id()
        );

        self.bootstrap_spaces()?;
        if self.config.create_space && self.spaces.read().is_empty() {
            self.create_space()?;
        }

        for addr in self.config.bootstrap.clone() {
            match self.connect_peer(addr).await {
                Ok(peer) => info!("bootstrap peer {} at {}", peer, addr),
                Err(err) => warn!("bootstrap peer unreachable: {}", err),
            }
        }

        let sync_handle = self.clone().spawn_sync_task();

        let listener = TcpListener::bind(self.config.listen).await?;
        info!("listening on {}", listener.local_addr()?);
        let result = self.clone().serve(listener).await;

        sync_handle.abort();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.storage.flush()?;
        result
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("accepted connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr).await;
                            });
                        }
                        Err(err) => {
                            error!("accept error: {}", err);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down...");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle an inbound connection: secure-channel upgrade, then the
    /// framed request loop.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut channel = match SecureChannel::accept(stream, &self.keypair, addr.to_string()).await
        {
            Ok(channel) => channel,
            Err(err) => {
                warn!("{}", err);
                return;
            }
        };
        debug!("peer {} connected from {}", channel.peer_id(), addr);

        loop {
            let frame = match channel.recv().await {
                Ok(frame) => frame,
                Err(ChannelError::Closed) => break,
                Err(err) => {
                    warn!("connection error from {}: {}", addr, err);
                    break;
                }
            };

            let sent = match frame.frame_type {
                FrameType::Ping => channel.send(&Pong).await,
                FrameType::DiffTypeRequest => {
                    channel
                        .send(&DiffTypeResponse {
                            diff_type: DiffType::RangeHash,
                        })
                        .await
                }
                FrameType::DiffRequest => match DiffRequest::from_frame(&frame) {
                    Ok(request) => {
                        let response = self.handle_diff_request(&request);
                        channel.send(&response).await
                    }
                    Err(err) => {
                        warn!("bad diff request from {}: {}", addr, err);
                        break;
                    }
                },
                FrameType::SpacePush => match SpacePushRequest::from_frame(&frame) {
                    Ok(request) => {
                        let ack = self.handle_space_push(&request);
                        channel.send(&ack).await
                    }
                    Err(err) => {
                        warn!("bad space push from {}: {}", addr, err);
                        break;
                    }
                },
                other => {
                    warn!("unexpected {:?} frame from {}", other, addr);
                    break;
                }
            };

            if let Err(err) = sent {
                warn!("send failed to {}: {}", addr, err);
                break;
            }
        }
    }

    /// Classify and answer an inbound diff request. Unknown and deleted
    /// spaces are distinct conditions on the wire.
    fn handle_diff_request(&self, request: &DiffRequest) -> DiffResponse {
        match self.storage.is_space_deleted(&request.space) {
            Ok(true) => return DiffResponse::SpaceDeleted,
            Ok(false) => {}
            Err(err) => return DiffResponse::Error(err.to_string()),
        }
        match self.space(&request.space) {
            Some(space) => DiffResponse::Ranges(space.ranges(&request.ranges)),
            None => DiffResponse::SpaceMissing,
        }
    }

    /// Ingest a bootstrap push. Idempotent: the header is
    /// content-addressed, so a repeated push of a known space is an ack.
    fn handle_space_push(&self, request: &SpacePushRequest) -> SpacePushAck {
        let header = &request.payload.header;
        if let Err(err) = verify_space_id(header) {
            return SpacePushAck::Rejected(err.to_string());
        }
        if request.credential.is_empty() {
            return SpacePushAck::Rejected("missing credential".into());
        }
        match self.storage.is_space_deleted(&header.id) {
            Ok(true) => return SpacePushAck::Rejected("space is deleted".into()),
            Ok(false) => {}
            Err(err) => return SpacePushAck::Rejected(err.to_string()),
        }
        if self.spaces.read().contains_key(&header.id) {
            return SpacePushAck::Ok;
        }

        if let Err(err) = self.storage.register_space(&request.payload) {
            return SpacePushAck::Rejected(err.to_string());
        }
        match self.register_space_sync(header.id) {
            Ok(_) => {
                info!("space {} bootstrapped by push", header.id);
                SpacePushAck::Ok
            }
            Err(err) => SpacePushAck::Rejected(err.to_string()),
        }
    }

    /// Run one sync round for every active space, logging per-space
    /// failures.
    pub async fn sync_once(&self) {
        let spaces: Vec<_> = self.spaces.read().values().cloned().collect();
        for space in spaces {
            if let Err(err) = space.sync().await {
                warn!("sync failed for space {}: {}", space.id(), err);
            }
        }
    }

    fn spawn_sync_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.sync_interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sync_once().await;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            space_count: self.spaces.read().len(),
            peer_count: self.directory.peer_count(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub space_count: usize,
    pub peer_count: usize,
}

/// Placeholder retrieval worker: the ids a real change fetcher would
/// pull are logged and dropped.
fn spawn_retrieval_worker(
    mut rx: mpsc::UnboundedReceiver<RetrievalBatch>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            debug!(
                "retrieval batch from {}: {} changed, {} new",
                batch.peer,
                batch.changed.len(),
                batch.new.len()
            );
        }
    })
}

/// Load the node key seed, generating and persisting one on first start.
fn load_or_create_key(path: &std::path::Path) -> Result<KeyPair, std::io::Error> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(KeyPair::from_seed(&seed))
        }
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "node key file must hold exactly 32 bytes",
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut seed = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut seed);
            std::fs::write(path, seed)?;
            Ok(KeyPair::from_seed(&seed))
        }
        Err(err) => Err(err),
    }
}
