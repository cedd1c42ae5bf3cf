//! A dagmesh node
//!
//! A node owns one commit store, one event bus and its peer topology. It
//! registers an inbox on the shared [`Network`] and serves every inbound
//! request in its own task. Local writes, merges and topology actions are
//! methods on the cloneable [`Node`] handle; network work they trigger runs
//! in background tasks under the node's cancellation token.

mod handler;
mod sync;
mod write;

pub use sync::{SyncReport, SyncSummary};
pub use write::WriteOutcome;

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libdagmesh_core::config::node_sled_path;
use libdagmesh_core::store::PendingBuffer;
use libdagmesh_core::types::ids::{doc_id_to_string, hex_to_id};
use libdagmesh_core::{
    AccessGate, Assembler, Cid, CollectionRegistry, CommitStore, DocId, Document, Event, EventBus,
    EventFilter, KeyId, KeyStore, Keyring, MeshError, NodeConfig, NodeKeypair, PeerId,
    Subscription, Topic,
};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::NetError;
use crate::identity::{peer_short, PeerInfo};
use crate::message::{Envelope, Request, Response};
use crate::topology::{PeerState, PEER_STATE_KEY};
use crate::transport::{Inbound, Network};

const NODE_KEY: &str = "node_key";
const KEYRING_MASTER_KEY: &str = "keyring_master";
const DOC_KEYS_KEY: &str = "doc_keys";

/// How long a restarting node waits for the previous owner of its store
const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// A replicator push that failed and is retried in the background
struct RetryEntry {
    collection: String,
    attempts: u32,
}

struct NodeInner {
    name: String,
    keypair: NodeKeypair,
    info: PeerInfo,
    registry: Arc<CollectionRegistry>,
    config: NodeConfig,
    gate: Arc<dyn AccessGate>,
    keys: Keyring,
    bus: EventBus,
    network: Network,
    state: RwLock<PeerState>,
    /// Topics last sent to connected peers
    advertised: tokio::sync::Mutex<BTreeSet<Topic>>,
    doc_locks: Mutex<HashMap<DocId, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<PendingBuffer>,
    retries: Mutex<HashMap<(PeerId, DocId), RetryEntry>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // dropped after the store
    store: CommitStore,
    _lock: Option<File>,
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("peer", &self.inner.info.short())
            .finish()
    }
}

impl Node {
    /// Open the node's store, restore its identity and topology, and start
    /// serving requests on `network`.
    ///
    /// With `config.data_dir` set the store lives under
    /// `<data_dir>/<name>/sled` and is locked for the node's lifetime;
    /// otherwise it is an in-memory store.
    pub async fn start(
        name: impl Into<String>,
        network: Network,
        registry: Arc<CollectionRegistry>,
        config: NodeConfig,
        gate: Arc<dyn AccessGate>,
    ) -> Result<Self, NetError> {
        let name = name.into();
        config.validate()?;

        let (store, lock) = match &config.data_dir {
            Some(root) => {
                let path = node_sled_path(root, &name);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(MeshError::from)?;
                }
                let locked = tokio::task::spawn_blocking(move || {
                    CommitStore::open_locked_blocking(&path, STORE_LOCK_TIMEOUT)
                })
                .await
                .map_err(|e| MeshError::Internal(format!("store open task failed: {}", e)))??;
                let (store, file) = locked.into_inner();
                (store, Some(file))
            }
            None => (CommitStore::open_temporary()?, None),
        };

        let keypair = load_keypair(&store)?;
        let keys = load_keyring(&store)?;
        let state = match store.get_meta(PEER_STATE_KEY)? {
            Some(bytes) => serde_json::from_slice::<PeerState>(&bytes).map_err(MeshError::from)?,
            None => PeerState::default(),
        };

        let info = PeerInfo::new(keypair.peer_id(), format!("mem://{}", name));
        let inbox = network
            .register(keypair.peer_id(), config.inbox_capacity)
            .await;

        info!(
            node = %name,
            peer = %info.short(),
            persistent = config.data_dir.is_some(),
            topology = %state.describe(),
            "node starting"
        );

        let node = Node {
            inner: Arc::new(NodeInner {
                name,
                keypair,
                info,
                registry,
                bus: EventBus::new(config.event_capacity),
                config,
                gate,
                keys,
                network,
                state: RwLock::new(state),
                advertised: tokio::sync::Mutex::new(BTreeSet::new()),
                doc_locks: Mutex::new(HashMap::new()),
                pending: Mutex::new(PendingBuffer::new()),
                retries: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                store,
                _lock: lock,
            }),
        };

        // nobody is connected yet, so this only sets the baseline
        let initial = node.current_topics().await?;
        *node.inner.advertised.lock().await = initial;

        let serve = tokio::spawn(node.clone().serve(inbox));
        let retry = tokio::spawn(node.clone().retry_loop());
        lock_or_recover(&node.inner.tasks).extend([serve, retry]);

        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.info.id
    }

    pub fn info(&self) -> PeerInfo {
        self.inner.info.clone()
    }

    pub fn store(&self) -> &CommitStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &CollectionRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &Keyring {
        &self.inner.keys
    }

    pub fn events(&self) -> EventBus {
        self.inner.bus.clone()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.bus.subscribe(filter)
    }

    /// Snapshot of the node's topology
    pub async fn peer_state(&self) -> PeerState {
        self.inner.state.read().await.clone()
    }

    pub fn heads(&self, doc_id: &DocId) -> Result<Vec<Cid>, NetError> {
        Ok(self.inner.store.heads(doc_id)?)
    }

    /// Materialize a document with this node's keys and gate
    pub fn document(&self, doc_id: &DocId) -> Result<Document, NetError> {
        Ok(self.assembler().materialize(doc_id)?)
    }

    /// Every document of a collection this node can materialize. Documents
    /// it cannot read are skipped with a log line.
    pub fn documents(&self, collection: &str) -> Result<Vec<Document>, NetError> {
        self.inner.registry.get(collection)?;
        let assembler = self.assembler();
        let mut docs = Vec::new();
        for doc_id in self.inner.store.documents(collection)? {
            match assembler.materialize(&doc_id) {
                Ok(doc) => docs.push(doc),
                Err(e) => debug!(
                    node = %self.inner.name,
                    doc = %doc_id_to_string(&doc_id),
                    error = %e,
                    "document not readable"
                ),
            }
        }
        Ok(docs)
    }

    /// Whether every payload of the document can be opened
    pub fn is_decryptable(&self, doc_id: &DocId) -> bool {
        self.assembler().is_decryptable(doc_id).unwrap_or(false)
    }

    /// Keys named by the document's sealed payloads that this node lacks
    pub fn missing_keys(&self, doc_id: &DocId) -> BTreeSet<KeyId> {
        self.assembler().missing_keys(doc_id).unwrap_or_default()
    }

    /// Number of commits held back waiting for their parents
    pub fn pending_len(&self) -> usize {
        lock_or_recover(&self.inner.pending).len()
    }

    /// Number of replicator pushes waiting for a retry
    pub fn retry_queue_len(&self) -> usize {
        lock_or_recover(&self.inner.retries).len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop serving, say goodbye to connected peers and flush the store
    pub async fn shutdown(&self) -> Result<(), NetError> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        info!(node = %self.inner.name, "node shutting down");

        let peers: Vec<PeerId> = self.inner.state.read().await.connections.keys().copied().collect();
        for peer in peers {
            if let Err(e) = self.request(&peer, Request::Goodbye).await {
                debug!(node = %self.inner.name, peer = %peer_short(&peer), error = %e, "goodbye failed");
            }
        }

        self.inner.cancel.cancel();
        self.inner.network.unregister(&self.inner.info.id).await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock_or_recover(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node = %self.inner.name, error = %e, "node task ended abnormally");
            }
        }

        self.inner.store.flush()?;
        Ok(())
    }

    // Topology actions

    /// Open a bidirectional link and exchange advertised topics. Each side
    /// then announces the documents the other one is interested in.
    pub async fn connect(&self, peer: &PeerInfo) -> Result<(), NetError> {
        self.ensure_running()?;
        if peer.id == self.inner.info.id {
            return Err(MeshError::InvalidArgs("a node cannot connect to itself".to_string()).into());
        }

        self.inner.state.write().await.connect(peer.clone());
        let topics: Vec<Topic> = self.current_topics().await?.into_iter().collect();
        let hello = Request::Hello {
            info: self.inner.info.clone(),
            topics,
        };

        let remote = match self.request(&peer.id, hello).await {
            Ok(Response::Topics(remote)) => remote,
            Ok(other) => {
                self.inner.state.write().await.disconnect(&peer.id);
                return Err(unexpected("hello", &other));
            }
            Err(e) => {
                self.inner.state.write().await.disconnect(&peer.id);
                return Err(e);
            }
        };

        self.inner
            .state
            .write()
            .await
            .set_remote_topics(&peer.id, remote.iter().cloned());
        info!(node = %self.inner.name, peer = %peer.short(), topics = remote.len(), "connected");

        self.spawn_announce_matching(peer.id, remote);
        Ok(())
    }

    /// Push `collections` (all when `None`) from this node to `target`
    pub async fn configure_replicator(
        &self,
        target: &PeerInfo,
        collections: Option<Vec<String>>,
    ) -> Result<(), NetError> {
        self.ensure_running()?;
        if let Some(names) = &collections {
            for name in names {
                self.inner.registry.get(name)?;
            }
        }
        self.inner
            .state
            .read()
            .await
            .check_outbound(&self.inner.info.id, &target.id)?;

        match self
            .request(
                &target.id,
                Request::ReplicatorAdded {
                    collections: collections.clone(),
                },
            )
            .await?
        {
            Response::Ack => {}
            other => return Err(unexpected("replicator_added", &other)),
        }

        let filter = collections.map(|names| names.into_iter().collect::<BTreeSet<_>>());
        {
            let mut state = self.inner.state.write().await;
            state.add_replicator(&self.inner.info.id, target.clone(), filter)?;
            self.persist_state(&state)?;
        }
        info!(node = %self.inner.name, target = %target.short(), "replicator configured");

        let node = self.clone();
        let target = target.id;
        tokio::spawn(async move {
            node.initial_replication(target).await;
        });
        Ok(())
    }

    /// Remove the outbound edge to `target` and tell the target
    pub async fn delete_replicator(&self, target: &PeerId) -> Result<(), NetError> {
        self.ensure_running()?;
        {
            let mut state = self.inner.state.write().await;
            if !state.remove_replicator(target) {
                return Err(MeshError::NotFound(format!(
                    "replicator to {}",
                    peer_short(target)
                ))
                .into());
            }
            self.persist_state(&state)?;
        }
        lock_or_recover(&self.inner.retries).retain(|(peer, _), _| peer != target);

        if let Err(e) = self.request(target, Request::ReplicatorRemoved).await {
            warn!(node = %self.inner.name, target = %peer_short(target), error = %e, "failed to notify replicator target");
        }
        info!(node = %self.inner.name, target = %peer_short(target), "replicator removed");
        Ok(())
    }

    pub async fn subscribe_to_collections(&self, names: &[String]) -> Result<(), NetError> {
        self.ensure_running()?;
        for name in names {
            self.inner.registry.get(name)?;
        }
        let added = {
            let mut state = self.inner.state.write().await;
            let added = state.subscribe_collections(names);
            self.persist_state(&state)?;
            added
        };
        self.refresh_topics().await?;

        let topics: Vec<Topic> = added.into_iter().map(Topic::Collection).collect();
        self.spawn_backfill(topics).await;
        Ok(())
    }

    pub async fn unsubscribe_from_collections(&self, names: &[String]) -> Result<(), NetError> {
        self.ensure_running()?;
        {
            let mut state = self.inner.state.write().await;
            state.unsubscribe_collections(names);
            self.persist_state(&state)?;
        }
        self.refresh_topics().await
    }

    pub async fn subscribe_to_documents(&self, doc_ids: &[DocId]) -> Result<(), NetError> {
        self.ensure_running()?;
        let added = {
            let mut state = self.inner.state.write().await;
            let added = state.subscribe_documents(doc_ids);
            self.persist_state(&state)?;
            added
        };
        self.refresh_topics().await?;

        let topics: Vec<Topic> = added.into_iter().map(Topic::Document).collect();
        self.spawn_backfill(topics).await;
        Ok(())
    }

    pub async fn unsubscribe_from_documents(&self, doc_ids: &[DocId]) -> Result<(), NetError> {
        self.ensure_running()?;
        {
            let mut state = self.inner.state.write().await;
            state.unsubscribe_documents(doc_ids);
            self.persist_state(&state)?;
        }
        self.refresh_topics().await
    }

    // Internals shared by the submodules

    fn assembler(&self) -> Assembler<'_> {
        Assembler::new(
            &self.inner.store,
            &self.inner.keys as &dyn KeyStore,
            self.inner.gate.as_ref(),
        )
    }

    fn ensure_running(&self) -> Result<(), NetError> {
        if self.inner.cancel.is_cancelled() {
            return Err(NetError::Shutdown);
        }
        Ok(())
    }

    fn doc_lock(&self, doc_id: &DocId) -> Arc<tokio::sync::Mutex<()>> {
        lock_or_recover(&self.inner.doc_locks)
            .entry(*doc_id)
            .or_default()
            .clone()
    }

    fn persist_state(&self, state: &PeerState) -> Result<(), NetError> {
        let bytes = serde_json::to_vec(state).map_err(MeshError::from)?;
        self.inner.store.put_meta(PEER_STATE_KEY, &bytes)?;
        self.inner.store.flush()?;
        Ok(())
    }

    fn persist_keys(&self) -> Result<(), NetError> {
        let bytes = serde_json::to_vec(&self.inner.keys.export()).map_err(MeshError::from)?;
        self.inner.store.put_meta(DOC_KEYS_KEY, &bytes)?;
        Ok(())
    }

    /// Topics this node should advertise right now
    async fn current_topics(&self) -> Result<BTreeSet<Topic>, NetError> {
        let held = self.inner.store.all_documents()?;
        Ok(self.inner.state.read().await.advertised_topics(&held))
    }

    /// Send the difference between the current and the last advertised
    /// topics to every connected peer
    async fn refresh_topics(&self) -> Result<(), NetError> {
        let mut advertised = self.inner.advertised.lock().await;
        let current = self.current_topics().await?;
        let add: Vec<Topic> = current.difference(&advertised).cloned().collect();
        let remove: Vec<Topic> = advertised.difference(&current).cloned().collect();
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        *advertised = current;

        let peers: Vec<PeerId> = self.inner.state.read().await.connections.keys().copied().collect();
        debug!(
            node = %self.inner.name,
            added = add.len(),
            removed = remove.len(),
            peers = peers.len(),
            "advertising topics"
        );
        for peer in peers {
            let request = Request::Topics {
                add: add.clone(),
                remove: remove.clone(),
            };
            if let Err(e) = self.request(&peer, request).await {
                warn!(node = %self.inner.name, peer = %peer_short(&peer), error = %e, "topic update failed");
            }
        }
        Ok(())
    }

    /// One signed round-trip. Error responses come back as `Err`.
    async fn request(&self, to: &PeerId, request: Request) -> Result<Response, NetError> {
        let name = request.name();
        let envelope = Envelope::seal(&self.inner.keypair, &request)?;
        let reply = self
            .inner
            .network
            .request(to, envelope, self.inner.config.request_timeout())
            .await?;
        if &reply.from != to {
            return Err(MeshError::Unauthorized(format!(
                "reply to {} signed by {} instead of {}",
                name,
                peer_short(&reply.from),
                peer_short(to)
            ))
            .into());
        }
        match reply.open::<Response>(self.inner.config.verification)? {
            Response::Error { code, message } => Err(NetError::from_remote(&code, message)),
            response => Ok(response),
        }
    }

    async fn serve(self, mut inbox: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                inbound = inbox.recv() => match inbound {
                    Some(inbound) => {
                        let node = self.clone();
                        tokio::spawn(async move { node.handle_inbound(inbound).await });
                    }
                    None => break,
                },
            }
        }
        debug!(node = %self.inner.name, "serve loop stopped");
    }

    fn publish(&self, event: Event) {
        self.inner.bus.publish(event);
    }
}

fn unexpected(request: &str, response: &Response) -> NetError {
    NetError::UnexpectedResponse(format!("{} answered with {:?}", request, response))
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn load_keypair(store: &CommitStore) -> Result<NodeKeypair, NetError> {
    match store.get_meta(NODE_KEY)? {
        Some(seed) => {
            let seed = String::from_utf8_lossy(&seed);
            Ok(NodeKeypair::from_seed_hex(&seed).map_err(MeshError::from)?)
        }
        None => {
            let keypair = NodeKeypair::generate();
            store.put_meta(NODE_KEY, keypair.seed_hex().as_bytes())?;
            Ok(keypair)
        }
    }
}

fn load_keyring(store: &CommitStore) -> Result<Keyring, NetError> {
    let keyring = match store.get_meta(KEYRING_MASTER_KEY)? {
        Some(master) => {
            let master = hex_to_id::<32>(&String::from_utf8_lossy(&master)).map_err(MeshError::from)?;
            Keyring::new(master)
        }
        None => {
            let keyring = Keyring::generate();
            store.put_meta(KEYRING_MASTER_KEY, keyring.master_hex().as_bytes())?;
            keyring
        }
    };
    if let Some(bytes) = store.get_meta(DOC_KEYS_KEY)? {
        let entries = serde_json::from_slice(&bytes).map_err(MeshError::from)?;
        keyring.import(entries);
    }
    Ok(keyring)
}
