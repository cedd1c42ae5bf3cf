//! Convergence tracking
//!
//! The tracker listens to the event bus of every node and records the head
//! set each node last reported per document (the actual heads). From the
//! writes it is told about and the topology of every node it derives the
//! heads each node is owed (the expected heads): a version held by one node
//! flows along the same edges the push rules use, until nothing changes.
//! The expected heads of a document are the maximal versions a node holds
//! after that propagation.
//!
//! Access gates are not part of the model. A gate that withholds a document
//! therefore shows up as a divergence.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use libdagmesh_core::types::ids::{doc_id_to_string, short_hex};
use libdagmesh_core::{
    Cid, Commit, Divergence, DocId, Event, EventFilter, EventKind, MeshError, PeerId, Subscription,
};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::node::{Node, WriteOutcome};
use crate::topology::PeerState;

/// Longest pause between two convergence checks
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Heads a node reported for one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocHeadState {
    pub heads: BTreeSet<Cid>,
    pub decrypted: bool,
}

type PerNode<T> = BTreeMap<String, BTreeMap<DocId, T>>;

#[derive(Default)]
struct TrackerState {
    actual: PerNode<DocHeadState>,
    /// Every version each node is known to hold, directly or by report
    held: PerNode<BTreeSet<Cid>>,
    expected: PerNode<BTreeSet<Cid>>,
    collections: HashMap<DocId, String>,
    parents: HashMap<Cid, Vec<Cid>>,
}

impl TrackerState {
    fn observe(&mut self, node: &str, doc_id: DocId, collection: &str, heads: &[Cid], decrypted: bool) {
        self.collections
            .entry(doc_id)
            .or_insert_with(|| collection.to_string());
        self.held
            .entry(node.to_string())
            .or_default()
            .entry(doc_id)
            .or_default()
            .extend(heads.iter().copied());
        self.actual.entry(node.to_string()).or_default().insert(
            doc_id,
            DocHeadState {
                heads: heads.iter().copied().collect(),
                decrypted,
            },
        );
    }
}

pub struct ConvergenceTracker {
    nodes: Vec<Node>,
    state: Arc<Mutex<TrackerState>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConvergenceTracker {
    /// Start observing `nodes`. Events published before this call are not
    /// seen; documents the nodes already hold are read from their stores.
    pub fn new(nodes: Vec<Node>) -> Self {
        let state = Arc::new(Mutex::new(TrackerState::default()));
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let mut consumers = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let subscription = node.subscribe(EventFilter::kinds([EventKind::Update, EventKind::Merge]));
            resync(node, &mut lock(&state));
            consumers.push(tokio::spawn(consume(
                node.clone(),
                subscription,
                state.clone(),
                notify.clone(),
                cancel.clone(),
            )));
        }

        Self {
            nodes,
            state,
            notify,
            cancel,
            consumers: Mutex::new(consumers),
        }
    }

    /// Record a local write as soon as it returns, ahead of its event
    pub fn record_write(&self, node: &str, collection: &str, outcome: &WriteOutcome) {
        let mut state = lock(&self.state);
        state.parents.insert(outcome.cid, outcome.parents.clone());
        state
            .collections
            .entry(outcome.doc_id)
            .or_insert_with(|| collection.to_string());
        state
            .held
            .entry(node.to_string())
            .or_default()
            .entry(outcome.doc_id)
            .or_default()
            .insert(outcome.cid);
    }

    /// Record versions a node obtained outside the push rules
    pub fn record_held(&self, node: &str, doc_id: DocId, collection: &str, heads: &[Cid]) {
        let mut state = lock(&self.state);
        state
            .collections
            .entry(doc_id)
            .or_insert_with(|| collection.to_string());
        state
            .held
            .entry(node.to_string())
            .or_default()
            .entry(doc_id)
            .or_default()
            .extend(heads.iter().copied());
    }

    /// Recompute the expected heads from the current topology
    pub async fn recompute(&self) {
        let mut topology = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            topology.push((node.name().to_string(), node.peer_id(), node.peer_state().await));
        }

        let mut state = lock(&self.state);
        let held = propagate(&topology, &state.held, &state.collections);

        let mut expected: PerNode<BTreeSet<Cid>> = BTreeMap::new();
        for (name, docs) in &held {
            for (doc_id, versions) in docs {
                let maximal = maximal_versions(versions, &mut state.parents, &self.nodes);
                expected
                    .entry(name.clone())
                    .or_default()
                    .insert(*doc_id, maximal);
            }
        }
        state.expected = expected;
    }

    /// (node, document) pairs whose actual heads differ from the expected
    pub fn diverging(&self) -> Vec<Divergence> {
        let state = lock(&self.state);
        let mut out = Vec::new();
        for (name, docs) in &state.expected {
            for (doc_id, expected) in docs {
                let actual = state
                    .actual
                    .get(name)
                    .and_then(|docs| docs.get(doc_id))
                    .map(|s| s.heads.clone())
                    .unwrap_or_default();
                if &actual != expected {
                    out.push(Divergence {
                        node: name.clone(),
                        doc: doc_id_to_string(doc_id),
                        expected: expected.iter().map(short_hex).collect(),
                        actual: actual.iter().map(short_hex).collect(),
                    });
                }
            }
        }
        out
    }

    /// Block until every node reports the heads it is owed
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), MeshError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            self.recompute().await;
            let diverging = self.diverging();
            if diverging.is_empty() {
                debug!(nodes = self.nodes.len(), "converged");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(pairs = diverging.len(), "convergence timed out");
                return Err(MeshError::Timeout {
                    what: format!(
                        "convergence of {} nodes after {}ms",
                        self.nodes.len(),
                        timeout.as_millis()
                    ),
                    diverging,
                });
            }

            let pause = (deadline - now).min(POLL_INTERVAL);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    pub fn actual_heads(&self, node: &str, doc_id: &DocId) -> Option<DocHeadState> {
        lock(&self.state)
            .actual
            .get(node)
            .and_then(|docs| docs.get(doc_id))
            .cloned()
    }

    /// Expected heads as of the last recompute
    pub fn expected_heads(&self, node: &str, doc_id: &DocId) -> BTreeSet<Cid> {
        lock(&self.state)
            .expected
            .get(node)
            .and_then(|docs| docs.get(doc_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let consumers: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.consumers));
        for consumer in consumers {
            let _ = consumer.await;
        }
    }
}

async fn consume(
    node: Node,
    mut subscription: Subscription,
    state: Arc<Mutex<TrackerState>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut lagged = 0;
    while let Some(event) = subscription.recv_cancellable(&cancel).await {
        {
            let mut state = lock(&state);
            match &event {
                Event::Update(update) => {
                    state.parents.insert(update.cid, update.parents.clone());
                    state.observe(node.name(), update.doc_id, &update.collection, &update.heads, true);
                }
                Event::Merge(merge) => {
                    state.observe(node.name(), merge.doc_id, &merge.collection, &merge.heads, merge.decrypted);
                }
                _ => {}
            }
            if subscription.lagged() != lagged {
                lagged = subscription.lagged();
                resync(&node, &mut state);
            }
        }
        notify.notify_waiters();
    }
}

/// Rebuild a node's actual heads from its store
fn resync(node: &Node, state: &mut TrackerState) {
    let docs = match node.store().all_documents() {
        Ok(docs) => docs,
        Err(e) => {
            warn!(node = %node.name(), error = %e, "tracker resync failed");
            return;
        }
    };
    for (doc_id, collection) in docs {
        let heads = match node.store().heads(&doc_id) {
            Ok(heads) if !heads.is_empty() => heads,
            _ => continue,
        };
        let decrypted = node.is_decryptable(&doc_id);
        state.observe(node.name(), doc_id, &collection, &heads, decrypted);
    }
}

/// Whether `x` pushes changes of a document back to its replicator source
/// `y`. The node marks a document shared when it arrives over the inbound
/// edge. A source that holds an admitted document pushes it over that edge,
/// so holding it counts as shared once propagation settles.
fn shared_through(
    x_state: &PeerState,
    y_id: &PeerId,
    doc_id: &DocId,
    collection: &str,
    y_holds: bool,
) -> bool {
    x_state.inbound.iter().any(|edge| {
        &edge.source == y_id
            && edge.admits(collection)
            && (y_holds || edge.shared.contains(doc_id))
    })
}

/// Spread held versions along the push edges until nothing changes
fn propagate(
    topology: &[(String, PeerId, PeerState)],
    held: &PerNode<BTreeSet<Cid>>,
    collections: &HashMap<DocId, String>,
) -> PerNode<BTreeSet<Cid>> {
    let mut held = held.clone();
    loop {
        let mut changed = false;
        for (x_name, _, x_state) in topology {
            let x_docs = match held.get(x_name) {
                Some(docs) => docs.clone(),
                None => continue,
            };
            for (doc_id, versions) in x_docs {
                let Some(collection) = collections.get(&doc_id) else {
                    continue;
                };
                for (y_name, y_id, y_state) in topology {
                    if y_name == x_name {
                        continue;
                    }
                    let y_holds = held
                        .get(y_name)
                        .and_then(|docs| docs.get(&doc_id))
                        .map(|v| !v.is_empty())
                        .unwrap_or(false);
                    let connected = x_state.is_connected(y_id)
                        && (y_state.collections.contains(collection)
                            || y_state.documents.contains(&doc_id)
                            || y_holds);
                    let replicates = x_state
                        .replicator(y_id)
                        .map(|edge| edge.admits(collection))
                        .unwrap_or(false);
                    let pushes_back = shared_through(x_state, y_id, &doc_id, collection, y_holds);
                    if !(connected || replicates || pushes_back) {
                        continue;
                    }

                    let target = held
                        .entry(y_name.clone())
                        .or_default()
                        .entry(doc_id)
                        .or_default();
                    let before = target.len();
                    target.extend(versions.iter().copied());
                    changed |= target.len() != before;
                }
            }
        }
        if !changed {
            return held;
        }
    }
}

/// Versions of `versions` that are not an ancestor of another one
fn maximal_versions(
    versions: &BTreeSet<Cid>,
    parents: &mut HashMap<Cid, Vec<Cid>>,
    nodes: &[Node],
) -> BTreeSet<Cid> {
    let mut ancestors: HashSet<Cid> = HashSet::new();
    let mut queue: VecDeque<Cid> = VecDeque::new();
    for cid in versions {
        queue.extend(parents_of(cid, parents, nodes));
    }
    while let Some(cid) = queue.pop_front() {
        if ancestors.insert(cid) {
            queue.extend(parents_of(&cid, parents, nodes));
        }
    }
    versions
        .iter()
        .filter(|cid| !ancestors.contains(*cid))
        .copied()
        .collect()
}

fn parents_of(cid: &Cid, cache: &mut HashMap<Cid, Vec<Cid>>, nodes: &[Node]) -> Vec<Cid> {
    if let Some(parents) = cache.get(cid) {
        return parents.clone();
    }
    for node in nodes {
        if let Ok(Commit::Composite(composite)) = node.store().get(cid) {
            cache.insert(*cid, composite.parents.clone());
            return composite.parents;
        }
    }
    Vec::new()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
