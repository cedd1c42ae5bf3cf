//! In-process cluster and the action dispatcher

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use libdagmesh_core::types::ids::doc_id_to_string;
use libdagmesh_core::{AccessGate, AllowAll, CollectionRegistry, DocId, NodeConfig};
use serde_json::json;
use tracing::{debug, info};

use crate::action::{Action, Fields};
use crate::convergence::ConvergenceTracker;
use crate::error::NetError;
use crate::node::{Node, WriteOutcome};
use crate::transport::Network;

pub struct ClusterBuilder {
    registry: CollectionRegistry,
    config: NodeConfig,
    nodes: Vec<(String, Arc<dyn AccessGate>)>,
}

impl ClusterBuilder {
    pub fn new(registry: CollectionRegistry) -> Self {
        Self {
            registry,
            config: NodeConfig::default(),
            nodes: Vec::new(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn node(self, name: impl Into<String>) -> Self {
        self.node_with_gate(name, Arc::new(AllowAll))
    }

    pub fn node_with_gate(mut self, name: impl Into<String>, gate: Arc<dyn AccessGate>) -> Self {
        self.nodes.push((name.into(), gate));
        self
    }

    /// Add `count` nodes named `node0`, `node1`, ...
    pub fn nodes(mut self, count: usize) -> Self {
        let start = self.nodes.len();
        for i in start..start + count {
            self = self.node(format!("node{}", i));
        }
        self
    }

    pub async fn build(self) -> Result<Cluster, NetError> {
        if self.nodes.is_empty() {
            return Err(libdagmesh_core::MeshError::InvalidArgs("cluster without nodes".to_string()).into());
        }
        let network = Network::new();
        let registry = Arc::new(self.registry);

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (name, gate) in self.nodes {
            if nodes.iter().any(|n: &Node| n.name() == name) {
                return Err(libdagmesh_core::MeshError::InvalidArgs(format!("duplicate node name '{}'", name)).into());
            }
            let node = Node::start(name, network.clone(), registry.clone(), self.config.clone(), gate).await?;
            nodes.push(node);
        }

        let tracker = ConvergenceTracker::new(nodes.clone());
        info!(nodes = nodes.len(), "cluster started");
        Ok(Cluster {
            nodes,
            tracker,
            docs: HashMap::new(),
            config: self.config,
        })
    }
}

/// A set of nodes on one in-process network, driven by [`Action`]s
pub struct Cluster {
    nodes: Vec<Node>,
    tracker: ConvergenceTracker,
    /// Document ids per collection in creation order
    docs: HashMap<String, Vec<DocId>>,
    config: NodeConfig,
}

impl Cluster {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Result<&Node, NetError> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| NetError::UnknownNode(name.to_string()))
    }

    pub fn tracker(&self) -> &ConvergenceTracker {
        &self.tracker
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Id of the `index`-th document created in `collection`
    pub fn doc_id(&self, collection: &str, index: usize) -> Result<DocId, NetError> {
        self.docs
            .get(collection)
            .and_then(|docs| docs.get(index))
            .copied()
            .ok_or_else(|| {
                libdagmesh_core::MeshError::NotFound(format!(
                    "document #{} of {}",
                    index, collection
                ))
                .into()
            })
    }

    /// Run one action, checking its expected error if it names one
    pub async fn apply(&mut self, action: &Action) -> Result<(), NetError> {
        debug!(action = action.name(), "applying action");
        let result = self.dispatch(action).await;
        if action.is_topology() && result.is_ok() {
            self.tracker.recompute().await;
        }

        match (action.expected_error(), result) {
            (None, result) => result,
            (Some(expected), Err(e)) if e.error_code() == expected => {
                debug!(action = action.name(), code = expected, "failed as expected");
                Ok(())
            }
            (Some(expected), Err(e)) => Err(NetError::Expectation(format!(
                "{} should fail with {} but failed with {}: {}",
                action.name(),
                expected,
                e.error_code(),
                e
            ))),
            (Some(expected), Ok(())) => Err(NetError::Expectation(format!(
                "{} should fail with {} but succeeded",
                action.name(),
                expected
            ))),
        }
    }

    /// Apply actions in order, stopping at the first failure
    pub async fn run(&mut self, actions: &[Action]) -> Result<(), NetError> {
        for (index, action) in actions.iter().enumerate() {
            self.apply(action).await.map_err(|e| {
                info!(index, action = action.name(), error = %e, "action failed");
                e
            })?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, action: &Action) -> Result<(), NetError> {
        match action {
            Action::CreateDoc {
                node,
                collection,
                fields,
                ..
            } => {
                for target in self.targets(node.as_deref())? {
                    let outcome = target.create_document(collection, fields).await?;
                    self.remember(collection, outcome.doc_id);
                    self.tracker.record_write(target.name(), collection, &outcome);
                }
                Ok(())
            }

            Action::UpdateDoc {
                node,
                collection,
                doc,
                fields,
                ..
            } => {
                let doc_id = self.doc_id(collection, *doc)?;
                for target in self.targets(node.as_deref())? {
                    let outcome = target.update_document(collection, &doc_id, fields).await?;
                    self.tracker.record_write(target.name(), collection, &outcome);
                }
                Ok(())
            }

            Action::DeleteDoc {
                node,
                collection,
                doc,
                ..
            } => {
                let doc_id = self.doc_id(collection, *doc)?;
                for target in self.targets(node.as_deref())? {
                    let outcome: WriteOutcome = target.delete_document(collection, &doc_id).await?;
                    self.tracker.record_write(target.name(), collection, &outcome);
                }
                Ok(())
            }

            Action::Connect { from, to } => {
                let peer = self.node(to)?.info();
                self.node(from)?.connect(&peer).await
            }

            Action::ConfigureReplicator {
                source,
                target,
                collections,
                ..
            } => {
                let peer = self.node(target)?.info();
                self.node(source)?
                    .configure_replicator(&peer, collections.clone())
                    .await
            }

            Action::DeleteReplicator { source, target, .. } => {
                let peer = self.node(target)?.peer_id();
                self.node(source)?.delete_replicator(&peer).await
            }

            Action::SubscribeToCollection {
                node, collections, ..
            } => self.node(node)?.subscribe_to_collections(collections).await,

            Action::UnsubscribeFromCollection { node, collections } => {
                self.node(node)?
                    .unsubscribe_from_collections(collections)
                    .await
            }

            Action::SubscribeToDocument {
                node,
                collection,
                docs,
            } => {
                let ids = self.doc_ids(collection, docs)?;
                self.node(node)?.subscribe_to_documents(&ids).await
            }

            Action::UnsubscribeFromDocument {
                node,
                collection,
                docs,
            } => {
                let ids = self.doc_ids(collection, docs)?;
                self.node(node)?.unsubscribe_from_documents(&ids).await
            }

            Action::SyncDocuments {
                node,
                collection,
                docs,
                ..
            } => {
                let ids = self.doc_ids(collection, docs)?;
                let target = self.node(node)?.clone();
                let report = target.sync_documents(collection, &ids).await?;
                for doc_id in &report.accepted {
                    let heads = target.heads(doc_id)?;
                    self.tracker.record_held(target.name(), *doc_id, collection, &heads);
                }
                match report.errors.into_iter().next() {
                    Some((_, e)) => Err(e),
                    None => Ok(()),
                }
            }

            Action::WaitForSync { timeout_ms, .. } => {
                self.tracker
                    .wait_for_sync(Duration::from_millis(*timeout_ms))
                    .await?;
                Ok(())
            }

            Action::AssertDoc {
                node,
                collection,
                doc,
                fields,
                deleted,
            } => {
                let doc_id = self.doc_id(collection, *doc)?;
                for target in self.targets(node.as_deref())? {
                    let document = target.document(&doc_id)?;
                    if document.deleted != *deleted {
                        return Err(NetError::Expectation(format!(
                            "{} on {}: deleted is {}",
                            doc_id_to_string(&doc_id),
                            target.name(),
                            document.deleted
                        )));
                    }
                    check_fields(target.name(), &doc_id, &document.to_json(), fields)?;
                }
                Ok(())
            }

            Action::AssertMissing {
                node,
                collection,
                doc,
            } => {
                let doc_id = self.doc_id(collection, *doc)?;
                for target in self.targets(node.as_deref())? {
                    if !target.heads(&doc_id)?.is_empty() {
                        return Err(NetError::Expectation(format!(
                            "{} should not be on {}",
                            doc_id_to_string(&doc_id),
                            target.name()
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    fn targets(&self, node: Option<&str>) -> Result<Vec<Node>, NetError> {
        match node {
            Some(name) => Ok(vec![self.node(name)?.clone()]),
            None => Ok(self.nodes.clone()),
        }
    }

    fn doc_ids(&self, collection: &str, indexes: &[usize]) -> Result<Vec<DocId>, NetError> {
        indexes
            .iter()
            .map(|index| self.doc_id(collection, *index))
            .collect()
    }

    fn remember(&mut self, collection: &str, doc_id: DocId) {
        let docs = self.docs.entry(collection.to_string()).or_default();
        if !docs.contains(&doc_id) {
            docs.push(doc_id);
        }
    }

    /// Materialized documents of every node: `{node: {collection: [doc]}}`.
    /// Documents a node cannot read are left out.
    pub fn documents(&self) -> Result<serde_json::Value, NetError> {
        let mut out = serde_json::Map::new();
        for node in &self.nodes {
            let mut collections = serde_json::Map::new();
            for name in node.registry().names() {
                let docs: Vec<serde_json::Value> = node
                    .documents(&name)?
                    .iter()
                    .map(|doc| doc.to_json())
                    .collect();
                collections.insert(name, json!(docs));
            }
            out.insert(node.name().to_string(), serde_json::Value::Object(collections));
        }
        Ok(serde_json::Value::Object(out))
    }

    pub async fn shutdown(&self) -> Result<(), NetError> {
        self.tracker.shutdown().await;
        for node in &self.nodes {
            node.shutdown().await?;
        }
        info!("cluster stopped");
        Ok(())
    }
}

fn check_fields(
    node: &str,
    doc_id: &DocId,
    document: &serde_json::Value,
    expected: &Fields,
) -> Result<(), NetError> {
    let actual = document.get("fields").cloned().unwrap_or(json!({}));
    let mismatches: BTreeMap<&String, (&serde_json::Value, Option<&serde_json::Value>)> = expected
        .iter()
        .filter_map(|(name, want)| {
            let got = actual.get(name);
            match got {
                Some(got) if values_match(want, got) => None,
                _ => Some((name, (want, got))),
            }
        })
        .collect();
    if mismatches.is_empty() {
        return Ok(());
    }
    let detail: Vec<String> = mismatches
        .iter()
        .map(|(name, (want, got))| match got {
            Some(got) => format!("{}: expected {} got {}", name, want, got),
            None => format!("{}: expected {} got nothing", name, want),
        })
        .collect();
    Err(NetError::Expectation(format!(
        "{} on {}: {}",
        doc_id_to_string(doc_id),
        node,
        detail.join(", ")
    )))
}

/// Equality with numbers compared by value, so `30` matches `30.0`
fn values_match(want: &serde_json::Value, got: &serde_json::Value) -> bool {
    match (want.as_f64(), got.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        _ => want == got,
    }
}
