//! Peer topology of one node
//!
//! Connections and the topics each connected peer advertised are live state
//! and are rebuilt on every start. Replicator edges and subscriptions are
//! persisted in the store's metadata tree as JSON.

use std::collections::{BTreeMap, BTreeSet};

use libdagmesh_core::types::ids::doc_id_to_string;
use libdagmesh_core::{DocId, MeshError, PeerId, Topic};
use serde::{Deserialize, Serialize};

use crate::identity::{peer_short, PeerInfo};

/// Metadata key of the persisted topology
pub const PEER_STATE_KEY: &str = "peer_state";

/// Outbound push edge to a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorEdge {
    pub target: PeerInfo,
    /// Collections pushed; `None` pushes every collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<BTreeSet<String>>,
}

impl ReplicatorEdge {
    pub fn admits(&self, collection: &str) -> bool {
        admits(&self.collections, collection)
    }
}

/// Edge from a source that replicates into this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundReplicator {
    pub source: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<BTreeSet<String>>,
    /// Documents received through this edge; changes to them flow back
    #[serde(default)]
    pub shared: BTreeSet<DocId>,
}

impl InboundReplicator {
    pub fn admits(&self, collection: &str) -> bool {
        admits(&self.collections, collection)
    }
}

fn admits(filter: &Option<BTreeSet<String>>, collection: &str) -> bool {
    match filter {
        Some(collections) => collections.contains(collection),
        None => true,
    }
}

fn merge_filters(
    a: &Option<BTreeSet<String>>,
    b: &Option<BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union(b).cloned().collect()),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerState {
    #[serde(skip)]
    pub connections: BTreeMap<PeerId, PeerInfo>,
    #[serde(skip)]
    pub remote_topics: BTreeMap<PeerId, BTreeSet<Topic>>,
    #[serde(default)]
    pub replicators: Vec<ReplicatorEdge>,
    #[serde(default)]
    pub inbound: Vec<InboundReplicator>,
    #[serde(default)]
    pub collections: BTreeSet<String>,
    #[serde(default)]
    pub documents: BTreeSet<DocId>,
}

impl PeerState {
    // Connections

    /// Returns true if the peer was not connected before
    pub fn connect(&mut self, info: PeerInfo) -> bool {
        self.connections.insert(info.id, info).is_none()
    }

    pub fn disconnect(&mut self, peer: &PeerId) -> bool {
        self.remote_topics.remove(peer);
        self.connections.remove(peer).is_some()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    pub fn set_remote_topics(&mut self, peer: &PeerId, topics: impl IntoIterator<Item = Topic>) {
        self.remote_topics.insert(*peer, topics.into_iter().collect());
    }

    /// Apply a topic diff from `peer`. Returns the topics that were new.
    pub fn update_remote_topics(&mut self, peer: &PeerId, add: &[Topic], remove: &[Topic]) -> Vec<Topic> {
        let topics = self.remote_topics.entry(*peer).or_default();
        for topic in remove {
            topics.remove(topic);
        }
        add.iter()
            .filter(|topic| topics.insert((*topic).clone()))
            .cloned()
            .collect()
    }

    /// Whether a connected peer advertised interest in the document
    pub fn remote_interest(&self, peer: &PeerId, doc_id: &DocId, collection: &str) -> bool {
        self.remote_topics
            .get(peer)
            .map(|topics| topics.iter().any(|t| t.matches(doc_id, collection)))
            .unwrap_or(false)
    }

    // Replicators

    /// Add or widen an outbound edge to `target`
    pub fn add_replicator(
        &mut self,
        local: &PeerId,
        target: PeerInfo,
        collections: Option<BTreeSet<String>>,
    ) -> Result<(), MeshError> {
        self.check_outbound(local, &target.id)?;
        match self.replicators.iter_mut().find(|e| e.target.id == target.id) {
            Some(edge) => {
                edge.collections = merge_filters(&edge.collections, &collections);
                edge.target = target;
            }
            None => self.replicators.push(ReplicatorEdge {
                target,
                collections,
            }),
        }
        Ok(())
    }

    /// Fail if an outbound edge to `target` is not allowed
    pub fn check_outbound(&self, local: &PeerId, target: &PeerId) -> Result<(), MeshError> {
        if local == target {
            return Err(MeshError::InvalidArgs(
                "a node cannot replicate to itself".to_string(),
            ));
        }
        if self.inbound.iter().any(|i| &i.source == target) {
            return Err(MeshError::TopologyConflict(format!(
                "{} already replicates to this node",
                peer_short(target)
            )));
        }
        Ok(())
    }

    pub fn remove_replicator(&mut self, target: &PeerId) -> bool {
        let before = self.replicators.len();
        self.replicators.retain(|e| &e.target.id != target);
        self.replicators.len() != before
    }

    pub fn replicator(&self, target: &PeerId) -> Option<&ReplicatorEdge> {
        self.replicators.iter().find(|e| &e.target.id == target)
    }

    /// Record `source` as replicating into this node
    pub fn add_inbound(
        &mut self,
        source: &PeerId,
        collections: Option<BTreeSet<String>>,
    ) -> Result<(), MeshError> {
        if self.replicators.iter().any(|e| &e.target.id == source) {
            return Err(MeshError::TopologyConflict(format!(
                "this node already replicates to {}",
                peer_short(source)
            )));
        }
        match self.inbound.iter_mut().find(|i| &i.source == source) {
            Some(existing) => {
                existing.collections = merge_filters(&existing.collections, &collections);
            }
            None => self.inbound.push(InboundReplicator {
                source: *source,
                collections,
                shared: BTreeSet::new(),
            }),
        }
        Ok(())
    }

    pub fn remove_inbound(&mut self, source: &PeerId) -> bool {
        let before = self.inbound.len();
        self.inbound.retain(|i| &i.source != source);
        self.inbound.len() != before
    }

    /// Mark a document as shared through the inbound edge from `source`.
    /// Returns true if the mark is new.
    pub fn mark_shared(&mut self, source: &PeerId, doc_id: &DocId, collection: &str) -> bool {
        match self.inbound.iter_mut().find(|i| &i.source == source) {
            Some(edge) if edge.admits(collection) => edge.shared.insert(*doc_id),
            _ => false,
        }
    }

    // Subscriptions

    /// Returns the collections that were not subscribed before
    pub fn subscribe_collections(&mut self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.collections.insert((*n).clone()))
            .cloned()
            .collect()
    }

    pub fn unsubscribe_collections(&mut self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.collections.remove(*n))
            .cloned()
            .collect()
    }

    pub fn subscribe_documents(&mut self, doc_ids: &[DocId]) -> Vec<DocId> {
        doc_ids
            .iter()
            .filter(|d| self.documents.insert(**d))
            .copied()
            .collect()
    }

    pub fn unsubscribe_documents(&mut self, doc_ids: &[DocId]) -> Vec<DocId> {
        doc_ids
            .iter()
            .filter(|d| self.documents.remove(*d))
            .copied()
            .collect()
    }

    /// Topics this node advertises: its subscriptions plus every held
    /// document whose collection it is not already subscribed to
    pub fn advertised_topics<'a>(
        &self,
        held: impl IntoIterator<Item = &'a (DocId, String)>,
    ) -> BTreeSet<Topic> {
        let mut topics: BTreeSet<Topic> = self
            .collections
            .iter()
            .map(|c| Topic::Collection(c.clone()))
            .collect();
        topics.extend(self.documents.iter().map(|d| Topic::Document(*d)));
        for (doc_id, collection) in held {
            if !self.collections.contains(collection) {
                topics.insert(Topic::Document(*doc_id));
            }
        }
        topics
    }

    /// Peers a new head of the document must be pushed to
    pub fn push_targets(
        &self,
        doc_id: &DocId,
        collection: &str,
        exclude: Option<&PeerId>,
    ) -> BTreeSet<PeerId> {
        let mut targets = BTreeSet::new();
        for peer in self.connections.keys() {
            if self.remote_interest(peer, doc_id, collection) {
                targets.insert(*peer);
            }
        }
        for edge in &self.replicators {
            if edge.admits(collection) {
                targets.insert(edge.target.id);
            }
        }
        for edge in &self.inbound {
            if edge.shared.contains(doc_id) {
                targets.insert(edge.source);
            }
        }
        if let Some(excluded) = exclude {
            targets.remove(excluded);
        }
        targets
    }

    /// Human-readable summary for logs
    pub fn describe(&self) -> String {
        format!(
            "connections={} replicators={} inbound={} collections={} documents=[{}]",
            self.connections.len(),
            self.replicators.len(),
            self.inbound.len(),
            self.collections.iter().cloned().collect::<Vec<_>>().join(","),
            self.documents
                .iter()
                .map(doc_id_to_string)
                .collect::<Vec<_>>()
                .join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: PeerId = [1; 32];
    const B: PeerId = [2; 32];
    const C: PeerId = [3; 32];
    const DOC: DocId = [7; 16];

    fn info(id: PeerId) -> PeerInfo {
        PeerInfo::new(id, format!("mem://{}", id[0]))
    }

    fn set(names: &[&str]) -> Option<BTreeSet<String>> {
        Some(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_self_replicator_rejected() {
        let mut state = PeerState::default();
        let err = state.add_replicator(&LOCAL, info(LOCAL), None).unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgs(_)));
    }

    #[test]
    fn test_opposite_edge_conflicts() {
        let mut state = PeerState::default();
        state.add_inbound(&B, None).unwrap();
        let err = state.add_replicator(&LOCAL, info(B), None).unwrap_err();
        assert!(matches!(err, MeshError::TopologyConflict(_)));

        let mut state = PeerState::default();
        state.add_replicator(&LOCAL, info(B), None).unwrap();
        assert!(matches!(
            state.add_inbound(&B, None),
            Err(MeshError::TopologyConflict(_))
        ));
    }

    #[test]
    fn test_reconfigure_merges_filters() {
        let mut state = PeerState::default();
        state.add_replicator(&LOCAL, info(B), set(&["Users"])).unwrap();
        state.add_replicator(&LOCAL, info(B), set(&["Books"])).unwrap();
        assert_eq!(state.replicators.len(), 1);
        assert_eq!(state.replicator(&B).unwrap().collections, set(&["Books", "Users"]));

        state.add_replicator(&LOCAL, info(B), None).unwrap();
        assert!(state.replicator(&B).unwrap().admits("Anything"));
    }

    #[test]
    fn test_push_targets() {
        let mut state = PeerState::default();
        state.connect(info(B));
        state.connect(info(C));
        state.set_remote_topics(&B, [Topic::Collection("Users".into())]);
        state.set_remote_topics(&C, [Topic::Collection("Books".into())]);

        let targets = state.push_targets(&DOC, "Users", None);
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec![B]);
        assert!(state.push_targets(&DOC, "Users", Some(&B)).is_empty());

        state.add_replicator(&LOCAL, info(C), set(&["Users"])).unwrap();
        assert_eq!(state.push_targets(&DOC, "Users", None).len(), 2);
        assert!(state.push_targets(&DOC, "Notes", None).is_empty());
    }

    #[test]
    fn test_inbound_pushes_back_only_shared() {
        let mut state = PeerState::default();
        state.add_inbound(&B, set(&["Users"])).unwrap();
        assert!(state.push_targets(&DOC, "Users", None).is_empty());

        assert!(!state.mark_shared(&B, &DOC, "Books"));
        assert!(state.mark_shared(&B, &DOC, "Users"));
        assert!(!state.mark_shared(&B, &DOC, "Users"));
        assert!(state.push_targets(&DOC, "Users", None).contains(&B));

        assert!(state.remove_inbound(&B));
        assert!(state.push_targets(&DOC, "Users", None).is_empty());
    }

    #[test]
    fn test_advertised_topics_skip_covered_documents() {
        let mut state = PeerState::default();
        state.subscribe_collections(&["Users".to_string()]);
        let held = vec![(DOC, "Users".to_string()), ([8; 16], "Books".to_string())];
        let topics = state.advertised_topics(&held);
        assert!(topics.contains(&Topic::Collection("Users".into())));
        assert!(!topics.contains(&Topic::Document(DOC)));
        assert!(topics.contains(&Topic::Document([8; 16])));
    }

    #[test]
    fn test_topic_diff() {
        let mut state = PeerState::default();
        state.connect(info(B));
        let added = state.update_remote_topics(&B, &[Topic::Document(DOC)], &[]);
        assert_eq!(added, vec![Topic::Document(DOC)]);
        assert!(state.update_remote_topics(&B, &[Topic::Document(DOC)], &[]).is_empty());
        assert!(state.remote_interest(&B, &DOC, "Users"));
        state.update_remote_topics(&B, &[], &[Topic::Document(DOC)]);
        assert!(!state.remote_interest(&B, &DOC, "Users"));
    }

    #[test]
    fn test_persisted_form_skips_live_state() {
        let mut state = PeerState::default();
        state.connect(info(B));
        state.subscribe_documents(&[DOC]);
        state.add_replicator(&LOCAL, info(C), None).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let restored: PeerState = serde_json::from_str(&json).unwrap();
        assert!(restored.connections.is_empty());
        assert_eq!(restored.documents, state.documents);
        assert_eq!(restored.replicators, state.replicators);
    }
}
