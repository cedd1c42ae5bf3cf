//! Access gate consulted before a document is read, forwarded or keyed

use std::collections::HashSet;
use std::sync::RwLock;

use crate::error::MeshError;
use crate::types::ids::{doc_id_to_string, DocId, PeerId};

/// Authorization hook. The default methods allow everything.
pub trait AccessGate: Send + Sync {
    /// Called before a document is materialized locally
    fn check_read(&self, _collection: &str, _doc_id: &DocId) -> Result<(), MeshError> {
        Ok(())
    }

    /// Whether commits of a document may be sent to `peer`
    fn may_forward(&self, _peer: &PeerId, _collection: &str, _doc_id: &DocId) -> bool {
        true
    }

    /// Whether `peer` may receive the document's encryption key
    fn may_share_key(&self, _peer: &PeerId, _doc_id: &DocId) -> bool {
        true
    }
}

/// Gate that allows every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {}

#[derive(Debug, Default)]
struct Policy {
    denied_reads: HashSet<String>,
    denied_forwards: HashSet<(PeerId, String)>,
    key_holders: Option<HashSet<PeerId>>,
}

/// Rule-based gate that can be adjusted at runtime
#[derive(Debug, Default)]
pub struct PolicyGate {
    policy: RwLock<Policy>,
}

impl PolicyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to materialize documents of a collection
    pub fn deny_read(&self, collection: &str) {
        self.write().denied_reads.insert(collection.to_string());
    }

    /// Never send documents of `collection` to `peer`
    pub fn deny_forward(&self, peer: PeerId, collection: &str) {
        self.write()
            .denied_forwards
            .insert((peer, collection.to_string()));
    }

    pub fn allow_forward(&self, peer: PeerId, collection: &str) {
        self.write()
            .denied_forwards
            .remove(&(peer, collection.to_string()));
    }

    /// Only hand document keys to the listed peers
    pub fn restrict_keys(&self, peers: impl IntoIterator<Item = PeerId>) {
        self.write().key_holders = Some(peers.into_iter().collect());
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Policy> {
        self.policy.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Policy> {
        self.policy.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl AccessGate for PolicyGate {
    fn check_read(&self, collection: &str, doc_id: &DocId) -> Result<(), MeshError> {
        if self.read().denied_reads.contains(collection) {
            return Err(MeshError::Unauthorized(format!(
                "read of {} in {} denied",
                doc_id_to_string(doc_id),
                collection
            )));
        }
        Ok(())
    }

    fn may_forward(&self, peer: &PeerId, collection: &str, _doc_id: &DocId) -> bool {
        !self
            .read()
            .denied_forwards
            .contains(&(*peer, collection.to_string()))
    }

    fn may_share_key(&self, peer: &PeerId, _doc_id: &DocId) -> bool {
        match &self.read().key_holders {
            Some(holders) => holders.contains(peer),
            None => true,
        }
    }
}
