//! Wire messages
//!
//! Every request and response is CBOR-encoded and wrapped in an [`Envelope`]
//! signed by the sender's node key. The receiver checks the signature
//! against the `from` peer id before decoding the body.

use libdagmesh_core::encoding::{from_cbor, to_cbor};
use libdagmesh_core::keys::DocKey;
use libdagmesh_core::signing::{verify_signature, NodeKeypair, VerificationPolicy};
use libdagmesh_core::{Cid, Commit, DocId, KeyId, MeshError, PeerId, Topic};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::identity::{peer_short, PeerInfo};

/// Heads of one document as known by the responder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocHeads {
    pub doc_id: DocId,
    pub collection: String,
    pub heads: Vec<Cid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Open a connection and exchange advertised topics
    Hello { info: PeerInfo, topics: Vec<Topic> },
    /// Change of the sender's advertised topics
    Topics { add: Vec<Topic>, remove: Vec<Topic> },
    /// Sender's heads for a document; the receiver pulls what it lacks
    Announce {
        doc_id: DocId,
        collection: String,
        heads: Vec<Cid>,
    },
    /// New heads with the commits that produced them, parents first
    PushLog {
        doc_id: DocId,
        collection: String,
        heads: Vec<Cid>,
        commits: Vec<Commit>,
    },
    FetchCommit { cid: Cid },
    FetchHeads { doc_id: DocId },
    SyncDocuments {
        collection: String,
        doc_ids: Vec<DocId>,
    },
    /// Heads of every document matching one of the topics
    Backfill { topics: Vec<Topic> },
    /// Sender became a replicator source for the receiver
    ReplicatorAdded {
        #[serde(default)]
        collections: Option<Vec<String>>,
    },
    ReplicatorRemoved,
    /// One of the document keys, named by its fingerprint
    FetchKey { doc_id: DocId, key_id: KeyId },
    Goodbye,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Topics { .. } => "topics",
            Request::Announce { .. } => "announce",
            Request::PushLog { .. } => "push_log",
            Request::FetchCommit { .. } => "fetch_commit",
            Request::FetchHeads { .. } => "fetch_heads",
            Request::SyncDocuments { .. } => "sync_documents",
            Request::Backfill { .. } => "backfill",
            Request::ReplicatorAdded { .. } => "replicator_added",
            Request::ReplicatorRemoved => "replicator_removed",
            Request::FetchKey { .. } => "fetch_key",
            Request::Goodbye => "goodbye",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ack,
    Topics(Vec<Topic>),
    Commit(Commit),
    Heads(Vec<Cid>),
    DocumentHeads(Vec<DocHeads>),
    Key(DocKey),
    Error { code: String, message: String },
}

/// Signed frame carrying one CBOR-encoded message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Envelope {
    pub fn seal<T: Serialize>(keypair: &NodeKeypair, message: &T) -> Result<Self, MeshError> {
        let body = to_cbor(message)?;
        let signature = keypair.sign(&body);
        Ok(Self {
            from: keypair.peer_id(),
            body,
            signature,
        })
    }

    /// Verify according to `policy` and decode the body
    pub fn open<T: DeserializeOwned>(&self, policy: VerificationPolicy) -> Result<T, MeshError> {
        if policy != VerificationPolicy::Off {
            if let Err(e) = verify_signature(&self.from, &self.body, &self.signature) {
                if policy == VerificationPolicy::Require {
                    return Err(MeshError::Unauthorized(format!(
                        "bad signature from {}: {}",
                        peer_short(&self.from),
                        e
                    )));
                }
                warn!(peer = %peer_short(&self.from), error = %e, "accepting frame with bad signature");
            }
        }
        from_cbor(&self.body)
    }
}
