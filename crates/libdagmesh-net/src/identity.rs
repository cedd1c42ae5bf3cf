use libdagmesh_core::types::ids::short_hex;
use libdagmesh_core::PeerId;
use serde::{Deserialize, Serialize};

/// Address card of a node. `id` is the node's ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: String,
}

impl PeerInfo {
    pub fn new(id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }

    pub fn short(&self) -> String {
        peer_short(&self.id)
    }
}

/// Abbreviated peer id for log fields
pub fn peer_short(id: &PeerId) -> String {
    short_hex(id)
}
