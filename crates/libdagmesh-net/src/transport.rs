//! In-process transport
//!
//! Each node registers a bounded inbox keyed by its peer id. A request is an
//! envelope plus a oneshot reply channel, so every call is a single
//! round-trip with its own timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use libdagmesh_core::PeerId;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;

use crate::error::NetError;
use crate::identity::peer_short;
use crate::message::Envelope;

/// One inbound request awaiting a reply
pub struct Inbound {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<Envelope>,
}

/// Routing table shared by every node of a cluster
#[derive(Clone, Default)]
pub struct Network {
    routes: Arc<RwLock<HashMap<PeerId, mpsc::Sender<Inbound>>>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox for `peer`, replacing any previous one
    pub async fn register(&self, peer: PeerId, capacity: usize) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes.write().await.insert(peer, tx);
        debug!(peer = %peer_short(&peer), "inbox registered");
        rx
    }

    pub async fn unregister(&self, peer: &PeerId) {
        self.routes.write().await.remove(peer);
    }

    pub async fn is_registered(&self, peer: &PeerId) -> bool {
        self.routes.read().await.contains_key(peer)
    }

    /// Deliver `envelope` to `to` and wait for the reply
    pub async fn request(
        &self,
        to: &PeerId,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, NetError> {
        let tx = self
            .routes
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| NetError::Unreachable(peer_short(to)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            tx.send(Inbound {
                envelope,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetError::Unreachable(peer_short(to)))?;
            reply_rx
                .await
                .map_err(|_| NetError::Unreachable(peer_short(to)))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(NetError::RequestTimeout {
                peer: peer_short(to),
                ms: timeout.as_millis() as u64,
            }),
        }
    }
}
