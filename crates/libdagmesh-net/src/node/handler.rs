//! Dispatch of inbound requests

use libdagmesh_core::types::ids::{doc_id_to_string, id_to_hex};
use libdagmesh_core::{Commit, DocId, KeyStore, MeshError, PeerId, Topic};
use tracing::{debug, info, warn};

use super::{lock_or_recover, Node};
use crate::error::NetError;
use crate::identity::peer_short;
use crate::message::{DocHeads, Envelope, Request, Response};
use crate::transport::Inbound;

impl Node {
    pub(super) async fn handle_inbound(self, inbound: Inbound) {
        let Inbound { envelope, reply } = inbound;
        let from = envelope.from;

        let response = match envelope.open::<Request>(self.inner.config.verification) {
            Ok(request) => {
                let name = request.name();
                match self.dispatch(from, request).await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(
                            node = %self.inner.name,
                            peer = %peer_short(&from),
                            request = name,
                            error = %e,
                            "request failed"
                        );
                        error_response(&e)
                    }
                }
            }
            Err(e) => {
                warn!(node = %self.inner.name, peer = %peer_short(&from), error = %e, "rejected frame");
                error_response(&NetError::from(e))
            }
        };

        match Envelope::seal(&self.inner.keypair, &response) {
            Ok(sealed) => {
                // the requester may have timed out already
                let _ = reply.send(sealed);
            }
            Err(e) => warn!(node = %self.inner.name, error = %e, "failed to seal reply"),
        }
    }

    async fn dispatch(&self, from: PeerId, request: Request) -> Result<Response, NetError> {
        match request {
            Request::Hello { info, topics } => {
                if info.id != from {
                    return Err(MeshError::Unauthorized(format!(
                        "hello for {} sent by {}",
                        info.short(),
                        peer_short(&from)
                    ))
                    .into());
                }
                {
                    let mut state = self.inner.state.write().await;
                    state.connect(info.clone());
                    state.set_remote_topics(&from, topics.iter().cloned());
                }
                info!(node = %self.inner.name, peer = %info.short(), "peer connected");
                self.spawn_announce_matching(from, topics);

                let own = self.current_topics().await?;
                Ok(Response::Topics(own.into_iter().collect()))
            }

            Request::Topics { add, remove } => {
                let added = self
                    .inner
                    .state
                    .write()
                    .await
                    .update_remote_topics(&from, &add, &remove);
                if !added.is_empty() {
                    self.spawn_announce_matching(from, added);
                }
                Ok(Response::Ack)
            }

            Request::Announce {
                doc_id,
                collection,
                heads,
            } => {
                self.inner.registry.get(&collection)?;
                self.integrate(from, doc_id, &collection, heads, Vec::new())
                    .await?;
                Ok(Response::Ack)
            }

            Request::PushLog {
                doc_id,
                collection,
                heads,
                commits,
            } => {
                self.inner.registry.get(&collection)?;
                self.integrate(from, doc_id, &collection, heads, commits)
                    .await?;
                Ok(Response::Ack)
            }

            Request::FetchCommit { cid } => {
                let commit = self.inner.store.get(&cid)?;
                if let Some(doc_id) = commit.doc_id() {
                    let collection = match &commit {
                        Commit::Composite(c) => Some(c.collection.clone()),
                        _ => self.inner.store.doc_collection(doc_id)?,
                    };
                    if let Some(collection) = collection {
                        self.check_forward(&from, &collection, doc_id)?;
                    }
                }
                Ok(Response::Commit(commit))
            }

            Request::FetchHeads { doc_id } => {
                if let Some(collection) = self.inner.store.doc_collection(&doc_id)? {
                    self.check_forward(&from, &collection, &doc_id)?;
                }
                Ok(Response::Heads(self.inner.store.heads(&doc_id)?))
            }

            Request::SyncDocuments {
                collection,
                doc_ids,
            } => {
                self.inner.registry.get(&collection)?;
                let mut found = Vec::new();
                for doc_id in doc_ids {
                    if self.inner.store.doc_collection(&doc_id)?.as_deref() != Some(collection.as_str()) {
                        continue;
                    }
                    if !self.inner.gate.may_forward(&from, &collection, &doc_id) {
                        continue;
                    }
                    let heads = self.inner.store.heads(&doc_id)?;
                    if !heads.is_empty() {
                        found.push(DocHeads {
                            doc_id,
                            collection: collection.clone(),
                            heads,
                        });
                    }
                }
                Ok(Response::DocumentHeads(found))
            }

            Request::Backfill { topics } => {
                let docs = self.matching_heads(&from, &topics)?;
                debug!(
                    node = %self.inner.name,
                    peer = %peer_short(&from),
                    docs = docs.len(),
                    "serving backfill"
                );
                Ok(Response::DocumentHeads(docs))
            }

            Request::ReplicatorAdded { collections } => {
                let filter = collections.map(|names| names.into_iter().collect());
                let mut state = self.inner.state.write().await;
                state.add_inbound(&from, filter)?;
                self.persist_state(&state)?;
                info!(node = %self.inner.name, source = %peer_short(&from), "replicating from peer");
                Ok(Response::Ack)
            }

            Request::ReplicatorRemoved => {
                let mut state = self.inner.state.write().await;
                if state.remove_inbound(&from) {
                    self.persist_state(&state)?;
                    info!(node = %self.inner.name, source = %peer_short(&from), "peer stopped replicating");
                }
                Ok(Response::Ack)
            }

            Request::FetchKey { doc_id, key_id } => {
                if !self.inner.gate.may_share_key(&from, &doc_id) {
                    return Err(MeshError::Unauthorized(format!(
                        "key of {} withheld from {}",
                        doc_id_to_string(&doc_id),
                        peer_short(&from)
                    ))
                    .into());
                }
                let key = self.inner.keys.key_for(&doc_id, &key_id).ok_or_else(|| {
                    MeshError::NotFound(format!(
                        "key {} of {}",
                        id_to_hex(&key_id),
                        doc_id_to_string(&doc_id)
                    ))
                })?;
                Ok(Response::Key(key))
            }

            Request::Goodbye => {
                if self.inner.state.write().await.disconnect(&from) {
                    info!(node = %self.inner.name, peer = %peer_short(&from), "peer disconnected");
                }
                Ok(Response::Ack)
            }
        }
    }

    fn check_forward(&self, peer: &PeerId, collection: &str, doc_id: &DocId) -> Result<(), NetError> {
        if self.inner.gate.may_forward(peer, collection, doc_id) {
            Ok(())
        } else {
            Err(MeshError::Unauthorized(format!(
                "{} may not receive {}",
                peer_short(peer),
                doc_id_to_string(doc_id)
            ))
            .into())
        }
    }

    /// Heads of every held document matching one of `topics` that may be
    /// forwarded to `peer`
    pub(super) fn matching_heads(&self, peer: &PeerId, topics: &[Topic]) -> Result<Vec<DocHeads>, NetError> {
        let mut out = Vec::new();
        for (doc_id, collection) in self.inner.store.all_documents()? {
            if !topics.iter().any(|t| t.matches(&doc_id, &collection)) {
                continue;
            }
            if !self.inner.gate.may_forward(peer, &collection, &doc_id) {
                continue;
            }
            let heads = self.inner.store.heads(&doc_id)?;
            if !heads.is_empty() {
                out.push(DocHeads {
                    doc_id,
                    collection,
                    heads,
                });
            }
        }
        Ok(out)
    }

    /// Log a commit that stays buffered
    pub(super) fn note_pending(&self, commit: &Commit) {
        let held = lock_or_recover(&self.inner.pending).len();
        debug!(
            node = %self.inner.name,
            cid = %id_to_hex(&commit.cid()),
            kind = commit.kind_name(),
            held,
            "commit waiting for parents"
        );
    }
}

fn error_response(e: &NetError) -> Response {
    Response::Error {
        code: e.error_code().to_string(),
        message: e.to_string(),
    }
}
