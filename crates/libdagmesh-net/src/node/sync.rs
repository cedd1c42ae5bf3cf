//! Sync protocol: announce, push, pull, backfill and replicator retry

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use libdagmesh_core::types::ids::{doc_id_to_string, id_to_hex, short_hex};
use libdagmesh_core::{
    Cid, Commit, DocId, Event, KeyId, KeyStore, MeshError, MergeEvent, PeerId, Topic,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{lock_or_recover, unexpected, Node, RetryEntry};
use crate::error::NetError;
use crate::identity::peer_short;
use crate::message::{DocHeads, Request, Response};
use crate::retry::retry_on_conflict;

/// Per-document outcome of an explicit pull
#[derive(Debug, Default)]
pub struct SyncReport {
    pub accepted: Vec<DocId>,
    pub errors: Vec<(DocId, NetError)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Loggable summary of a report
#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub accepted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl From<&SyncReport> for SyncSummary {
    fn from(report: &SyncReport) -> Self {
        Self {
            accepted: report.accepted.iter().map(doc_id_to_string).collect(),
            failed: report
                .errors
                .iter()
                .map(|(doc, e)| (doc_id_to_string(doc), e.error_code().to_string()))
                .collect(),
        }
    }
}

impl Node {
    /// Bring the document up to `heads` announced by `from`, pulling every
    /// missing commit from `bundle` or from the sender. Returns the commits
    /// that were new to this node.
    pub(super) async fn integrate(
        &self,
        from: PeerId,
        doc_id: DocId,
        collection: &str,
        heads: Vec<Cid>,
        bundle: Vec<Commit>,
    ) -> Result<Vec<Cid>, NetError> {
        {
            let mut state = self.inner.state.write().await;
            if state.mark_shared(&from, &doc_id, collection) {
                self.persist_state(&state)?;
            }
        }

        let lock = self.doc_lock(&doc_id);
        let _guard = lock.lock().await;

        let held_before = self.inner.store.doc_collection(&doc_id)?.is_some();
        let missing = self.collect_missing(&from, &heads, bundle).await?;
        let inserted = if missing.is_empty() {
            Vec::new()
        } else {
            self.ingest_causal(missing)?
        };

        let local = self.inner.store.heads(&doc_id)?;
        let mut relay_targets = BTreeSet::new();

        if !inserted.is_empty() {
            if !held_before && self.inner.store.doc_collection(&doc_id)?.is_some() {
                self.refresh_topics().await?;
            }

            let decrypted = self.is_decryptable(&doc_id);
            let new_heads: Vec<Cid> = local
                .iter()
                .filter(|cid| inserted.contains(cid))
                .copied()
                .collect();
            for cid in &new_heads {
                self.publish(Event::Merge(MergeEvent {
                    doc_id,
                    collection: collection.to_string(),
                    cid: *cid,
                    heads: local.clone(),
                    decrypted,
                    from: Some(from),
                }));
            }
            info!(
                node = %self.inner.name,
                doc = %doc_id_to_string(&doc_id),
                peer = %peer_short(&from),
                commits = inserted.len(),
                heads = local.len(),
                decrypted,
                "merged remote changes"
            );

            if !decrypted {
                let missing = self.missing_keys(&doc_id);
                if !missing.is_empty() {
                    let node = self.clone();
                    let collection = collection.to_string();
                    tokio::spawn(async move {
                        node.fetch_keys(from, doc_id, collection, missing).await;
                    });
                }
            }

            relay_targets = self
                .inner
                .state
                .read()
                .await
                .push_targets(&doc_id, collection, Some(&from));
        }

        let announce_back = sorted(&local) != sorted(&heads)
            && self
                .inner
                .state
                .read()
                .await
                .push_targets(&doc_id, collection, None)
                .contains(&from);
        drop(_guard);

        if !relay_targets.is_empty() {
            let mut commits = Vec::with_capacity(inserted.len());
            for cid in &inserted {
                commits.push(self.inner.store.get(cid)?);
            }
            self.spawn_push(relay_targets, doc_id, collection, local.clone(), commits);
        }
        if announce_back {
            debug!(
                node = %self.inner.name,
                doc = %doc_id_to_string(&doc_id),
                peer = %peer_short(&from),
                heads = %describe_heads(&local),
                "announcing newer heads back"
            );
            let node = self.clone();
            let collection = collection.to_string();
            tokio::spawn(async move {
                node.announce_doc(from, doc_id, &collection).await;
            });
        }

        Ok(inserted)
    }

    /// Every commit reachable from `heads` and `bundle` that this node lacks,
    /// parents before children. Ancestors the sender cannot supply are
    /// skipped and their descendants end up in the pending buffer; a missing
    /// field commit fails the whole batch.
    async fn collect_missing(
        &self,
        from: &PeerId,
        heads: &[Cid],
        bundle: Vec<Commit>,
    ) -> Result<Vec<Commit>, NetError> {
        let mut bundle: HashMap<Cid, Commit> = bundle.into_iter().map(|c| (c.cid(), c)).collect();
        let mut stack: Vec<Cid> = heads.to_vec();
        stack.extend(bundle.keys().copied());

        let mut seen: HashSet<Cid> = HashSet::new();
        let mut linked: HashSet<Cid> = HashSet::new();
        let mut found: Vec<Commit> = Vec::new();
        while let Some(cid) = stack.pop() {
            if !seen.insert(cid) || self.inner.store.contains(&cid)? {
                continue;
            }
            let held = lock_or_recover(&self.inner.pending).get(&cid).cloned();
            let commit = match bundle.remove(&cid).or(held) {
                Some(commit) => commit,
                None => match self.fetch_commit(from, &cid).await {
                    Ok(commit) => commit,
                    Err(e) if linked.contains(&cid) => return Err(e),
                    Err(e) => {
                        debug!(
                            node = %self.inner.name,
                            cid = %id_to_hex(&cid),
                            peer = %peer_short(from),
                            error = %e,
                            "ancestor unavailable"
                        );
                        continue;
                    }
                },
            };
            stack.extend(commit.parents().iter().copied());
            // a collection commit links composites of other documents
            if !matches!(commit, Commit::Collection(_)) {
                let links = commit.links();
                linked.extend(links.iter().copied());
                stack.extend(links);
            }
            found.push(commit);
        }

        found.sort_by_key(|c| {
            let rank = match c {
                Commit::Field(_) => 0,
                Commit::Composite(_) => 1,
                Commit::Collection(_) => 2,
            };
            (rank, c.priority(), c.cid())
        });
        Ok(found)
    }

    async fn fetch_commit(&self, from: &PeerId, cid: &Cid) -> Result<Commit, NetError> {
        match self.request(from, Request::FetchCommit { cid: *cid }).await? {
            Response::Commit(commit) => {
                let actual = commit.cid();
                if &actual != cid {
                    return Err(NetError::UnexpectedResponse(format!(
                        "asked for commit {} and got {}",
                        id_to_hex(cid),
                        id_to_hex(&actual)
                    )));
                }
                Ok(commit)
            }
            other => Err(unexpected("fetch_commit", &other)),
        }
    }

    /// Store a causally ordered batch. Commits whose parents are still
    /// absent wait in the pending buffer and are stored when they arrive.
    fn ingest_causal(&self, commits: Vec<Commit>) -> Result<Vec<Cid>, NetError> {
        let store = &self.inner.store;
        match store.ingest(&commits) {
            Ok(outcome) => {
                let mut inserted = outcome.inserted;
                let released = lock_or_recover(&self.inner.pending).release(inserted.iter().copied());
                if !released.is_empty() {
                    inserted.extend(self.ingest_one_by_one(released)?);
                }
                Ok(inserted)
            }
            Err(MeshError::MissingParents { .. }) => self.ingest_one_by_one(commits),
            Err(e) => Err(e.into()),
        }
    }

    fn ingest_one_by_one(&self, commits: Vec<Commit>) -> Result<Vec<Cid>, NetError> {
        let store = &self.inner.store;
        let mut inserted = Vec::new();
        let mut queue: VecDeque<Commit> = commits.into();
        while let Some(commit) = queue.pop_front() {
            match store.ingest(std::slice::from_ref(&commit)) {
                Ok(outcome) => {
                    let released =
                        lock_or_recover(&self.inner.pending).release(outcome.inserted.iter().copied());
                    queue.extend(released);
                    inserted.extend(outcome.inserted);
                }
                Err(MeshError::MissingParents { .. }) => {
                    let mut absent = Vec::new();
                    for parent in commit.parents() {
                        if !store.contains(parent)? {
                            absent.push(*parent);
                        }
                    }
                    self.note_pending(&commit);
                    lock_or_recover(&self.inner.pending).hold(commit, absent);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(inserted)
    }

    /// Ask `from` for every key the document's sealed payloads name and this
    /// node lacks, then re-announce the heads as decrypted
    async fn fetch_keys(
        &self,
        from: PeerId,
        doc_id: DocId,
        collection: String,
        missing: BTreeSet<KeyId>,
    ) {
        let mut received = 0usize;
        for key_id in missing {
            let request = Request::FetchKey { doc_id, key_id };
            match self.request(&from, request).await {
                Ok(Response::Key(key)) if key.id() == key_id => {
                    self.inner.keys.insert(doc_id, key);
                    received += 1;
                }
                Ok(Response::Key(_)) => {
                    warn!(
                        node = %self.inner.name,
                        peer = %peer_short(&from),
                        key = %id_to_hex(&key_id),
                        "peer answered with a different key"
                    );
                }
                Ok(other) => {
                    warn!(node = %self.inner.name, error = %unexpected("fetch_key", &other), "key fetch failed");
                }
                Err(e) => {
                    info!(
                        node = %self.inner.name,
                        doc = %doc_id_to_string(&doc_id),
                        peer = %peer_short(&from),
                        key = %id_to_hex(&key_id),
                        error = %e,
                        "document key not granted"
                    );
                }
            }
        }
        if received == 0 {
            return;
        }

        if let Err(e) = self.persist_keys() {
            warn!(node = %self.inner.name, error = %e, "failed to persist document key");
        }

        let lock = self.doc_lock(&doc_id);
        let _guard = lock.lock().await;
        let heads = match self.inner.store.heads(&doc_id) {
            Ok(heads) => heads,
            Err(e) => {
                warn!(node = %self.inner.name, error = %e, "failed to read heads");
                return;
            }
        };
        let decrypted = self.is_decryptable(&doc_id);
        for cid in &heads {
            self.publish(Event::Merge(MergeEvent {
                doc_id,
                collection: collection.clone(),
                cid: *cid,
                heads: heads.clone(),
                decrypted,
                from: None,
            }));
        }
        info!(
            node = %self.inner.name,
            doc = %doc_id_to_string(&doc_id),
            keys = received,
            decrypted,
            "document keys received"
        );
    }

    /// Send new heads with their commits to each target in its own task
    pub(super) fn spawn_push(
        &self,
        targets: BTreeSet<PeerId>,
        doc_id: DocId,
        collection: &str,
        heads: Vec<Cid>,
        commits: Vec<Commit>,
    ) {
        for target in targets {
            if !self.inner.gate.may_forward(&target, collection, &doc_id) {
                debug!(node = %self.inner.name, peer = %peer_short(&target), doc = %doc_id_to_string(&doc_id), "push withheld by gate");
                continue;
            }
            let node = self.clone();
            let collection = collection.to_string();
            let request = Request::PushLog {
                doc_id,
                collection: collection.clone(),
                heads: heads.clone(),
                commits: commits.clone(),
            };
            tokio::spawn(async move {
                if node.inner.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = node.request(&target, request).await {
                    node.push_failed(target, doc_id, collection, e).await;
                }
            });
        }
    }

    async fn push_failed(&self, target: PeerId, doc_id: DocId, collection: String, error: NetError) {
        let is_replicator = self.inner.state.read().await.replicator(&target).is_some();
        warn!(
            node = %self.inner.name,
            peer = %peer_short(&target),
            doc = %doc_id_to_string(&doc_id),
            error = %error,
            queued = is_replicator,
            "push failed"
        );
        if is_replicator {
            lock_or_recover(&self.inner.retries)
                .entry((target, doc_id))
                .or_insert(RetryEntry {
                    collection,
                    attempts: 0,
                });
        }
    }

    /// Tell `peer` our heads of one document; it pulls what it lacks
    pub(super) async fn announce_doc(&self, peer: PeerId, doc_id: DocId, collection: &str) -> bool {
        if !self.inner.gate.may_forward(&peer, collection, &doc_id) {
            return false;
        }
        let heads = match self.inner.store.heads(&doc_id) {
            Ok(heads) if !heads.is_empty() => heads,
            Ok(_) => return false,
            Err(e) => {
                warn!(node = %self.inner.name, error = %e, "failed to read heads");
                return false;
            }
        };
        let request = Request::Announce {
            doc_id,
            collection: collection.to_string(),
            heads,
        };
        match self.request(&peer, request).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    node = %self.inner.name,
                    peer = %peer_short(&peer),
                    doc = %doc_id_to_string(&doc_id),
                    error = %e,
                    "announce failed"
                );
                false
            }
        }
    }

    /// Announce every held document matching `topics` to `peer`
    pub(super) fn spawn_announce_matching(&self, peer: PeerId, topics: Vec<Topic>) {
        if topics.is_empty() {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            let docs = match node.inner.store.all_documents() {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(node = %node.inner.name, error = %e, "failed to list documents");
                    return;
                }
            };
            for (doc_id, collection) in docs {
                if node.inner.cancel.is_cancelled() {
                    return;
                }
                if topics.iter().any(|t| t.matches(&doc_id, &collection)) {
                    node.announce_doc(peer, doc_id, &collection).await;
                }
            }
        });
    }

    /// Announce every document the new edge admits, then report completion
    pub(super) async fn initial_replication(&self, target: PeerId) {
        let edge = match self.inner.state.read().await.replicator(&target).cloned() {
            Some(edge) => edge,
            None => return,
        };
        let docs = match self.inner.store.all_documents() {
            Ok(docs) => docs,
            Err(e) => {
                warn!(node = %self.inner.name, error = %e, "failed to list documents");
                return;
            }
        };

        let mut pushed = 0usize;
        for (doc_id, collection) in docs {
            if self.inner.cancel.is_cancelled() {
                return;
            }
            if !edge.admits(&collection) {
                continue;
            }
            if self.announce_doc(target, doc_id, &collection).await {
                pushed += 1;
            } else if self.inner.gate.may_forward(&target, &collection, &doc_id) {
                lock_or_recover(&self.inner.retries)
                    .entry((target, doc_id))
                    .or_insert(RetryEntry {
                        collection,
                        attempts: 0,
                    });
            }
        }
        info!(node = %self.inner.name, target = %peer_short(&target), docs = pushed, "initial replication done");
        self.publish(Event::ReplicatorCompleted { peer: target });
    }

    /// Ask every connected peer for the documents matching new topics
    pub(super) async fn spawn_backfill(&self, topics: Vec<Topic>) {
        if topics.is_empty() {
            return;
        }
        let peers: Vec<PeerId> = self.inner.state.read().await.connections.keys().copied().collect();
        for peer in peers {
            let node = self.clone();
            let topics = topics.clone();
            tokio::spawn(async move {
                node.backfill_from(peer, topics).await;
            });
        }
    }

    async fn backfill_from(&self, peer: PeerId, topics: Vec<Topic>) {
        let request = Request::Backfill {
            topics: topics.clone(),
        };
        let docs = match self.request(&peer, request).await {
            Ok(Response::DocumentHeads(docs)) => docs,
            Ok(other) => {
                warn!(node = %self.inner.name, error = %unexpected("backfill", &other), "backfill failed");
                return;
            }
            Err(e) => {
                warn!(node = %self.inner.name, peer = %peer_short(&peer), error = %e, "backfill failed");
                return;
            }
        };

        for DocHeads {
            doc_id,
            collection,
            heads,
        } in docs
        {
            if let Err(e) = self.integrate(peer, doc_id, &collection, heads, Vec::new()).await {
                warn!(
                    node = %self.inner.name,
                    peer = %peer_short(&peer),
                    doc = %doc_id_to_string(&doc_id),
                    error = %e,
                    "backfill merge failed"
                );
            }
        }
        for topic in topics {
            debug!(node = %self.inner.name, peer = %peer_short(&peer), topic = %topic, "subscription backfilled");
            self.publish(Event::SubscriptionCompleted { topic, peer });
        }
    }

    /// Pull the listed documents from every connected peer
    pub async fn sync_documents(&self, collection: &str, doc_ids: &[DocId]) -> Result<SyncReport, NetError> {
        self.ensure_running()?;
        self.inner.registry.get(collection)?;

        let peers: Vec<PeerId> = self.inner.state.read().await.connections.keys().copied().collect();
        let mut offers: HashMap<DocId, Vec<(PeerId, Vec<Cid>)>> = HashMap::new();
        for peer in peers {
            let request = Request::SyncDocuments {
                collection: collection.to_string(),
                doc_ids: doc_ids.to_vec(),
            };
            match self.request(&peer, request).await {
                Ok(Response::DocumentHeads(docs)) => {
                    for doc in docs {
                        offers.entry(doc.doc_id).or_default().push((peer, doc.heads));
                    }
                }
                Ok(other) => warn!(node = %self.inner.name, error = %unexpected("sync_documents", &other), "sync request failed"),
                Err(e) => warn!(node = %self.inner.name, peer = %peer_short(&peer), error = %e, "sync request failed"),
            }
        }

        let mut report = SyncReport::default();
        for doc_id in doc_ids {
            let Some(sources) = offers.remove(doc_id) else {
                report.errors.push((
                    *doc_id,
                    MeshError::NotFound(format!(
                        "no connected peer has {}",
                        doc_id_to_string(doc_id)
                    ))
                    .into(),
                ));
                continue;
            };

            let mut last_error = None;
            let mut accepted = false;
            for (peer, heads) in sources {
                let result = retry_on_conflict(
                    self.inner.config.max_txn_retries,
                    self.inner.config.retry_backoff(),
                    |_| self.integrate(peer, *doc_id, collection, heads.clone(), Vec::new()),
                )
                .await;
                match result {
                    Ok(_) => accepted = true,
                    Err(e) => last_error = Some(e),
                }
            }
            match (accepted, last_error) {
                (true, _) => report.accepted.push(*doc_id),
                (false, Some(e)) => report.errors.push((*doc_id, e)),
                (false, None) => report.accepted.push(*doc_id),
            }
        }

        let summary = SyncSummary::from(&report);
        info!(
            node = %self.inner.name,
            collection,
            accepted = summary.accepted.len(),
            failed = summary.failed.len(),
            "sync finished"
        );
        Ok(report)
    }

    /// Background task retrying failed replicator pushes
    pub(super) async fn retry_loop(self) {
        let interval = self.inner.config.replicator_retry_interval();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.retry_pending_pushes().await,
            }
        }
    }

    async fn retry_pending_pushes(&self) {
        let queued: Vec<((PeerId, DocId), String)> = lock_or_recover(&self.inner.retries)
            .iter()
            .map(|(key, entry)| (*key, entry.collection.clone()))
            .collect();
        if queued.is_empty() {
            return;
        }

        for ((target, doc_id), collection) in queued {
            if self.inner.state.read().await.replicator(&target).is_none() {
                lock_or_recover(&self.inner.retries).remove(&(target, doc_id));
                continue;
            }
            let delivered = match self.request(&target, Request::FetchHeads { doc_id }).await {
                Ok(Response::Heads(remote)) => {
                    let local = self.inner.store.heads(&doc_id).unwrap_or_default();
                    sorted(&remote) == sorted(&local)
                        || self.announce_doc(target, doc_id, &collection).await
                }
                _ => false,
            };

            let mut retries = lock_or_recover(&self.inner.retries);
            if delivered {
                retries.remove(&(target, doc_id));
                debug!(node = %self.inner.name, peer = %peer_short(&target), doc = %doc_id_to_string(&doc_id), "queued push delivered");
                continue;
            }
            let give_up = match retries.get_mut(&(target, doc_id)) {
                Some(entry) => {
                    entry.attempts += 1;
                    entry.attempts >= self.inner.config.replicator_retry_attempts
                }
                None => false,
            };
            if give_up {
                retries.remove(&(target, doc_id));
                warn!(
                    node = %self.inner.name,
                    peer = %peer_short(&target),
                    doc = %doc_id_to_string(&doc_id),
                    "giving up on replicator push"
                );
            }
        }
    }
}

fn sorted(cids: &[Cid]) -> Vec<Cid> {
    let mut out = cids.to_vec();
    out.sort();
    out.dedup();
    out
}

fn describe_heads(heads: &[Cid]) -> String {
    heads.iter().map(short_hex).collect::<Vec<_>>().join(",")
}
