//! Per-node typed event bus
//!
//! Built on a bounded `tokio::sync::broadcast` channel. Delivery is
//! at-least-once for subscribers that keep up; a subscriber that falls more
//! than `capacity` events behind loses the oldest entries and the skip count
//! is added to [`Subscription::lagged`]. Publishing never blocks.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::MeshError;
use crate::types::ids::{Cid, DocId, PeerId};
use crate::types::topic::Topic;

/// A local write produced a new head
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEvent {
    pub doc_id: DocId,
    pub collection: String,
    pub cid: Cid,
    /// Full head set after the write
    pub heads: Vec<Cid>,
    pub parents: Vec<Cid>,
}

/// A remote head was integrated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeEvent {
    pub doc_id: DocId,
    pub collection: String,
    pub cid: Cid,
    /// Full head set after the merge
    pub heads: Vec<Cid>,
    /// Whether every reachable payload could be opened
    pub decrypted: bool,
    /// Peer the commits came from; `None` when re-emitted locally
    pub from: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Update(UpdateEvent),
    Merge(MergeEvent),
    ReplicatorCompleted { peer: PeerId },
    SubscriptionCompleted { topic: Topic, peer: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Update,
    Merge,
    ReplicatorCompleted,
    SubscriptionCompleted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Update(_) => EventKind::Update,
            Event::Merge(_) => EventKind::Merge,
            Event::ReplicatorCompleted { .. } => EventKind::ReplicatorCompleted,
            Event::SubscriptionCompleted { .. } => EventKind::SubscriptionCompleted,
        }
    }

    pub fn doc_id(&self) -> Option<&DocId> {
        match self {
            Event::Update(e) => Some(&e.doc_id),
            Event::Merge(e) => Some(&e.doc_id),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            Event::Update(e) => Some(&e.collection),
            Event::Merge(e) => Some(&e.collection),
            _ => None,
        }
    }

    /// Head set carried by document events
    pub fn heads(&self) -> Option<&[Cid]> {
        match self {
            Event::Update(e) => Some(&e.heads),
            Event::Merge(e) => Some(&e.heads),
            _ => None,
        }
    }
}

/// Subscriber-side filter. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    pub document: Option<DocId>,
    pub collection: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn document(mut self, doc_id: DocId) -> Self {
        self.document = Some(doc_id);
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind()) {
            return false;
        }
        if let Some(doc) = &self.document {
            if event.doc_id() != Some(doc) {
                return false;
            }
        }
        if let Some(collection) = &self.collection {
            if event.collection() != Some(collection.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Cloneable publisher handle
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Returns the number reached.
    pub fn publish(&self, event: Event) -> usize {
        // no subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe from this point on. Earlier events are not replayed.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            filter,
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Filtered receiving end of the bus
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    filter: EventFilter,
    lagged: u64,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event, failing with `Timeout` after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Event, MeshError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(MeshError::Internal("event bus closed".to_string())),
            Err(_) => Err(MeshError::Timeout {
                what: format!("event after {}ms", timeout.as_millis()),
                diverging: Vec::new(),
            }),
        }
    }

    /// Next matching event, or `None` if `token` is cancelled first
    pub async fn recv_cancellable(&mut self, token: &CancellationToken) -> Option<Event> {
        tokio::select! {
            _ = token.cancelled() => None,
            event = self.recv() => event,
        }
    }

    /// Non-blocking poll
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total number of events skipped because this subscriber fell behind
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    fn record_lag(&mut self, skipped: u64) {
        self.lagged += skipped;
        warn!(skipped, total = self.lagged, "event subscriber lagged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(doc: u8, collection: &str) -> Event {
        Event::Update(UpdateEvent {
            doc_id: [doc; 16],
            collection: collection.to_string(),
            cid: [doc; 32],
            heads: vec![[doc; 32]],
            parents: vec![],
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(update(1, "Users")), 0);
    }

    #[tokio::test]
    async fn test_filter_by_document_and_kind() {
        let bus = EventBus::new(16);
        let mut by_doc = bus.subscribe(EventFilter::all().document([2; 16]));
        let mut merges = bus.subscribe(EventFilter::kinds([EventKind::Merge]));

        bus.publish(update(1, "Users"));
        bus.publish(update(2, "Users"));

        let ev = by_doc.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ev.doc_id(), Some(&[2; 16]));
        assert!(merges.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filter_by_collection() {
        let bus = EventBus::new(16);
        let mut books = bus.subscribe(EventFilter::all().collection("Books"));
        bus.publish(update(1, "Users"));
        bus.publish(update(2, "Books"));
        let ev = books.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ev.collection(), Some("Books"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_counts_skips() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(EventFilter::all());
        for i in 0..5 {
            bus.publish(update(i, "Users"));
        }
        let ev = sub.recv().await.unwrap();
        assert_eq!(sub.lagged(), 3);
        assert_eq!(ev.doc_id(), Some(&[3; 16]));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(EventFilter::all());
        let err = sub.recv_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, MeshError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_recv_cancellable() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(EventFilter::all());
        let token = CancellationToken::new();
        token.cancel();
        assert!(sub.recv_cancellable(&token).await.is_none());
    }
}
