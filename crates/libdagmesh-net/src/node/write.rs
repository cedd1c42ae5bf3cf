//! Local writes
//!
//! A write reads the document heads, builds its commits and stores them
//! with a compare-and-swap on those heads. A concurrent change to the heads
//! surfaces as `TransactionConflict` and the whole write is rebuilt.

use std::collections::BTreeMap;

use libdagmesh_core::hash::canonical_fields;
use libdagmesh_core::keys::seal_delta;
use libdagmesh_core::types::ids::{derive_doc_id, doc_id_to_string, generate_nonce, short_hex};
use libdagmesh_core::{
    Cid, CollectionCommit, CollectionDef, Commit, CompositeCommit, CrdtKind, DocId, DocKey,
    DocStatus, Event, FieldCommit, FieldDelta, FieldLink, FieldPayload, MeshError, UpdateEvent,
    Value,
};
use serde::Serialize;
use tracing::info;

use super::Node;
use crate::error::NetError;
use crate::retry::retry_on_conflict;

/// Result of a successful local write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
    pub doc_id: DocId,
    /// Composite commit produced by the write
    pub cid: Cid,
    pub heads: Vec<Cid>,
    pub parents: Vec<Cid>,
}

enum WriteKind<'a> {
    Create,
    Update(&'a DocId),
    Delete(&'a DocId),
}

impl Node {
    /// Create a document from JSON field values. The document id is derived
    /// from the collection and the fields, so identical creates on two
    /// nodes produce the same document.
    pub async fn create_document(
        &self,
        collection: &str,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> Result<WriteOutcome, NetError> {
        self.write(collection, WriteKind::Create, fields).await
    }

    /// Set LWW fields and add to counter fields
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &DocId,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> Result<WriteOutcome, NetError> {
        if fields.is_empty() {
            return Err(MeshError::InvalidArgs("update without fields".to_string()).into());
        }
        self.write(collection, WriteKind::Update(doc_id), fields)
            .await
    }

    pub async fn delete_document(&self, collection: &str, doc_id: &DocId) -> Result<WriteOutcome, NetError> {
        self.write(collection, WriteKind::Delete(doc_id), &BTreeMap::new())
            .await
    }

    async fn write(
        &self,
        collection: &str,
        kind: WriteKind<'_>,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> Result<WriteOutcome, NetError> {
        self.ensure_running()?;
        let def = self.inner.registry.get(collection)?;
        let values = parse_fields(def, fields)?;

        let kind = &kind;
        let values = &values;
        retry_on_conflict(
            self.inner.config.max_txn_retries,
            self.inner.config.retry_backoff(),
            |_| self.write_once(def, kind, values),
        )
        .await
    }

    async fn write_once(
        &self,
        def: &CollectionDef,
        kind: &WriteKind<'_>,
        values: &BTreeMap<String, (CrdtKind, Value)>,
    ) -> Result<WriteOutcome, NetError> {
        let collection = def.name.as_str();
        let (doc_id, heads, priority) = match kind {
            WriteKind::Create => {
                let plain: BTreeMap<String, Value> = values
                    .iter()
                    .map(|(name, (_, value))| (name.clone(), value.clone()))
                    .collect();
                let doc_id = derive_doc_id(collection, &canonical_fields(&plain));
                let heads = self.inner.store.heads(&doc_id)?;
                if !heads.is_empty() {
                    return Err(MeshError::AlreadyExists(format!(
                        "document {}",
                        doc_id_to_string(&doc_id)
                    ))
                    .into());
                }
                (doc_id, heads, 1)
            }
            WriteKind::Update(doc_id) | WriteKind::Delete(doc_id) => {
                let (heads, priority) = self.live_heads(collection, doc_id)?;
                (**doc_id, heads, priority + 1)
            }
        };

        let key = self.field_key(def, &doc_id, matches!(kind, WriteKind::Create))?;

        let mut commits = Vec::with_capacity(values.len() + 2);
        let mut links = Vec::with_capacity(values.len());
        for (name, (crdt, value)) in values {
            let delta = if crdt.is_counter() {
                let nonce = match kind {
                    WriteKind::Create => 0,
                    _ => generate_nonce(),
                };
                FieldDelta::Counter {
                    value: value.clone(),
                    nonce,
                }
            } else {
                FieldDelta::Lww {
                    value: value.clone(),
                }
            };
            let payload = match &key {
                Some(key) => seal_delta(key, &delta)?,
                None => FieldPayload::Plain(delta),
            };
            let field = Commit::Field(FieldCommit {
                doc_id,
                field: name.clone(),
                crdt: *crdt,
                priority,
                payload,
            });
            links.push(FieldLink {
                name: name.clone(),
                cid: field.cid(),
            });
            commits.push(field);
        }

        let status = match kind {
            WriteKind::Delete(_) => DocStatus::Deleted,
            _ => DocStatus::Active,
        };
        let composite = CompositeCommit::new(doc_id, collection, priority, heads.clone(), links, status);
        let parents = composite.parents.clone();
        let composite = Commit::Composite(composite);
        let cid = composite.cid();
        commits.push(composite);

        if def.branchable {
            commits.push(self.collection_commit(collection, cid)?);
        }

        let lock = self.doc_lock(&doc_id);
        let guard = lock.lock().await;

        self.inner.store.commit_local(&doc_id, &heads, &commits)?;
        if key.is_some() {
            self.persist_keys()?;
        }
        if matches!(kind, WriteKind::Create) {
            self.refresh_topics().await?;
        }

        let new_heads = self.inner.store.heads(&doc_id)?;
        self.publish(Event::Update(UpdateEvent {
            doc_id,
            collection: collection.to_string(),
            cid,
            heads: new_heads.clone(),
            parents: parents.clone(),
        }));
        let targets = self
            .inner
            .state
            .read()
            .await
            .push_targets(&doc_id, collection, None);
        drop(guard);

        info!(
            node = %self.inner.name,
            doc = %doc_id_to_string(&doc_id),
            cid = %short_hex(&cid),
            priority,
            targets = targets.len(),
            op = kind.name(),
            "local write"
        );
        self.spawn_push(targets, doc_id, collection, new_heads.clone(), commits);

        Ok(WriteOutcome {
            doc_id,
            cid,
            heads: new_heads,
            parents,
        })
    }

    /// Heads and maximum head priority of a live document
    fn live_heads(&self, collection: &str, doc_id: &DocId) -> Result<(Vec<Cid>, u64), NetError> {
        let not_found = || MeshError::NotFound(format!("document {}", doc_id_to_string(doc_id)));
        if self.inner.store.doc_collection(doc_id)?.as_deref() != Some(collection) {
            return Err(not_found().into());
        }
        let history = self.inner.store.history(doc_id)?;
        if history
            .iter()
            .any(|(_, version)| version.status == DocStatus::Deleted)
        {
            return Err(not_found().into());
        }

        let heads = self.inner.store.heads(doc_id)?;
        let priority = history
            .iter()
            .filter(|(cid, _)| heads.contains(cid))
            .map(|(_, version)| version.priority)
            .max()
            .unwrap_or(0);
        Ok((heads, priority))
    }

    /// Writes are sealed with this node's own key for the document. Updating
    /// a document requires having been granted at least one of its keys.
    fn field_key(&self, def: &CollectionDef, doc_id: &DocId, create: bool) -> Result<Option<DocKey>, NetError> {
        if !def.encrypted {
            return Ok(None);
        }
        if !create && !self.inner.keys.holds(doc_id) {
            return Err(MeshError::Unauthorized(format!(
                "no key to write {}",
                doc_id_to_string(doc_id)
            ))
            .into());
        }
        Ok(Some(self.inner.keys.create_key(doc_id)))
    }

    fn collection_commit(&self, collection: &str, composite: Cid) -> Result<Commit, NetError> {
        let parents = self.inner.store.collection_heads(collection)?;
        let mut priority = 0;
        for parent in &parents {
            priority = priority.max(self.inner.store.get(parent)?.priority());
        }
        Ok(Commit::Collection(CollectionCommit::new(
            collection,
            priority + 1,
            parents,
            vec![composite],
        )))
    }
}

impl WriteKind<'_> {
    fn name(&self) -> &'static str {
        match self {
            WriteKind::Create => "create",
            WriteKind::Update(_) => "update",
            WriteKind::Delete(_) => "delete",
        }
    }
}

/// Check JSON field values against the collection's field kinds
fn parse_fields(
    def: &CollectionDef,
    fields: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, (CrdtKind, Value)>, NetError> {
    let mut out = BTreeMap::new();
    for (name, json) in fields {
        let kind = def.fields.get(name).copied().ok_or_else(|| {
            MeshError::InvalidArgs(format!("collection '{}' has no field '{}'", def.name, name))
        })?;
        let value = Value::from_json(json)?;
        if kind.is_counter() {
            if !matches!(value, Value::Int(_) | Value::Float(_)) {
                return Err(MeshError::InvalidArgs(format!(
                    "counter field '{}' needs a number, got {}",
                    name,
                    value.type_name()
                ))
                .into());
            }
            if kind == CrdtKind::PCounter && value.is_negative() {
                return Err(MeshError::InvalidArgs(format!(
                    "p_counter field '{}' cannot decrease",
                    name
                ))
                .into());
            }
        }
        out.insert(name.clone(), (kind, value));
    }
    Ok(out)
}
