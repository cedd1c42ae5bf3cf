//! Document assembly from a head set
//!
//! The head set is read once; everything reachable from it is immutable, so
//! assembling concurrently with ingestion always yields the state at that
//! snapshot. A document with a missing commit is reported as `Incomplete`
//! and never returned half-built.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use tracing::debug;

use crate::crdt::FieldState;
use crate::error::MeshError;
use crate::gate::AccessGate;
use crate::keys::{open_payload, KeyStore};
use crate::store::CommitStore;
use crate::types::commit::{Commit, DocStatus, FieldCommit, FieldPayload};
use crate::types::document::Document;
use crate::types::ids::{doc_id_to_string, id_to_hex, Cid, DocId, KeyId};

pub struct Assembler<'a> {
    store: &'a CommitStore,
    keys: &'a dyn KeyStore,
    gate: &'a dyn AccessGate,
}

struct Walk {
    collection: String,
    deleted: bool,
    fields: Vec<(Cid, FieldCommit)>,
}

impl<'a> Assembler<'a> {
    pub fn new(store: &'a CommitStore, keys: &'a dyn KeyStore, gate: &'a dyn AccessGate) -> Self {
        Self { store, keys, gate }
    }

    /// Materialize the document at its current heads
    pub fn materialize(&self, doc_id: &DocId) -> Result<Document, MeshError> {
        let heads = self.store.heads(doc_id)?;
        self.materialize_at(doc_id, &heads)
    }

    /// Materialize the document at an explicit head set
    pub fn materialize_at(&self, doc_id: &DocId, heads: &[Cid]) -> Result<Document, MeshError> {
        let walk = self.walk(doc_id, heads)?;
        self.gate.check_read(&walk.collection, doc_id)?;

        let mut states: BTreeMap<String, FieldState> = BTreeMap::new();
        for (cid, field) in &walk.fields {
            let delta = open_payload(self.keys, doc_id, &field.payload).map_err(|e| match e {
                MeshError::Crypto(msg) => MeshError::Unauthorized(format!(
                    "cannot decrypt field '{}': {}",
                    field.field, msg
                )),
                other => other,
            })?;
            let state = states
                .entry(field.field.clone())
                .or_insert_with(|| FieldState::new(field.crdt));
            if state.kind() != field.crdt {
                return Err(MeshError::InvalidArgs(format!(
                    "field '{}' has commits of both {} and {}",
                    field.field,
                    state.kind().as_str(),
                    field.crdt.as_str()
                )));
            }
            *state = state.merge(cid, field.priority, &delta)?;
        }

        let mut heads = heads.to_vec();
        heads.sort();
        debug!(doc = %doc_id_to_string(doc_id), fields = states.len(), "document materialized");

        Ok(Document {
            doc_id: *doc_id,
            collection: walk.collection,
            fields: states.into_iter().map(|(k, s)| (k, s.value())).collect(),
            heads,
            deleted: walk.deleted,
        })
    }

    /// Whether every reachable payload can be opened with the keys at hand
    pub fn is_decryptable(&self, doc_id: &DocId) -> Result<bool, MeshError> {
        let heads = self.store.heads(doc_id)?;
        let walk = self.walk(doc_id, &heads)?;
        Ok(walk.fields.iter().all(|(_, field)| match &field.payload {
            FieldPayload::Plain(_) => true,
            FieldPayload::Sealed { .. } => open_payload(self.keys, doc_id, &field.payload).is_ok(),
        }))
    }

    /// Keys named by reachable sealed payloads that the key store lacks
    pub fn missing_keys(&self, doc_id: &DocId) -> Result<BTreeSet<KeyId>, MeshError> {
        let heads = self.store.heads(doc_id)?;
        let walk = self.walk(doc_id, &heads)?;
        Ok(walk
            .fields
            .iter()
            .filter_map(|(_, field)| field.payload.key_id())
            .filter(|key_id| self.keys.key_for(doc_id, key_id).is_none())
            .copied()
            .collect())
    }

    fn walk(&self, doc_id: &DocId, heads: &[Cid]) -> Result<Walk, MeshError> {
        if heads.is_empty() {
            return Err(MeshError::NotFound(format!(
                "document {}",
                doc_id_to_string(doc_id)
            )));
        }

        let mut collection = None;
        let mut deleted = false;
        let mut links: BTreeSet<Cid> = BTreeSet::new();
        let mut seen: HashSet<Cid> = HashSet::new();
        let mut queue: VecDeque<Cid> = heads.iter().copied().collect();

        while let Some(cid) = queue.pop_front() {
            if !seen.insert(cid) {
                continue;
            }
            let composite = match self.fetch(doc_id, &cid)? {
                Commit::Composite(c) if c.doc_id == *doc_id => c,
                other => {
                    return Err(MeshError::Internal(format!(
                        "{} commit {} is not a version of {}",
                        other.kind_name(),
                        id_to_hex(&cid),
                        doc_id_to_string(doc_id)
                    )))
                }
            };
            if composite.status == DocStatus::Deleted {
                deleted = true;
            }
            links.extend(composite.links.iter().map(|l| l.cid));
            queue.extend(composite.parents.iter().copied());
            collection.get_or_insert(composite.collection);
        }

        let mut fields = Vec::with_capacity(links.len());
        for cid in links {
            match self.fetch(doc_id, &cid)? {
                Commit::Field(f) => fields.push((cid, f)),
                other => {
                    return Err(MeshError::Internal(format!(
                        "link {} points at a {} commit",
                        id_to_hex(&cid),
                        other.kind_name()
                    )))
                }
            }
        }

        Ok(Walk {
            collection: collection.unwrap_or_default(),
            deleted,
            fields,
        })
    }

    fn fetch(&self, doc_id: &DocId, cid: &Cid) -> Result<Commit, MeshError> {
        self.store.get(cid).map_err(|e| match e {
            MeshError::NotFound(_) => MeshError::Incomplete {
                doc: doc_id_to_string(doc_id),
                missing: id_to_hex(cid),
            },
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{AllowAll, PolicyGate};
    use crate::keys::{seal_delta, Keyring};
    use crate::types::commit::{CompositeCommit, CrdtKind, FieldDelta, FieldLink, Value};

    const DOC: DocId = [3u8; 16];

    fn field(name: &str, crdt: CrdtKind, delta: FieldDelta, priority: u64) -> Commit {
        Commit::Field(FieldCommit {
            doc_id: DOC,
            field: name.to_string(),
            crdt,
            priority,
            payload: FieldPayload::Plain(delta),
        })
    }

    fn composite(parents: Vec<Cid>, fields: &[&Commit], priority: u64, status: DocStatus) -> Commit {
        let links = fields
            .iter()
            .map(|f| FieldLink {
                name: f.as_field().unwrap().field.clone(),
                cid: f.cid(),
            })
            .collect();
        Commit::Composite(CompositeCommit::new(DOC, "Users", priority, parents, links, status))
    }

    fn lww(value: &str, priority: u64) -> Commit {
        field("name", CrdtKind::LwwRegister, FieldDelta::Lww { value: Value::from(value) }, priority)
    }

    fn inc(value: i64, nonce: u64, priority: u64) -> Commit {
        field(
            "points",
            CrdtKind::PnCounter,
            FieldDelta::Counter { value: Value::Int(value), nonce },
            priority,
        )
    }

    #[test]
    fn test_unknown_document_not_found() {
        let store = CommitStore::open_temporary().unwrap();
        let keys = Keyring::generate();
        let err = Assembler::new(&store, &keys, &AllowAll).materialize(&DOC).unwrap_err();
        assert!(matches!(err, MeshError::NotFound(_)));
    }

    #[test]
    fn test_concurrent_branches_fold() {
        let store = CommitStore::open_temporary().unwrap();
        let keys = Keyring::generate();

        let n1 = lww("John", 1);
        let p1 = inc(10, 0, 1);
        let c1 = composite(vec![], &[&n1, &p1], 1, DocStatus::Active);
        store.ingest(&[n1, p1, c1.clone()]).unwrap();

        let pa = inc(10, 11, 2);
        let ca = composite(vec![c1.cid()], &[&pa], 2, DocStatus::Active);
        let pb = inc(10, 22, 2);
        let nb = lww("Fred", 2);
        let cb = composite(vec![c1.cid()], &[&pb, &nb], 2, DocStatus::Active);
        store.ingest(&[pa, ca, pb, nb, cb]).unwrap();

        let doc = Assembler::new(&store, &keys, &AllowAll).materialize(&DOC).unwrap();
        assert_eq!(doc.heads.len(), 2);
        assert_eq!(doc.get("points"), Some(&Value::Int(30)));
        assert_eq!(doc.get("name"), Some(&Value::from("Fred")));
        assert!(!doc.deleted);
    }

    #[test]
    fn test_missing_field_is_incomplete() {
        let store = CommitStore::open_temporary().unwrap();
        let keys = Keyring::generate();
        let n1 = lww("John", 1);
        // composite stored without its field commit
        let c1 = composite(vec![], &[&n1], 1, DocStatus::Active);
        store.put(&c1).unwrap();

        let err = Assembler::new(&store, &keys, &AllowAll).materialize(&DOC).unwrap_err();
        assert!(matches!(err, MeshError::Incomplete { .. }));
    }

    #[test]
    fn test_tombstone_marks_deleted() {
        let store = CommitStore::open_temporary().unwrap();
        let keys = Keyring::generate();
        let n1 = lww("John", 1);
        let c1 = composite(vec![], &[&n1], 1, DocStatus::Active);
        let c2 = composite(vec![c1.cid()], &[], 2, DocStatus::Deleted);
        store.ingest(&[n1, c1, c2]).unwrap();

        let doc = Assembler::new(&store, &keys, &AllowAll).materialize(&DOC).unwrap();
        assert!(doc.deleted);
    }

    #[test]
    fn test_gate_denies_read() {
        let store = CommitStore::open_temporary().unwrap();
        let keys = Keyring::generate();
        let n1 = lww("John", 1);
        let c1 = composite(vec![], &[&n1], 1, DocStatus::Active);
        store.ingest(&[n1, c1]).unwrap();

        let gate = PolicyGate::new();
        gate.deny_read("Users");
        let err = Assembler::new(&store, &keys, &gate).materialize(&DOC).unwrap_err();
        assert!(matches!(err, MeshError::Unauthorized(_)));
    }

    #[test]
    fn test_sealed_payload_needs_key() {
        let store = CommitStore::open_temporary().unwrap();
        let owner = Keyring::generate();
        let key = owner.create_key(&DOC);
        let payload = seal_delta(&key, &FieldDelta::Lww { value: Value::from("hidden") }).unwrap();
        let sealed = Commit::Field(FieldCommit {
            doc_id: DOC,
            field: "name".into(),
            crdt: CrdtKind::LwwRegister,
            priority: 1,
            payload,
        });
        let c1 = composite(vec![], &[&sealed], 1, DocStatus::Active);
        store.ingest(&[sealed, c1]).unwrap();

        let stranger = Keyring::generate();
        let assembler = Assembler::new(&store, &stranger, &AllowAll);
        assert!(!assembler.is_decryptable(&DOC).unwrap());
        assert_eq!(
            assembler.missing_keys(&DOC).unwrap().into_iter().collect::<Vec<_>>(),
            vec![key.id()]
        );
        assert!(matches!(
            assembler.materialize(&DOC),
            Err(MeshError::Unauthorized(_))
        ));

        let doc = Assembler::new(&store, &owner, &AllowAll).materialize(&DOC).unwrap();
        assert_eq!(doc.get("name"), Some(&Value::from("hidden")));
        assert!(Assembler::new(&store, &owner, &AllowAll).is_decryptable(&DOC).unwrap());
        assert!(Assembler::new(&store, &owner, &AllowAll).missing_keys(&DOC).unwrap().is_empty());
    }

    #[test]
    fn test_branches_sealed_by_different_writers() {
        let store = CommitStore::open_temporary().unwrap();
        let alice = Keyring::generate();
        let bob = Keyring::generate();

        let mut versions = Vec::new();
        for (ring, value, priority) in [(&alice, "from alice", 1), (&bob, "from bob", 2)] {
            let key = ring.create_key(&DOC);
            let payload = seal_delta(&key, &FieldDelta::Lww { value: Value::from(value) }).unwrap();
            let field = Commit::Field(FieldCommit {
                doc_id: DOC,
                field: "name".into(),
                crdt: CrdtKind::LwwRegister,
                priority,
                payload,
            });
            let version = composite(vec![], &[&field], priority, DocStatus::Active);
            versions.push(version.cid());
            store.ingest(&[field, version]).unwrap();
        }
        assert_eq!(store.heads(&DOC).unwrap().len(), 2);

        let assembler = Assembler::new(&store, &alice, &AllowAll);
        assert!(matches!(assembler.materialize(&DOC), Err(MeshError::Unauthorized(_))));
        let missing = assembler.missing_keys(&DOC).unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing.contains(&bob.create_key(&DOC).id()));

        alice.insert(DOC, bob.create_key(&DOC));
        let doc = Assembler::new(&store, &alice, &AllowAll).materialize(&DOC).unwrap();
        assert_eq!(doc.get("name"), Some(&Value::from("from bob")));
        assert_eq!(doc.heads.len(), versions.len());
    }
}
