use std::collections::BTreeMap;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ciborium::Value as Cbor;

use crate::types::commit::{Commit, FieldDelta, FieldPayload, Value};
use crate::types::ids::Cid;

/// Schema version for commit hashing
pub const SCHEMA_VERSION: u8 = 1;

const TAG_FIELD: u8 = 1;
const TAG_COMPOSITE: u8 = 2;
const TAG_COLLECTION: u8 = 3;

/// Compute the content identifier of a commit using canonical CBOR + BLAKE2b-256
pub fn compute_cid(commit: &Commit) -> Cid {
    let preimage = build_canonical_cbor(commit);
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(&preimage);
    hasher.finalize().into()
}

/// Build the canonical CBOR preimage for hashing
///
/// Field:      [schema, 1, doc_id, field, crdt_tag, priority, payload]
/// Composite:  [schema, 2, doc_id, collection, priority, [parents], [[name, cid]], status]
/// Collection: [schema, 3, collection, priority, [parents], [links]]
///
/// Parents and links are sorted here regardless of the order they arrived in.
pub fn build_canonical_cbor(commit: &Commit) -> Vec<u8> {
    let array = match commit {
        Commit::Field(f) => Cbor::Array(vec![
            Cbor::Integer(SCHEMA_VERSION.into()),
            Cbor::Integer(TAG_FIELD.into()),
            Cbor::Bytes(f.doc_id.to_vec()),
            Cbor::Text(f.field.clone()),
            Cbor::Integer(f.crdt.tag().into()),
            Cbor::Integer(f.priority.into()),
            payload_to_cbor(&f.payload),
        ]),
        Commit::Composite(c) => {
            let mut links: Vec<(&str, &Cid)> =
                c.links.iter().map(|l| (l.name.as_str(), &l.cid)).collect();
            links.sort();
            Cbor::Array(vec![
                Cbor::Integer(SCHEMA_VERSION.into()),
                Cbor::Integer(TAG_COMPOSITE.into()),
                Cbor::Bytes(c.doc_id.to_vec()),
                Cbor::Text(c.collection.clone()),
                Cbor::Integer(c.priority.into()),
                sorted_cids(&c.parents),
                Cbor::Array(
                    links
                        .into_iter()
                        .map(|(name, cid)| {
                            Cbor::Array(vec![Cbor::Text(name.to_string()), Cbor::Bytes(cid.to_vec())])
                        })
                        .collect(),
                ),
                Cbor::Integer(c.status.tag().into()),
            ])
        }
        Commit::Collection(c) => Cbor::Array(vec![
            Cbor::Integer(SCHEMA_VERSION.into()),
            Cbor::Integer(TAG_COLLECTION.into()),
            Cbor::Text(c.collection.clone()),
            Cbor::Integer(c.priority.into()),
            sorted_cids(&c.parents),
            sorted_cids(&c.links),
        ]),
    };

    let mut buf = Vec::new();
    ciborium::into_writer(&array, &mut buf).expect("CBOR serialization should not fail");
    buf
}

/// Canonical encoding of a document's initial fields, used to derive its id
pub fn canonical_fields(fields: &BTreeMap<String, Value>) -> Vec<u8> {
    let entries = fields
        .iter()
        .map(|(name, value)| Cbor::Array(vec![Cbor::Text(name.clone()), value_to_cbor(value)]))
        .collect();
    let mut buf = Vec::new();
    ciborium::into_writer(&Cbor::Array(entries), &mut buf)
        .expect("CBOR serialization should not fail");
    buf
}

fn sorted_cids(cids: &[Cid]) -> Cbor {
    let mut sorted: Vec<&Cid> = cids.iter().collect();
    sorted.sort();
    sorted.dedup();
    Cbor::Array(sorted.into_iter().map(|c| Cbor::Bytes(c.to_vec())).collect())
}

fn payload_to_cbor(payload: &FieldPayload) -> Cbor {
    match payload {
        FieldPayload::Plain(delta) => Cbor::Array(vec![Cbor::Integer(0u8.into()), delta_to_cbor(delta)]),
        FieldPayload::Sealed { key_id, data } => Cbor::Array(vec![
            Cbor::Integer(1u8.into()),
            Cbor::Bytes(key_id.to_vec()),
            Cbor::Bytes(data.clone()),
        ]),
    }
}

fn delta_to_cbor(delta: &FieldDelta) -> Cbor {
    match delta {
        FieldDelta::Lww { value } => Cbor::Array(vec![Cbor::Integer(1u8.into()), value_to_cbor(value)]),
        FieldDelta::Counter { value, nonce } => Cbor::Array(vec![
            Cbor::Integer(2u8.into()),
            value_to_cbor(value),
            Cbor::Integer((*nonce).into()),
        ]),
    }
}

fn value_to_cbor(value: &Value) -> Cbor {
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Int(i) => Cbor::Integer((*i).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::Text(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
    }
}
