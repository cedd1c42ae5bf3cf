use serde::{Deserialize, Serialize};

use super::ids::{Cid, DocId, KeyId};
use crate::error::MeshError;

/// CRDT type tag carried by every field commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtKind {
    LwwRegister,
    /// Grow-only counter; negative deltas are rejected
    PCounter,
    /// Counter accepting increments and decrements
    PnCounter,
}

impl CrdtKind {
    pub fn tag(&self) -> u8 {
        match self {
            CrdtKind::LwwRegister => 1,
            CrdtKind::PCounter => 2,
            CrdtKind::PnCounter => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrdtKind::LwwRegister => "lww_register",
            CrdtKind::PCounter => "p_counter",
            CrdtKind::PnCounter => "pn_counter",
        }
    }

    pub fn is_counter(&self) -> bool {
        matches!(self, CrdtKind::PCounter | CrdtKind::PnCounter)
    }
}

/// A scalar field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Convert from a JSON scalar. Arrays and objects are not field values.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, MeshError> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(MeshError::InvalidArgs(format!("number out of range: {}", n)))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            other => Err(MeshError::InvalidArgs(format!(
                "unsupported field value: {}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn is_negative(&self) -> bool {
        match self {
            Value::Int(i) => *i < 0,
            Value::Float(f) => *f < 0.0,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// A single field change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDelta {
    Lww { value: Value },
    /// `nonce` is 0 for the create delta and random afterwards
    Counter { value: Value, nonce: u64 },
}

/// Field delta as stored: either readable or sealed under a document key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPayload {
    Plain(FieldDelta),
    /// AES-256-GCM: 12-byte nonce followed by ciphertext. A document can
    /// have branches sealed by different writers, so each payload names
    /// the key it was sealed with.
    Sealed { key_id: KeyId, data: Vec<u8> },
}

impl FieldPayload {
    pub fn is_sealed(&self) -> bool {
        matches!(self, FieldPayload::Sealed { .. })
    }

    /// Key needed to open this payload, if any
    pub fn key_id(&self) -> Option<&KeyId> {
        match self {
            FieldPayload::Plain(_) => None,
            FieldPayload::Sealed { key_id, .. } => Some(key_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCommit {
    pub doc_id: DocId,
    pub field: String,
    pub crdt: CrdtKind,
    pub priority: u64,
    pub payload: FieldPayload,
}

/// Named link from a composite to one of its field commits
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldLink {
    pub name: String,
    pub cid: Cid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Active,
    Deleted,
}

impl DocStatus {
    pub fn tag(&self) -> u8 {
        match self {
            DocStatus::Active => 1,
            DocStatus::Deleted => 2,
        }
    }
}

/// One version of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeCommit {
    pub doc_id: DocId,
    pub collection: String,
    pub priority: u64,
    pub parents: Vec<Cid>,
    pub links: Vec<FieldLink>,
    pub status: DocStatus,
}

impl CompositeCommit {
    /// Build a composite with parents and links in canonical order
    pub fn new(
        doc_id: DocId,
        collection: impl Into<String>,
        priority: u64,
        mut parents: Vec<Cid>,
        mut links: Vec<FieldLink>,
        status: DocStatus,
    ) -> Self {
        parents.sort();
        parents.dedup();
        links.sort();
        Self {
            doc_id,
            collection: collection.into(),
            priority,
            parents,
            links,
            status,
        }
    }
}

/// One version of a branchable collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCommit {
    pub collection: String,
    pub priority: u64,
    pub parents: Vec<Cid>,
    /// Composite commits recorded by this version
    pub links: Vec<Cid>,
}

impl CollectionCommit {
    pub fn new(
        collection: impl Into<String>,
        priority: u64,
        mut parents: Vec<Cid>,
        mut links: Vec<Cid>,
    ) -> Self {
        parents.sort();
        parents.dedup();
        links.sort();
        links.dedup();
        Self {
            collection: collection.into(),
            priority,
            parents,
            links,
        }
    }
}

/// Immutable DAG node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Commit {
    Field(FieldCommit),
    Composite(CompositeCommit),
    Collection(CollectionCommit),
}

impl Commit {
    /// Content identifier of this commit
    pub fn cid(&self) -> Cid {
        crate::hash::compute_cid(self)
    }

    /// Parent commits that must exist before this one is stored
    pub fn parents(&self) -> &[Cid] {
        match self {
            Commit::Field(_) => &[],
            Commit::Composite(c) => &c.parents,
            Commit::Collection(c) => &c.parents,
        }
    }

    /// Non-parent links (field commits of a composite, composites of a collection commit)
    pub fn links(&self) -> Vec<Cid> {
        match self {
            Commit::Field(_) => Vec::new(),
            Commit::Composite(c) => c.links.iter().map(|l| l.cid).collect(),
            Commit::Collection(c) => c.links.clone(),
        }
    }

    pub fn doc_id(&self) -> Option<&DocId> {
        match self {
            Commit::Field(f) => Some(&f.doc_id),
            Commit::Composite(c) => Some(&c.doc_id),
            Commit::Collection(_) => None,
        }
    }

    pub fn priority(&self) -> u64 {
        match self {
            Commit::Field(f) => f.priority,
            Commit::Composite(c) => c.priority,
            Commit::Collection(c) => c.priority,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Commit::Field(_) => "field",
            Commit::Composite(_) => "composite",
            Commit::Collection(_) => "collection",
        }
    }

    pub fn as_composite(&self) -> Option<&CompositeCommit> {
        match self {
            Commit::Composite(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_field(&self) -> Option<&FieldCommit> {
        match self {
            Commit::Field(f) => Some(f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_new_sorts_parents_and_links() {
        let c = CompositeCommit::new(
            [1u8; 16],
            "Users",
            3,
            vec![[9u8; 32], [2u8; 32], [9u8; 32]],
            vec![
                FieldLink { name: "name".into(), cid: [5u8; 32] },
                FieldLink { name: "age".into(), cid: [6u8; 32] },
            ],
            DocStatus::Active,
        );
        assert_eq!(c.parents, vec![[2u8; 32], [9u8; 32]]);
        assert_eq!(c.links[0].name, "age");
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from_json(&serde_json::json!(10)).unwrap(), Value::Int(10));
        assert_eq!(Value::from_json(&serde_json::json!(1.5)).unwrap(), Value::Float(1.5));
        assert_eq!(
            Value::from_json(&serde_json::json!("John")).unwrap(),
            Value::Text("John".into())
        );
        assert!(Value::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_value_negative() {
        assert!(Value::Int(-1).is_negative());
        assert!(!Value::Int(0).is_negative());
        assert!(Value::Float(-0.5).is_negative());
        assert!(!Value::Text("-1".into()).is_negative());
    }
}
