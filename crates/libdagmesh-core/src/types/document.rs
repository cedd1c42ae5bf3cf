use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::commit::Value;
use super::ids::{doc_id_to_string, id_to_hex, Cid, DocId};

/// Materialized view of a document at a head set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub collection: String,
    pub fields: BTreeMap<String, Value>,
    pub heads: Vec<Cid>,
    pub deleted: bool,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// JSON rendering used by the scenario runner
    pub fn to_json(&self) -> serde_json::Value {
        let fields: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::json!({
            "_docID": doc_id_to_string(&self.doc_id),
            "_collection": self.collection,
            "_heads": self.heads.iter().map(|h| id_to_hex(h)).collect::<Vec<_>>(),
            "_deleted": self.deleted,
            "fields": fields,
        })
    }
}
