use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{doc_id_to_string, DocId};

/// Unit of interest a node advertises to its peers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Collection(String),
    Document(DocId),
}

impl Topic {
    /// Whether a document in `collection` falls under this topic
    pub fn matches(&self, doc_id: &DocId, collection: &str) -> bool {
        match self {
            Topic::Collection(name) => name == collection,
            Topic::Document(id) => id == doc_id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Collection(name) => write!(f, "collection:{}", name),
            Topic::Document(id) => write!(f, "document:{}", doc_id_to_string(id)),
        }
    }
}
