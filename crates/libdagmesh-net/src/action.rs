//! Scenario actions
//!
//! Documents are addressed by their creation index within a collection:
//! `doc = 0` is the first document the scenario created there. Actions
//! with `node` absent apply to every node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Fields = BTreeMap<String, serde_json::Value>;

fn default_wait_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateDoc {
        #[serde(default)]
        node: Option<String>,
        collection: String,
        fields: Fields,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    UpdateDoc {
        #[serde(default)]
        node: Option<String>,
        collection: String,
        doc: usize,
        fields: Fields,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    DeleteDoc {
        #[serde(default)]
        node: Option<String>,
        collection: String,
        doc: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    Connect {
        from: String,
        to: String,
    },
    ConfigureReplicator {
        source: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collections: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    DeleteReplicator {
        source: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    SubscribeToCollection {
        node: String,
        collections: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    UnsubscribeFromCollection {
        node: String,
        collections: Vec<String>,
    },
    SubscribeToDocument {
        node: String,
        collection: String,
        docs: Vec<usize>,
    },
    UnsubscribeFromDocument {
        node: String,
        collection: String,
        docs: Vec<usize>,
    },
    SyncDocuments {
        node: String,
        collection: String,
        docs: Vec<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    WaitForSync {
        #[serde(default = "default_wait_ms")]
        timeout_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_error: Option<String>,
    },
    AssertDoc {
        #[serde(default)]
        node: Option<String>,
        collection: String,
        doc: usize,
        #[serde(default)]
        fields: Fields,
        #[serde(default)]
        deleted: bool,
    },
    AssertMissing {
        #[serde(default)]
        node: Option<String>,
        collection: String,
        doc: usize,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateDoc { .. } => "create_doc",
            Action::UpdateDoc { .. } => "update_doc",
            Action::DeleteDoc { .. } => "delete_doc",
            Action::Connect { .. } => "connect",
            Action::ConfigureReplicator { .. } => "configure_replicator",
            Action::DeleteReplicator { .. } => "delete_replicator",
            Action::SubscribeToCollection { .. } => "subscribe_to_collection",
            Action::UnsubscribeFromCollection { .. } => "unsubscribe_from_collection",
            Action::SubscribeToDocument { .. } => "subscribe_to_document",
            Action::UnsubscribeFromDocument { .. } => "unsubscribe_from_document",
            Action::SyncDocuments { .. } => "sync_documents",
            Action::WaitForSync { .. } => "wait_for_sync",
            Action::AssertDoc { .. } => "assert_doc",
            Action::AssertMissing { .. } => "assert_missing",
        }
    }

    /// Error code the action is expected to fail with
    pub fn expected_error(&self) -> Option<&str> {
        match self {
            Action::CreateDoc { expected_error, .. }
            | Action::UpdateDoc { expected_error, .. }
            | Action::DeleteDoc { expected_error, .. }
            | Action::ConfigureReplicator { expected_error, .. }
            | Action::DeleteReplicator { expected_error, .. }
            | Action::SubscribeToCollection { expected_error, .. }
            | Action::SyncDocuments { expected_error, .. }
            | Action::WaitForSync { expected_error, .. } => expected_error.as_deref(),
            _ => None,
        }
    }

    /// Whether the action changes some node's topology
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            Action::Connect { .. }
                | Action::ConfigureReplicator { .. }
                | Action::DeleteReplicator { .. }
                | Action::SubscribeToCollection { .. }
                | Action::UnsubscribeFromCollection { .. }
                | Action::SubscribeToDocument { .. }
                | Action::UnsubscribeFromDocument { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Script {
        actions: Vec<Action>,
    }

    #[test]
    fn test_actions_from_toml() {
        let script: Script = toml::from_str(
            r#"
[[actions]]
action = "create_doc"
collection = "Users"
fields = { name = "Ada", points = 10 }

[[actions]]
action = "connect"
from = "node0"
to = "node1"

[[actions]]
action = "configure_replicator"
source = "node0"
target = "node0"
expected_error = "invalid_args"

[[actions]]
action = "wait_for_sync"
"#,
        )
        .unwrap();

        assert_eq!(script.actions.len(), 4);
        match &script.actions[0] {
            Action::CreateDoc { node, fields, .. } => {
                assert!(node.is_none());
                assert_eq!(fields["points"], serde_json::json!(10));
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(script.actions[1].is_topology());
        assert_eq!(script.actions[2].expected_error(), Some("invalid_args"));
        assert!(matches!(
            script.actions[3],
            Action::WaitForSync { timeout_ms: 5000, .. }
        ));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let result: Result<Script, _> = toml::from_str(
            r#"
[[actions]]
action = "drop_table"
"#,
        );
        assert!(result.is_err());
    }
}
