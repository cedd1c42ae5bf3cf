//! Scenario files
//!
//! A scenario names its nodes, the collections they share, optional node
//! tuning and an ordered list of actions:
//!
//! ```toml
//! nodes = 2
//!
//! [[collections]]
//! name = "Users"
//! [collections.fields]
//! points = "p_counter"
//!
//! [[actions]]
//! action = "create_doc"
//! collection = "Users"
//! fields = { points = 10 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libdagmesh_core::{CollectionDef, CollectionRegistry, NodeConfig, PeerId, PolicyGate};
use libdagmesh_net::{Action, Cluster, ClusterBuilder};
use serde::Deserialize;

use crate::error::SimError;

/// Either a node count (`node0`, `node1`, ...) or explicit nodes
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeList {
    Count(usize),
    Named(Vec<NodeSpec>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Name(String),
    Detailed {
        name: String,
        /// Collections this node refuses to materialize
        #[serde(default)]
        deny_read: Vec<String>,
        /// Never hand out document keys
        #[serde(default)]
        withhold_keys: bool,
        /// Collections never sent to a given peer
        #[serde(default)]
        deny_forward: Vec<ForwardRule>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardRule {
    pub peer: String,
    pub collection: String,
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        match self {
            NodeSpec::Name(name) => name,
            NodeSpec::Detailed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: NodeList,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default)]
    pub collections: Vec<CollectionDef>,
    #[serde(default)]
    pub actions: Vec<Action>,

    #[serde(skip)]
    pub path: PathBuf,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path).map_err(|source| SimError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, SimError> {
        let mut scenario: Scenario = toml::from_str(content).map_err(|e| SimError::Scenario {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        scenario.path = path.to_path_buf();
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn node_specs(&self) -> Vec<NodeSpec> {
        match &self.nodes {
            NodeList::Count(count) => (0..*count)
                .map(|i| NodeSpec::Name(format!("node{}", i)))
                .collect(),
            NodeList::Named(nodes) => nodes.clone(),
        }
    }

    pub fn registry(&self) -> Result<CollectionRegistry, SimError> {
        Ok(CollectionRegistry::from_defs(self.collections.iter().cloned())?)
    }

    fn invalid(&self, message: impl Into<String>) -> SimError {
        SimError::Scenario {
            path: self.path.display().to_string(),
            message: message.into(),
        }
    }

    /// Reject scenarios that reference unknown nodes or have no nodes at all.
    /// Unknown collections are left to the actions, which may expect them to fail.
    pub fn validate(&self) -> Result<(), SimError> {
        let specs = self.node_specs();
        if specs.is_empty() {
            return Err(self.invalid("scenario has no nodes"));
        }
        let mut names = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name().to_string()) {
                return Err(self.invalid(format!("duplicate node '{}'", spec.name())));
            }
        }
        self.config.validate()?;
        self.registry()?;

        for spec in &specs {
            if let NodeSpec::Detailed { deny_forward, .. } = spec {
                for rule in deny_forward {
                    if !names.contains(&rule.peer) {
                        return Err(self.invalid(format!(
                            "node '{}' denies forwarding to unknown node '{}'",
                            spec.name(),
                            rule.peer
                        )));
                    }
                }
            }
        }

        for (index, action) in self.actions.iter().enumerate() {
            for node in referenced_nodes(action) {
                if !names.contains(node) {
                    return Err(self.invalid(format!(
                        "action #{} ({}) references unknown node '{}'",
                        index,
                        action.name(),
                        node
                    )));
                }
            }
        }
        Ok(())
    }

    /// Start the scenario's nodes; stores go under `data_dir` when given
    pub async fn build_cluster(&self, data_dir: Option<&Path>) -> Result<Cluster, SimError> {
        let mut config = self.config.clone();
        if let Some(dir) = data_dir {
            config.data_dir = Some(dir.to_path_buf());
        }

        let mut builder = ClusterBuilder::new(self.registry()?).config(config);
        let mut forward_rules = Vec::new();
        for spec in self.node_specs() {
            builder = match spec {
                NodeSpec::Name(name) => builder.node(name),
                NodeSpec::Detailed {
                    name,
                    deny_read,
                    withhold_keys,
                    deny_forward,
                } => {
                    let gate = Arc::new(PolicyGate::new());
                    for collection in &deny_read {
                        gate.deny_read(collection);
                    }
                    if withhold_keys {
                        gate.restrict_keys(Vec::<PeerId>::new());
                    }
                    if !deny_forward.is_empty() {
                        forward_rules.push((gate.clone(), deny_forward));
                    }
                    builder.node_with_gate(name, gate)
                }
            };
        }
        let cluster = builder.build().await?;

        // peer ids exist only once the nodes have started
        for (gate, rules) in forward_rules {
            for rule in rules {
                gate.deny_forward(cluster.node(&rule.peer)?.peer_id(), &rule.collection);
            }
        }
        Ok(cluster)
    }
}

fn referenced_nodes(action: &Action) -> Vec<&str> {
    match action {
        Action::CreateDoc { node, .. }
        | Action::UpdateDoc { node, .. }
        | Action::DeleteDoc { node, .. }
        | Action::AssertDoc { node, .. }
        | Action::AssertMissing { node, .. } => node.as_deref().into_iter().collect(),
        Action::Connect { from, to } => vec![from.as_str(), to.as_str()],
        Action::ConfigureReplicator { source, target, .. }
        | Action::DeleteReplicator { source, target, .. } => vec![source.as_str(), target.as_str()],
        Action::SubscribeToCollection { node, .. }
        | Action::UnsubscribeFromCollection { node, .. }
        | Action::SubscribeToDocument { node, .. }
        | Action::UnsubscribeFromDocument { node, .. }
        | Action::SyncDocuments { node, .. } => vec![node.as_str()],
        Action::WaitForSync { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
description = "two nodes increment the same counter"
nodes = 2

[config]
retry_backoff_ms = 5

[[collections]]
name = "Users"
[collections.fields]
points = "p_counter"

[[actions]]
action = "create_doc"
collection = "Users"
fields = { points = 10 }

[[actions]]
action = "connect"
from = "node0"
to = "node1"
"#;

    #[test]
    fn test_parse_counted_nodes() {
        let scenario = Scenario::parse(COUNTER, Path::new("counter.toml")).unwrap();
        let names: Vec<String> = scenario
            .node_specs()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["node0", "node1"]);
        assert_eq!(scenario.config.retry_backoff_ms, 5);
        assert_eq!(scenario.config.max_txn_retries, NodeConfig::default().max_txn_retries);
        assert_eq!(scenario.actions.len(), 2);
        assert!(scenario.registry().unwrap().contains("Users"));
    }

    #[test]
    fn test_parse_named_nodes() {
        let scenario = Scenario::parse(
            r#"
nodes = ["alpha", { name = "beta", withhold_keys = true }]
"#,
            Path::new("named.toml"),
        )
        .unwrap();
        let specs = scenario.node_specs();
        assert_eq!(specs[0].name(), "alpha");
        assert!(matches!(
            &specs[1],
            NodeSpec::Detailed { name, withhold_keys: true, .. } if name == "beta"
        ));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let err = Scenario::parse(
            r#"
nodes = 2

[[actions]]
action = "connect"
from = "node0"
to = "node7"
"#,
            Path::new("bad.toml"),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "invalid_scenario");
        assert!(err.to_string().contains("node7"));
    }

    #[test]
    fn test_empty_and_duplicate_nodes_rejected() {
        let err = Scenario::parse("nodes = 0\n", Path::new("empty.toml")).unwrap_err();
        assert!(err.to_string().contains("no nodes"));

        let err = Scenario::parse("nodes = [\"a\", \"a\"]\n", Path::new("dup.toml")).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_bad_config_rejected() {
        let err = Scenario::parse(
            "nodes = 1\n[config]\nmax_txn_retries = 0\n",
            Path::new("config.toml"),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "invalid_args");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_and_run() {
        let mut scenario = Scenario::parse(COUNTER, Path::new("counter.toml")).unwrap();
        scenario.actions.push(Action::WaitForSync {
            timeout_ms: 5000,
            expected_error: None,
        });
        let mut cluster = scenario.build_cluster(None).await.unwrap();
        cluster.run(&scenario.actions).await.unwrap();
        assert_eq!(cluster.nodes().len(), 2);
        cluster.shutdown().await.unwrap();
    }
}
