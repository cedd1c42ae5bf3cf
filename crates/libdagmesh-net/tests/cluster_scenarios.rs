//! Scenario-level convergence tests driven through the action dispatcher

use libdagmesh_core::{CollectionDef, CollectionRegistry, CrdtKind, NodeConfig};
use libdagmesh_net::{Action, Cluster, ClusterBuilder};
use serde::Deserialize;

#[derive(Deserialize)]
struct Script {
    actions: Vec<Action>,
}

fn registry() -> CollectionRegistry {
    CollectionRegistry::from_defs([
        CollectionDef::new("Users")
            .field("name", CrdtKind::LwwRegister)
            .field("points", CrdtKind::PCounter)
            .field("balance", CrdtKind::PnCounter),
        CollectionDef::new("Books").field("title", CrdtKind::LwwRegister),
        CollectionDef::new("Ledger")
            .branchable()
            .field("amount", CrdtKind::PnCounter),
    ])
    .unwrap()
}

fn config() -> NodeConfig {
    NodeConfig {
        retry_backoff_ms: 5,
        request_timeout_ms: 2000,
        replicator_retry_interval_ms: 50,
        ..NodeConfig::default()
    }
}

async fn cluster(nodes: usize) -> Cluster {
    ClusterBuilder::new(registry())
        .config(config())
        .nodes(nodes)
        .build()
        .await
        .unwrap()
}

async fn run(cluster: &mut Cluster, script: &str) {
    let script: Script = toml::from_str(script).unwrap();
    cluster.run(&script.actions).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counter_increments_counted_once() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "create_doc"
collection = "Users"
fields = { points = 10 }

[[actions]]
action = "connect"
from = "node0"
to = "node1"

[[actions]]
action = "update_doc"
collection = "Users"
doc = 0
fields = { points = 10 }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
collection = "Users"
doc = 0
fields = { points = 30 }
"#,
    )
    .await;

    let doc_id = cluster.doc_id("Users", 0).unwrap();
    let heads0 = cluster.node("node0").unwrap().heads(&doc_id).unwrap();
    let heads1 = cluster.node("node1").unwrap().heads(&doc_id).unwrap();
    assert_eq!(heads0, heads1);
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicator_is_directional() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "configure_replicator"
source = "node0"
target = "node1"

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "from-source" }

[[actions]]
action = "create_doc"
node = "node1"
collection = "Users"
fields = { name = "from-target" }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
node = "node1"
collection = "Users"
doc = 0
fields = { name = "from-source" }

[[actions]]
action = "assert_missing"
node = "node0"
collection = "Users"
doc = 1

[[actions]]
action = "update_doc"
node = "node1"
collection = "Users"
doc = 0
fields = { name = "edited-on-target" }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
collection = "Users"
doc = 0
fields = { name = "edited-on-target" }
"#,
    )
    .await;
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicator_collection_filter() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "configure_replicator"
source = "node0"
target = "node1"
collections = ["Books"]

[[actions]]
action = "create_doc"
node = "node0"
collection = "Books"
fields = { title = "Dune" }

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "kept-local" }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
node = "node1"
collection = "Books"
doc = 0
fields = { title = "Dune" }

[[actions]]
action = "assert_missing"
node = "node1"
collection = "Users"
doc = 0
"#,
    )
    .await;
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_collection_subscription_backfills() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "Ada" }

[[actions]]
action = "create_doc"
node = "node0"
collection = "Books"
fields = { title = "Dune" }

[[actions]]
action = "connect"
from = "node0"
to = "node1"

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_missing"
node = "node1"
collection = "Users"
doc = 0

[[actions]]
action = "subscribe_to_collection"
node = "node1"
collections = ["Users"]

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
node = "node1"
collection = "Users"
doc = 0
fields = { name = "Ada" }

[[actions]]
action = "assert_missing"
node = "node1"
collection = "Books"
doc = 0
"#,
    )
    .await;
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_document_subscription() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "first" }

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "second" }

[[actions]]
action = "connect"
from = "node1"
to = "node0"

[[actions]]
action = "subscribe_to_document"
node = "node1"
collection = "Users"
docs = [1]

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
node = "node1"
collection = "Users"
doc = 1
fields = { name = "second" }

[[actions]]
action = "assert_missing"
node = "node1"
collection = "Users"
doc = 0

[[actions]]
action = "update_doc"
node = "node0"
collection = "Users"
doc = 1
fields = { name = "second, edited" }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
node = "node1"
collection = "Users"
doc = 1
fields = { name = "second, edited" }
"#,
    )
    .await;
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_through_middle_node() {
    let mut cluster = cluster(3).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "subscribe_to_collection"
node = "node1"
collections = ["Users"]

[[actions]]
action = "subscribe_to_collection"
node = "node2"
collections = ["Users"]

[[actions]]
action = "connect"
from = "node0"
to = "node1"

[[actions]]
action = "connect"
from = "node1"
to = "node2"

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "hop", balance = 5 }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "update_doc"
node = "node2"
collection = "Users"
doc = 0
fields = { balance = -2 }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
collection = "Users"
doc = 0
fields = { name = "hop", balance = 3 }
"#,
    )
    .await;
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_propagates_as_tombstone() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "connect"
from = "node0"
to = "node1"

[[actions]]
action = "subscribe_to_collection"
node = "node1"
collections = ["Users"]

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "short-lived" }

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "delete_doc"
node = "node1"
collection = "Users"
doc = 0

[[actions]]
action = "wait_for_sync"

[[actions]]
action = "assert_doc"
collection = "Users"
doc = 0
deleted = true

[[actions]]
action = "update_doc"
node = "node0"
collection = "Users"
doc = 0
fields = { name = "too late" }
expected_error = "not_found"
"#,
    )
    .await;
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_branchable_collection_commits_travel() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "configure_replicator"
source = "node0"
target = "node1"
collections = ["Ledger"]

[[actions]]
action = "create_doc"
node = "node0"
collection = "Ledger"
fields = { amount = 100 }

[[actions]]
action = "create_doc"
node = "node0"
collection = "Ledger"
fields = { amount = 7 }

[[actions]]
action = "wait_for_sync"
"#,
    )
    .await;

    let source = cluster.node("node0").unwrap().store().collection_heads("Ledger").unwrap();
    assert_eq!(source.len(), 1);

    // the pushes land asynchronously after the documents converge
    let target = cluster.node("node1").unwrap();
    let mut heads = Vec::new();
    for _ in 0..100 {
        heads = target.store().collection_heads("Ledger").unwrap();
        if heads == source {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(heads, source);
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expected_errors() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "subscribe_to_collection"
node = "node0"
collections = ["Nope"]
expected_error = "not_found"

[[actions]]
action = "create_doc"
node = "node0"
collection = "Nope"
fields = { name = "x" }
expected_error = "not_found"

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { age = 3 }
expected_error = "invalid_args"

[[actions]]
action = "configure_replicator"
source = "node0"
target = "node0"
expected_error = "invalid_args"

[[actions]]
action = "configure_replicator"
source = "node0"
target = "node1"

[[actions]]
action = "configure_replicator"
source = "node1"
target = "node0"
expected_error = "topology_conflict"

[[actions]]
action = "configure_replicator"
source = "node0"
target = "node1"
collections = ["Users"]

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "Ada" }

[[actions]]
action = "create_doc"
node = "node0"
collection = "Users"
fields = { name = "Ada" }
expected_error = "already_exists"
"#,
    )
    .await;

    // an expectation that does not hold is reported
    let script: Script = toml::from_str(
        r#"
[[actions]]
action = "create_doc"
node = "node0"
collection = "Books"
fields = { title = "fine" }
expected_error = "not_found"
"#,
    )
    .unwrap();
    let err = cluster.run(&script.actions).await.unwrap_err();
    assert_eq!(err.error_code(), "expectation_failed");
    cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_documents_json_lists_every_node() {
    let mut cluster = cluster(2).await;
    run(
        &mut cluster,
        r#"
[[actions]]
action = "create_doc"
collection = "Books"
fields = { title = "Solaris" }
"#,
    )
    .await;

    let json = cluster.documents().unwrap();
    for node in ["node0", "node1"] {
        let books = json[node]["Books"].as_array().unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0]["fields"]["title"], "Solaris");
    }
    cluster.shutdown().await.unwrap();
}
