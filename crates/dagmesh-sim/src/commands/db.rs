use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libdagmesh_core::config::node_sled_path;
use libdagmesh_core::{CommitStore, MeshError};
use serde::Serialize;

use crate::cli::{Cli, DbCommand};
use crate::error::SimError;
use crate::output::output_success;

#[derive(Serialize)]
struct DbStatsOutput {
    path: Option<String>,
    size_bytes: u64,
    commit_count: usize,
    document_count: usize,
    last_rebuild: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct RebuildOutput {
    commit_count: usize,
    document_count: usize,
    collection_count: usize,
}

pub fn run(cli: &Cli, data_dir: &Path, node: &str, cmd: DbCommand) -> Result<(), SimError> {
    let path = node_sled_path(data_dir, node);
    if !path.exists() {
        return Err(MeshError::NotFound(format!("store of node '{}' at {}", node, path.display())).into());
    }
    let (store, _lock) = CommitStore::open_locked_blocking(&path, Duration::from_secs(5))?.into_inner();

    match cmd {
        DbCommand::Stats => {
            let stats = store.stats(Some(path.as_path()))?;
            output_success(
                cli,
                DbStatsOutput {
                    path: stats.path,
                    size_bytes: stats.size_bytes,
                    commit_count: stats.commit_count,
                    document_count: stats.document_count,
                    last_rebuild: stats.last_rebuild,
                },
            )
        }
        DbCommand::Rebuild => {
            let stats = store.rebuild_heads()?;
            store.flush()?;
            output_success(
                cli,
                RebuildOutput {
                    commit_count: stats.commit_count,
                    document_count: stats.document_count,
                    collection_count: stats.collection_count,
                },
            )
        }
    }
}
