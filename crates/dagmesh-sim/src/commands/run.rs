use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::cli::Cli;
use crate::error::SimError;
use crate::output::output_success;
use crate::scenario::Scenario;

#[derive(Serialize)]
struct RunOutput {
    scenario: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    started_at: DateTime<Utc>,
    elapsed_ms: i64,
    actions: usize,
    documents: serde_json::Value,
}

pub async fn run(cli: &Cli, path: &Path, data_dir: Option<&Path>) -> Result<(), SimError> {
    let scenario = Scenario::load(path)?;
    let started_at = Utc::now();
    info!(
        scenario = %path.display(),
        actions = scenario.actions.len(),
        persistent = data_dir.is_some(),
        "running scenario"
    );

    let mut cluster = scenario.build_cluster(data_dir).await?;
    let result = cluster.run(&scenario.actions).await;
    let documents = match &result {
        Ok(()) => cluster.documents(),
        Err(_) => Ok(serde_json::Value::Null),
    };
    // stop the nodes before reporting, so on-disk stores are flushed either way
    cluster.shutdown().await?;
    result?;

    let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
    info!(scenario = %path.display(), elapsed_ms, "scenario passed");

    output_success(
        cli,
        RunOutput {
            scenario: path.display().to_string(),
            description: scenario.description.clone(),
            started_at,
            elapsed_ms,
            actions: scenario.actions.len(),
            documents: documents?,
        },
    )
}
