use std::path::Path;

use serde::Serialize;

use crate::cli::Cli;
use crate::error::SimError;
use crate::output::{output_success, print_human};
use crate::scenario::Scenario;

#[derive(Serialize)]
struct CheckOutput {
    scenario: String,
    nodes: Vec<String>,
    collections: Vec<String>,
    actions: usize,
}

pub fn run(cli: &Cli, path: &Path) -> Result<(), SimError> {
    let scenario = Scenario::load(path)?;
    let output = CheckOutput {
        scenario: path.display().to_string(),
        nodes: scenario
            .node_specs()
            .iter()
            .map(|spec| spec.name().to_string())
            .collect(),
        collections: scenario.registry()?.names(),
        actions: scenario.actions.len(),
    };

    if cli.json {
        return output_success(cli, output);
    }
    print_human(
        cli,
        &format!(
            "{}: {} nodes, {} collections, {} actions",
            output.scenario,
            output.nodes.len(),
            output.collections.len(),
            output.actions
        ),
    );
    Ok(())
}
