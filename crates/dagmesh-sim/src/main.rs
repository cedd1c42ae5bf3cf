//! dagmesh-sim - runs replication scenarios against an in-process cluster
//!
//! A scenario is a TOML file with nodes, collections and an ordered list of
//! actions. The runner applies the actions, checks their expectations and
//! prints the documents every node ends up with.

mod cli;
mod commands;
mod error;
mod output;
mod scenario;

use clap::Parser;
use cli::{Cli, Command};
use error::SimError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run_command(&cli).await {
        output::output_error(&cli, &e);
        std::process::exit(e.exit_code());
    }
}

async fn run_command(cli: &Cli) -> Result<(), SimError> {
    match &cli.command {
        Command::Run { scenario, data_dir } => {
            commands::run::run(cli, scenario, data_dir.as_deref()).await
        }
        Command::Check { scenario } => commands::check::run(cli, scenario),
        Command::Db {
            data_dir,
            node,
            cmd,
        } => commands::db::run(cli, data_dir, node, cmd.clone()),
    }
}
