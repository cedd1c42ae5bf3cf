use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dagmesh-sim", about = "Run dagmesh replication scenarios", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress human-readable output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a scenario and print the documents every node ends up with
    Run {
        /// Scenario file
        scenario: PathBuf,

        /// Keep node stores on disk under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Parse and validate a scenario without running it
    Check {
        /// Scenario file
        scenario: PathBuf,
    },

    /// Inspect the on-disk store of a node from an earlier run
    Db {
        /// Directory given to `run --data-dir`
        #[arg(long)]
        data_dir: PathBuf,

        /// Node name
        #[arg(long)]
        node: String,

        #[command(subcommand)]
        cmd: DbCommand,
    },
}

#[derive(Subcommand, Clone)]
pub enum DbCommand {
    /// Show store statistics
    Stats,
    /// Recompute head sets and indexes from the stored commits
    Rebuild,
}
