use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "keel",
    about = "Edge-device software orchestrator: declarative deployments over a supervised process tree",
    version
)]
pub struct Cli {
    /// Supervisor root directory (config, launch dirs, packages).
    #[arg(long, env = "KEEL_ROOT", default_value = ".keel", global = true)]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the supervisor and run until interrupted.
    Run,

    /// Apply one deployment document and print the result.
    Deploy {
        /// Path to the deployment document (JSON).
        doc: PathBuf,
    },

    /// Show the component set and lifecycle states.
    Status,

    /// Render the component dependency graph.
    Graph {
        /// Output format.
        #[arg(long, default_value = "text")]
        output: GraphOutput,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum GraphOutput {
    Text,
    Dot,
}
