mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run => commands::run(cli.root).await?,
        Command::Deploy { doc } => commands::deploy(cli.root, doc).await?,
        Command::Status => commands::status(cli.root)?,
        Command::Graph { output } => commands::graph(cli.root, output)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
