//! Harvester CLI: crawl institutional sites into a chunk index.
//!
//! Crawls from configured seeds, extracts context-annotated blocks, chunks them
//! and stores the chunks (optionally embedded) in a local libSQL database.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
