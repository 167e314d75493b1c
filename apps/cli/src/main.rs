//! Reservoir CLI: ingest bibliographic records and cluster them by match keys.
//!
//! Each tenant has its own database; records from many sources are stored
//! side by side and grouped into clusters of the same logical work.

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
