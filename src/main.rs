use std::io;

use anyhow::Result;
use api_fetcher::{cli::Cli, http::Client};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout carries only the fetched result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    cli.run(Client::new(), io::stdout().lock())
}
