//! sheetflow - Main Entry Point

use clap::Parser;
use sheetflow::cli::{run, Cli};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sheetflow=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}
