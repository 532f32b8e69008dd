//! kiln-build CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln_build::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::from_default_env().add_directive("kiln_build=info".parse()?))
        .init();

    let cli = Cli::parse();
    cli.execute().await
}
