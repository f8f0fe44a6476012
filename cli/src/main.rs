//! OpenNet CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use opennet_cli::commands::{default_filter, dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so `plan --json` output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose))),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    tracing::debug!(version = opennet_core::VERSION, "opennet starting");

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
