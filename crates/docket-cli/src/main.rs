//! docket - run call requests against an in-process cluster

mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;

use crate::cli::{Cli, Commands};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Matrix => handlers::handle_matrix(),
        Commands::Demo => {
            let config = handlers::load_config(cli.config.as_deref())?;
            handlers::handle_demo(config).await
        }
        Commands::Run {
            requests,
            group,
            timeout_ms,
        } => {
            let config = handlers::load_config(cli.config.as_deref())?;
            handlers::handle_run(config, &requests, group, Duration::from_millis(timeout_ms)).await
        }
    }
}
