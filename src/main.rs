mod cli;
mod commands;
mod config;
mod daemon;
mod diagnostics;
mod errors;
mod handle;
mod identity;
mod logging;
mod metrics;
mod policy;
mod probe;
mod process;
mod slotfile;
mod storage;
mod supervisor;
mod ui;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    commands::run(cli.command, config).await
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
