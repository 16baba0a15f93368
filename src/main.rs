mod cli;
mod commands;
mod config;
mod control;
mod cron;
mod daemon;
mod errors;
mod ipc;
mod logging;
mod process;
mod registry;
mod scheduler;
mod spawner;
mod storage;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(AppConfig::is_daemon_process());

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    commands::run(cli.command, &config).await
}

// The background daemon writes to daemon.log, so it gets no colour codes.
fn init_tracing(daemonized: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(!daemonized)
        .init();
}
