mod common;
mod daemon_status;
mod daemon_stop;
mod delete;
mod describe;
mod list;
mod logs;
mod persistence;
mod restart;
mod settings;
mod start;
mod stop;

use anyhow::Result;

use crate::cli::{Commands, DaemonCommand};
use crate::config::AppConfig;

pub async fn run(command: Commands, config: &AppConfig) -> Result<()> {
    let needs_daemon = !matches!(
        command,
        Commands::Kill
            | Commands::Status
            | Commands::Config { .. }
            | Commands::Daemon { .. }
    );

    if needs_daemon {
        crate::daemon::ensure_daemon_running(config).await?;
    }

    match command {
        Commands::Start {
            target,
            args,
            name,
            cwd,
            no_autorestart,
            cron,
            scripts,
            pid,
        } => {
            start::run(
                config,
                start::StartArgs {
                    target,
                    args,
                    name,
                    cwd,
                    no_autorestart,
                    cron,
                    scripts,
                    pid,
                },
            )
            .await
        }
        Commands::Stop { target } => stop::run(config, target).await,
        Commands::Restart { target } => restart::run(config, target).await,
        Commands::Delete { target } => delete::run(config, target).await,
        Commands::List => list::run(config).await,
        Commands::Describe { target } => describe::run(config, target).await,
        Commands::Logs {
            target,
            follow,
            lines,
        } => logs::run(config, target, follow, lines).await,
        Commands::Flush { target } => persistence::flush(config, target).await,
        Commands::Dump { file } => persistence::dump(config, file).await,
        Commands::Restore { file } => persistence::restore(config, file).await,
        Commands::Status => daemon_status::run(config).await,
        Commands::Config { command } => settings::run(config, command),
        Commands::Kill
        | Commands::Daemon {
            command: DaemonCommand::Stop,
        } => daemon_stop::run(config).await,
        Commands::Daemon {
            command: DaemonCommand::Run,
        } => crate::daemon::run_foreground(config.clone()).await,
    }
}
