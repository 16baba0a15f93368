use std::path::PathBuf;

use clap::{Parser, Subcommand};

const BUILD_VERSION: &str = env!("OVERSEER_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Runtime:
    list/ls/ps, describe/show, logs/log, status
  Lifecycle:
    start, stop, restart/rs, delete/rm, kill
  State:
    dump/save, restore/resurrect, flush, config
  Daemon:
    daemon run, daemon stop

Examples
  overseer start ./server --name api -- --port 8080
  overseer start backup.sh --cron \"0 3 * * *\" --no-autorestart
  overseer start apps.json
  overseer rs api
  overseer log api --lines 50
";

#[derive(Debug, Parser)]
#[command(
    name = "overseer",
    version = BUILD_VERSION,
    about = "Overseer process supervisor",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a new process, a registered one by name or id, or every entry
    /// of a JSON app file.
    Start {
        target: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long = "no-autorestart", default_value_t = false)]
        no_autorestart: bool,
        #[arg(long = "cron")]
        cron: Option<String>,
        /// Shell command the stdout passes through; repeat to chain.
        #[arg(long = "script")]
        scripts: Vec<String>,
        /// Adopt an already running pid instead of spawning.
        #[arg(long)]
        pid: Option<u32>,
    },
    Stop {
        target: String,
    },
    #[command(visible_alias = "rs")]
    Restart {
        target: String,
    },
    #[command(visible_alias = "rm")]
    Delete {
        target: String,
    },
    #[command(visible_aliases = ["ls", "ps"])]
    List,
    #[command(visible_alias = "show")]
    Describe {
        target: String,
    },
    #[command(visible_alias = "log")]
    Logs {
        target: String,
        #[arg(short = 'f', long)]
        follow: bool,
        #[arg(long, default_value_t = 15)]
        lines: usize,
    },
    /// Truncate the logs of one process, or of all of them.
    Flush {
        target: Option<String>,
    },
    #[command(visible_alias = "save")]
    Dump {
        file: Option<String>,
    },
    #[command(visible_alias = "resurrect")]
    Restore {
        file: Option<String>,
    },
    /// Stop every process and shut the daemon down.
    Kill,
    /// Report whether the daemon is running.
    Status,
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommand>,
    },
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    Run,
    Stop,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Keys: logrotate, logrotate_size, logrotate_max_files.
    Set { key: String, value: String },
}
