use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::{load_json, save_json};

/// Set on the re-executed background daemon so it knows not to spawn itself again.
pub const DAEMON_MARK_ENV: &str = "OVERSEER_DAEMONIZED";
pub const DAEMON_MARK_VALUE: &str = "1";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub daemon_addr: String,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    pub daemon_pid_path: PathBuf,
    pub daemon_log_path: PathBuf,
    pub settings_path: PathBuf,
    pub tick_interval: Duration,
    pub request_timeout: Duration,
}

/// Persisted log-rotation settings (`config.json`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRotateSettings {
    #[serde(rename = "logrotate")]
    pub enabled: bool,
    #[serde(rename = "logrotate_size")]
    pub max_size_bytes: u64,
    #[serde(rename = "logrotate_max_files")]
    pub max_files: u32,
}

impl Default for LogRotateSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 10,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("OVERSEER_HOME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join(".overseer")
            });
        let daemon_addr = env::var("OVERSEER_DAEMON_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("127.0.0.1:{}", daemon_port()));

        let config = Self::with_base_dir(base_dir, daemon_addr);
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn with_base_dir(base_dir: PathBuf, daemon_addr: String) -> Self {
        Self {
            pid_dir: base_dir.join("pids"),
            log_dir: base_dir.join("logs"),
            daemon_pid_path: base_dir.join("daemon.pid"),
            daemon_log_path: base_dir.join("daemon.log"),
            settings_path: base_dir.join("config.json"),
            tick_interval: Duration::from_millis(env_u64("OVERSEER_TICK_MS", 500).max(50)),
            request_timeout: Duration::from_millis(
                env_u64("OVERSEER_REQUEST_TIMEOUT_MS", 10_000).max(100),
            ),
            base_dir,
            daemon_addr,
        }
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.base_dir, &self.pid_dir, &self.log_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Dump file inside the base directory; `.json` is appended when missing.
    pub fn dump_path(&self, file_name: Option<&str>) -> PathBuf {
        let name = file_name
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("dump.json");
        if name.ends_with(".json") {
            self.base_dir.join(name)
        } else {
            self.base_dir.join(format!("{name}.json"))
        }
    }

    /// Reads `config.json`, writing the defaults first when it does not exist.
    pub fn log_rotate_settings(&self) -> Result<LogRotateSettings> {
        load_or_create_settings(&self.settings_path)
    }

    pub fn save_log_rotate_settings(&self, settings: &LogRotateSettings) -> Result<()> {
        save_json(&self.settings_path, settings)
    }

    pub fn is_daemon_process() -> bool {
        env::var(DAEMON_MARK_ENV).as_deref() == Ok(DAEMON_MARK_VALUE)
    }
}

fn load_or_create_settings(path: &Path) -> Result<LogRotateSettings> {
    if !path.exists() {
        let defaults = LogRotateSettings::default();
        save_json(path, &defaults)?;
        return Ok(defaults);
    }
    load_json(path)
}

/// Parses `10K`, `10M`, `1G` or a plain byte count.
pub fn parse_size(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let base = digits
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid size {value:?}"))?;
    Ok(base.saturating_mul(multiplier))
}

fn daemon_port() -> u16 {
    let identity = current_identity();
    let mut hash = 2166136261_u32;
    for byte in identity.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }

    // High, non-privileged range.
    let range = 20000_u16;
    40000 + (hash % range as u32) as u16
}

fn current_identity() -> String {
    format!("overseer-uid-{}", nix::unistd::Uid::effective().as_raw())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
