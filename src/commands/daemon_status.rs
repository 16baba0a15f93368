use std::fs;

use anyhow::Result;

use crate::config::AppConfig;
use crate::daemon::daemon_socket_available;

pub(crate) async fn run(config: &AppConfig) -> Result<()> {
    if !daemon_socket_available(&config.daemon_addr).await {
        println!("Daemon is not running.");
        return Ok(());
    }

    let pid = fs::read_to_string(&config.daemon_pid_path)
        .map(|raw| raw.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    println!("Daemon is running (pid {pid}) at {}", config.daemon_addr);
    println!("Home:  {}", config.base_dir.display());
    println!("Log:   {}", config.daemon_log_path.display());

    Ok(())
}
