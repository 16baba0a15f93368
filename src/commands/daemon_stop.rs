use anyhow::Result;
use tokio::time::{sleep, Duration};

use crate::config::AppConfig;
use crate::daemon::daemon_socket_available;
use crate::ipc::IpcRequest;

use super::common::request;

/// Asks the daemon to stop every process and exit, then waits for its
/// listener to go away.
pub(crate) async fn run(config: &AppConfig) -> Result<()> {
    if !daemon_socket_available(&config.daemon_addr).await {
        println!("Daemon is not running.");
        return Ok(());
    }

    let response = request(config, IpcRequest::Shutdown).await?;
    println!("{}", response.message);

    for _ in 0..100 {
        if !daemon_socket_available(&config.daemon_addr).await {
            println!("Daemon stopped.");
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!(
        "daemon at {} is still answering after shutdown (see {})",
        config.daemon_addr,
        config.daemon_log_path.display()
    )
}
