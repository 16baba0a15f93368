use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest, IpcResponse};

/// Sends `request` to the daemon and turns a failed response into an error.
pub(crate) async fn request(config: &AppConfig, request: IpcRequest) -> Result<IpcResponse> {
    let response = send_request(&config.daemon_addr, &request).await?;
    expect_ok(response)
}

/// Sends `request` and prints the daemon's message.
pub(crate) async fn request_and_report(config: &AppConfig, request: IpcRequest) -> Result<()> {
    let response = self::request(config, request).await?;
    println!("{}", response.message);
    Ok(())
}

pub(crate) fn expect_ok(response: IpcResponse) -> Result<IpcResponse> {
    if response.ok {
        Ok(response)
    } else {
        anyhow::bail!(response.message)
    }
}

pub(crate) fn dash_if_zero(value: u32) -> String {
    if value == 0 {
        "-".to_string()
    } else {
        value.to_string()
    }
}
