use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::IpcRequest;

use super::common::request_and_report;

pub(crate) async fn run(config: &AppConfig, target: String) -> Result<()> {
    request_and_report(config, IpcRequest::Stop { target }).await
}
