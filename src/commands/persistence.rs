use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::IpcRequest;

use super::common::{request, request_and_report};
use super::list::print_process_table;

pub(crate) async fn dump(config: &AppConfig, file: Option<String>) -> Result<()> {
    request_and_report(config, IpcRequest::Dump { file }).await
}

pub(crate) async fn restore(config: &AppConfig, file: Option<String>) -> Result<()> {
    let response = request(config, IpcRequest::Restore { file }).await?;
    println!("{}", response.message);
    if !response.processes.is_empty() {
        print_process_table(response.processes);
    }
    Ok(())
}

pub(crate) async fn flush(config: &AppConfig, target: Option<String>) -> Result<()> {
    request_and_report(config, IpcRequest::Flush { target }).await
}
