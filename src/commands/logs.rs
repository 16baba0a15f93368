use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{sleep, Duration};

use crate::config::AppConfig;
use crate::ipc::IpcRequest;
use crate::logging::read_last_lines;

use super::common::request;

pub(crate) async fn run(
    config: &AppConfig,
    target: String,
    follow: bool,
    lines: usize,
) -> Result<()> {
    let response = request(
        config,
        IpcRequest::Find {
            target: target.clone(),
        },
    )
    .await?;
    let Some(process) = response.process else {
        anyhow::bail!("no process matches {target}");
    };

    let sections = [
        process.log_file_path.as_path(),
        process.err_file_path.as_path(),
    ];
    for line in render_tail(&sections, lines)? {
        println!("{line}");
    }
    if follow {
        follow_logs(process.log_file_path, process.err_file_path).await?;
    }

    Ok(())
}

fn render_tail(paths: &[&Path], lines: usize) -> Result<Vec<String>> {
    let mut rendered = Vec::new();
    for path in paths {
        rendered.push(format!("==> {} <==", path.display()));
        rendered.extend(read_last_lines(path, lines)?);
    }
    Ok(rendered)
}

async fn follow_logs(stdout_path: PathBuf, stderr_path: PathBuf) -> Result<()> {
    println!("Following logs (Ctrl-C to stop)...");

    let mut stdout_task = tokio::spawn(async move { follow_file(stdout_path, "out").await });
    let mut stderr_task = tokio::spawn(async move { follow_file(stderr_path, "err").await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = &mut stdout_task => {}
        _ = &mut stderr_task => {}
    }

    stdout_task.abort();
    stderr_task.abort();
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    Ok(())
}

// Polls the file; a shrink (flush or rotation) reopens it from the start.
async fn follow_file(path: PathBuf, label: &'static str) -> Result<()> {
    if !path.exists() {
        std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .read(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    file.seek(std::io::SeekFrom::End(0)).await?;

    loop {
        let mut buffer = Vec::new();
        let bytes_read = file.read_to_end(&mut buffer).await?;
        if bytes_read > 0 {
            let text = String::from_utf8_lossy(&buffer);
            for line in text.lines() {
                println!("[{label}] {line}");
            }
        } else {
            let current_pos = file.stream_position().await?;
            let shrunk = tokio::fs::metadata(&path)
                .await
                .map(|meta| meta.len() < current_pos)
                .unwrap_or(true);
            if shrunk {
                if let Ok(reopened) = tokio::fs::OpenOptions::new().read(true).open(&path).await {
                    file = reopened;
                }
            }
        }
        sleep(Duration::from_millis(300)).await;
    }
}
