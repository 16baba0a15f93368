use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::LogRotateSettings;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Deterministic on-disk files owned by one process entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessFiles {
    pub pid: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

pub fn process_files(pid_dir: &Path, log_dir: &Path, name: &str) -> ProcessFiles {
    let stem = file_stem_for(name);
    ProcessFiles {
        pid: pid_dir.join(format!("{stem}.pid")),
        stdout: log_dir.join(format!("{stem}-out.log")),
        stderr: log_dir.join(format!("{stem}-err.log")),
    }
}

// Names may be executable paths; keep the stem a single path component.
fn file_stem_for(name: &str) -> String {
    let value: String = name
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = value.trim_matches(|ch| ch == '-' || ch == '.');
    if trimmed.is_empty() {
        "process".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    options
        .open(path)
        .with_context(|| format!("failed opening {}", path.display()))
}

pub fn timestamp_line(line: &str) -> String {
    format!("{}: {}\n", Local::now().format(TIMESTAMP_FORMAT), line)
}

/// Copies `reader` into `file` line by line, prefixing each line with a
/// timestamp. The file is reopened at `path` when rotation has moved it away.
pub fn spawn_timestamp_filter<R>(reader: R, path: PathBuf, file: File) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut file = tokio::fs::File::from_std(file);
        let mut buffer = Vec::with_capacity(256);

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("log stream for {} failed: {err}", path.display());
                    break;
                }
            }

            let text = String::from_utf8_lossy(&buffer);
            let line = text.trim_end_matches(['\n', '\r']);

            if matches!(tokio::fs::metadata(&path).await, Err(ref err) if err.kind() == ErrorKind::NotFound)
            {
                match open_log_file(&path) {
                    Ok(reopened) => file = tokio::fs::File::from_std(reopened),
                    Err(err) => warn!("failed to reopen rotated log {}: {err}", path.display()),
                }
            }

            if let Err(err) = file.write_all(timestamp_line(line).as_bytes()).await {
                warn!("failed writing log line to {}: {err}", path.display());
            }
        }

        let _ = file.flush().await;
    })
}

fn rotated_path(path: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Rotates the stdout/stderr pair once their combined size exceeds the
/// threshold. Rotated files are numbered by `rotation_count`; at most
/// `max_files` rotated pairs are kept. Returns whether a rotation happened.
pub fn rotate_if_needed(
    stdout: &Path,
    stderr: &Path,
    rotation_count: &mut u32,
    settings: &LogRotateSettings,
) -> Result<bool> {
    if !settings.enabled {
        return Ok(false);
    }

    let combined = file_size(stdout).saturating_add(file_size(stderr));
    if combined <= settings.max_size_bytes {
        return Ok(false);
    }

    let index = *rotation_count;
    for path in [stdout, stderr] {
        if !path.exists() {
            continue;
        }
        let target = rotated_path(path, index);
        fs::rename(path, &target).with_context(|| {
            format!("failed to rotate {} -> {}", path.display(), target.display())
        })?;
        info!("rotated log file {} to {}", path.display(), target.display());
    }
    *rotation_count = index.saturating_add(1);

    if *rotation_count > settings.max_files {
        let oldest = *rotation_count - settings.max_files - 1;
        for path in [stdout, stderr] {
            let candidate = rotated_path(path, oldest);
            match fs::remove_file(&candidate) {
                Ok(()) => info!("deleted rotated log file {}", candidate.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    "failed to delete rotated log file {}: {err}",
                    candidate.display()
                ),
            }
        }
    }

    Ok(true)
}

/// Truncates a log file in place, leaving writers' handles valid.
pub fn flush_log(path: &Path) -> Result<()> {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => file
            .set_len(0)
            .with_context(|| format!("failed to truncate {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed opening {}", path.display())),
    }
}

pub fn read_last_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    if max_lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let mut file =
        File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let total_size = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if total_size == 0 {
        return Ok(Vec::new());
    }

    const CHUNK_SIZE: u64 = 16 * 1024;
    let mut offset = total_size;
    let mut newline_count = 0usize;
    let mut chunks: Vec<Vec<u8>> = Vec::new();

    while offset > 0 && newline_count <= max_lines {
        let read_len = CHUNK_SIZE.min(offset) as usize;
        offset -= read_len as u64;

        file.seek(SeekFrom::Start(offset))
            .with_context(|| format!("failed seeking {}", path.display()))?;

        let mut chunk = vec![0_u8; read_len];
        file.read_exact(&mut chunk)
            .with_context(|| format!("failed reading {}", path.display()))?;
        newline_count += chunk.iter().filter(|&&byte| byte == b'\n').count();
        chunks.push(chunk);
    }

    let bytes: Vec<u8> = chunks.into_iter().rev().flatten().collect();
    let text = String::from_utf8_lossy(&bytes);

    let mut ring = VecDeque::with_capacity(max_lines.saturating_add(1));
    for line in text.lines() {
        ring.push_back(line.to_string());
        if ring.len() > max_lines {
            ring.pop_front();
        }
    }

    Ok(ring.into_iter().collect())
}
