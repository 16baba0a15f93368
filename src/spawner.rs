//! Creates detached OS processes for process descriptors, wires their output
//! through the timestamping filter and records pid files. Also hosts the OS
//! probes (liveness, parent lookup) and the signal helpers used to stop them.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::OverseerError;
use crate::logging::{open_log_file, process_files, spawn_timestamp_filter, ProcessFiles};
use crate::process::{ProcStatus, Process, ProcessDescriptor};

/// Back-reference to an OS process the registry believes is live. Holding one
/// never keeps the entity itself alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
    owned: bool,
}

impl ProcessHandle {
    pub fn owned(pid: u32) -> Self {
        Self { pid, owned: true }
    }

    pub fn adopted(pid: u32) -> Self {
        Self { pid, owned: false }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the daemon is the OS parent of this process.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn is_alive(&self) -> bool {
        process_exists(self.pid)
    }
}

/// Output of a successful spawn: the populated entity (status left for the
/// registry to set) and its live handle.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub process: Process,
    pub handle: ProcessHandle,
}

#[derive(Debug, Clone)]
pub struct Spawner {
    pid_dir: PathBuf,
    log_dir: PathBuf,
}

impl Spawner {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            pid_dir: config.pid_dir.clone(),
            log_dir: config.log_dir.clone(),
        }
    }

    pub fn files_for(&self, name: &str) -> ProcessFiles {
        process_files(&self.pid_dir, &self.log_dir, name)
    }

    /// Must run inside a tokio runtime: output filters and the reaper are tasks.
    pub fn spawn(&self, descriptor: &ProcessDescriptor) -> Result<SpawnedProcess> {
        let (name, cwd) = resolve_identity(descriptor)?;
        let files = self.files_for(&name);
        let executable = resolve_executable(descriptor.executable_path.trim(), &cwd)?;

        let stdout_log = open_log_file(&files.stdout)?;
        let stderr_log = open_log_file(&files.stderr)?;

        let mut command = Command::new(&executable);
        command
            .args(&descriptor.args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // New session: the child survives daemon signals and owns its process group.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(io::Error::from)
            });
        }

        let mut child = command.spawn().map_err(|err| OverseerError::SpawnFailed {
            name: name.clone(),
            reason: err.to_string(),
        })?;
        let Some(pid) = child.id() else {
            return Err(OverseerError::SpawnFailed {
                name,
                reason: "spawned child has no pid".to_string(),
            }
            .into());
        };

        let wired = wire_outputs(
            &mut child,
            &descriptor.scripts,
            &cwd,
            &files,
            stdout_log,
            stderr_log,
        )
        .and_then(|stages| {
            write_pid_file(&files.pid, pid)?;
            Ok(stages)
        });
        let stages = match wired {
            Ok(stages) => stages,
            Err(err) => {
                let _ = child.start_kill();
                spawn_reaper(&name, child);
                return Err(err);
            }
        };

        spawn_reaper(&name, child);
        for stage in stages {
            spawn_reaper(&name, stage);
        }

        info!("[{name}] spawned pid {pid}");

        let process = Process {
            id: 0,
            name,
            executable_path: executable.display().to_string(),
            args: descriptor.args.clone(),
            cwd,
            pid,
            auto_restart: descriptor.auto_restart,
            cron_restart: descriptor.cron_expr().map(str::to_string),
            next_start_at: None,
            scripts: descriptor.scripts.clone(),
            pid_file_path: files.pid,
            log_file_path: files.stdout,
            err_file_path: files.stderr,
            stop_requested: false,
            log_file_rotation_count: 0,
            status: ProcStatus {
                started_at: Utc::now(),
                parent_pid: std::process::id(),
                ..ProcStatus::default()
            },
        };

        Ok(SpawnedProcess {
            process,
            handle: ProcessHandle::owned(pid),
        })
    }

    /// Builds an entity for an already-running pid started outside the daemon.
    pub fn adopt(&self, descriptor: &ProcessDescriptor, pid: u32) -> Result<SpawnedProcess> {
        let (name, cwd) = resolve_identity(descriptor)?;
        if !process_exists(pid) {
            return Err(OverseerError::SpawnVerificationFailed { name, pid }.into());
        }

        let files = self.files_for(&name);
        write_pid_file(&files.pid, pid)?;
        let parent_pid = os_parent_pid(pid).unwrap_or(1);
        let owned = parent_pid == std::process::id();

        let process = Process {
            id: 0,
            name,
            executable_path: descriptor.executable_path.trim().to_string(),
            args: descriptor.args.clone(),
            cwd,
            pid,
            auto_restart: descriptor.auto_restart,
            cron_restart: descriptor.cron_expr().map(str::to_string),
            next_start_at: None,
            scripts: descriptor.scripts.clone(),
            pid_file_path: files.pid,
            log_file_path: files.stdout,
            err_file_path: files.stderr,
            stop_requested: false,
            log_file_rotation_count: 0,
            status: ProcStatus {
                started_at: Utc::now(),
                parent_pid,
                ..ProcStatus::default()
            },
        };

        let handle = if owned {
            ProcessHandle::owned(pid)
        } else {
            ProcessHandle::adopted(pid)
        };
        Ok(SpawnedProcess { process, handle })
    }
}

fn resolve_identity(descriptor: &ProcessDescriptor) -> Result<(String, PathBuf)> {
    let executable = descriptor.executable_path.trim();
    if executable.is_empty() {
        return Err(
            OverseerError::InvalidDescriptor("executable path is required".to_string()).into(),
        );
    }

    let name = descriptor
        .name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| executable.to_lowercase());

    let cwd = match &descriptor.cwd {
        Some(cwd) => cwd.clone(),
        None => env::current_dir().context("failed to resolve current directory")?,
    };

    Ok((name, cwd))
}

/// PATH lookup. Names containing a slash are checked as-is, relative to `cwd`.
pub fn resolve_executable(executable: &str, cwd: &Path) -> Result<PathBuf, OverseerError> {
    if executable.contains('/') {
        let candidate = if Path::new(executable).is_absolute() {
            PathBuf::from(executable)
        } else {
            cwd.join(executable)
        };
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(OverseerError::ExecutableNotFound(executable.to_string()))
        };
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&search_path)
        .map(|dir| dir.join(executable))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| OverseerError::ExecutableNotFound(executable.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Hooks stdout (through any script stages) and stderr into the timestamping
/// filters. Returns the script stage children so the caller can reap them.
fn wire_outputs(
    child: &mut Child,
    scripts: &[String],
    cwd: &Path,
    files: &ProcessFiles,
    stdout_log: fs::File,
    stderr_log: fs::File,
) -> Result<Vec<Child>> {
    let stdout = child.stdout.take().context("child stdout was not piped")?;
    let stderr = child.stderr.take().context("child stderr was not piped")?;

    let mut stages = Vec::with_capacity(scripts.len());
    let pipeline = chain_scripts(stdout, scripts, cwd, &stderr_log, &mut stages);
    let stdout = match pipeline {
        Ok(stdout) => stdout,
        Err(err) => {
            for stage in stages.iter_mut() {
                let _ = stage.start_kill();
            }
            return Err(err);
        }
    };

    spawn_timestamp_filter(stdout, files.stdout.clone(), stdout_log);
    spawn_timestamp_filter(stderr, files.stderr.clone(), stderr_log);
    Ok(stages)
}

// Each script reads the previous stage's stdout; the last stage feeds the log.
fn chain_scripts(
    mut upstream: ChildStdout,
    scripts: &[String],
    cwd: &Path,
    stderr_log: &fs::File,
    stages: &mut Vec<Child>,
) -> Result<ChildStdout> {
    for script in scripts {
        let stdin: Stdio = upstream
            .try_into()
            .context("failed to hand output to script stage")?;
        let stage_stderr = stderr_log
            .try_clone()
            .context("failed to share stderr log with script stage")?;

        let mut stage = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(cwd)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stage_stderr))
            .spawn()
            .with_context(|| format!("failed to spawn script stage {script:?}"))?;
        upstream = stage
            .stdout
            .take()
            .context("script stage stdout was not piped")?;
        stages.push(stage);
    }
    Ok(upstream)
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, pid.to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

// Reaps the child so it never lingers as a zombie. Status transitions are the
// scheduler's job; this task reports nothing back.
fn spawn_reaper(name: &str, mut child: Child) {
    let name = name.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("[{name}] reaped child: {status}"),
            Err(err) => warn!("[{name}] failed waiting for child: {err}"),
        }
    });
}

/// Liveness probe: signal 0 to the pid.
pub fn process_exists(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn os_parent_pid(pid: u32) -> Option<u32> {
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    system
        .process(sys_pid)
        .and_then(|process| process.parent())
        .map(|parent| parent.as_u32())
}

/// Sends `signal` to `pid`. A process that is already gone is not an error.
pub fn signal_pid(pid: u32, signal: Signal) -> Result<(), OverseerError> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(OverseerError::StopFailed {
            pid,
            reason: err.to_string(),
        }),
    }
}

/// SIGTERM to the process group (falling back to the pid), then SIGKILL once
/// `grace` has elapsed.
pub async fn terminate_owned(pid: u32, grace: Duration) -> Result<(), OverseerError> {
    let pgid = Pid::from_raw(-(pid as i32));

    match kill(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => signal_pid(pid, Signal::SIGTERM)?,
        Err(err) => {
            warn!("failed to send SIGTERM to process group of pid {pid}: {err}");
            signal_pid(pid, Signal::SIGTERM)?;
        }
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if !process_exists(pid) {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }

    if process_exists(pid) {
        warn!("pid {pid} ignored SIGTERM for {grace:?}; sending SIGKILL");
        force_kill(pid, true)?;
    }
    Ok(())
}

/// SIGKILL to the pid, and to its process group when the daemon owns it.
pub fn force_kill(pid: u32, owned: bool) -> Result<(), OverseerError> {
    if owned {
        match kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!("failed to send SIGKILL to process group of pid {pid}: {err}"),
        }
    }
    signal_pid(pid, Signal::SIGKILL)
}
