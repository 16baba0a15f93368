use std::env;
use std::fs;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

use crate::config::{AppConfig, DAEMON_MARK_ENV, DAEMON_MARK_VALUE};
use crate::control::ControlSurface;
use crate::errors::OverseerError;
use crate::ipc::{read_json_line, write_json_line, IpcRequest, IpcResponse};
use crate::logging::open_log_file;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::spawner::Spawner;
use crate::storage::load_dump;

pub async fn run_foreground(config: AppConfig) -> Result<()> {
    config.ensure_layout()?;
    let listener = bind_listener(&config.daemon_addr).await?;
    fs::write(&config.daemon_pid_path, std::process::id().to_string()).with_context(|| {
        format!(
            "failed to write daemon pid file {}",
            config.daemon_pid_path.display()
        )
    })?;

    let rotation = match config.log_rotate_settings() {
        Ok(settings) => settings,
        Err(err) => {
            warn!("failed to read log rotation settings, using defaults: {err:#}");
            Default::default()
        }
    };

    let registry = Arc::new(Registry::new());
    let spawner = Spawner::new(&config);
    let control = ControlSurface::new(Arc::clone(&registry), spawner.clone());
    let scheduler = Scheduler::new(registry, spawner, config.tick_interval, rotation);
    let scheduler_task = tokio::spawn(scheduler.run());

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    info!(
        "overseer daemon started at {} (pid {})",
        config.daemon_addr,
        std::process::id()
    );

    loop {
        tokio::select! {
            incoming = listener.accept() => {
                match incoming {
                    Ok((stream, _)) => {
                        let control = control.clone();
                        let config = config.clone();
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, control, config, shutdown_tx).await {
                                error!("failed to handle IPC client: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("IPC accept failed: {err}");
                    }
                }
            }
            Some(_) = shutdown_rx.recv() => {
                info!("shutdown requested via IPC; stopping managed processes");
                break;
            }
            ctrl = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl {
                    warn!("failed to wait for CTRL-C signal: {err}");
                }
                info!("received shutdown signal; stopping managed processes");
                break;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM; stopping managed processes");
                break;
            }
        }
    }

    scheduler_task.abort();
    let stopped = control.stop_all().await;
    info!("stopped {stopped} processes; daemon exiting");
    if let Err(err) = fs::remove_file(&config.daemon_pid_path) {
        warn!("failed to remove daemon pid file: {err}");
    }

    Ok(())
}

/// Starts the daemon in the background unless it already answers on its
/// address, then waits up to five seconds for it to accept connections.
pub async fn ensure_daemon_running(config: &AppConfig) -> Result<()> {
    if daemon_socket_available(&config.daemon_addr).await {
        return Ok(());
    }

    let executable = env::current_exe().context("failed to locate current executable")?;
    let log = open_log_file(&config.daemon_log_path)?;
    let log_err = log
        .try_clone()
        .context("failed to duplicate daemon log handle")?;

    let mut command = Command::new(executable);
    command
        .arg("daemon")
        .arg("run")
        .env(DAEMON_MARK_ENV, DAEMON_MARK_VALUE)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    // Detach from the CLI's session so terminal signals do not reach the daemon.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }
    command.spawn().context("failed to spawn daemon")?;

    for _ in 0..50 {
        if daemon_socket_available(&config.daemon_addr).await {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!(
        "daemon did not become ready in time (see {})",
        config.daemon_log_path.display()
    )
}

pub async fn daemon_socket_available(daemon_addr: &str) -> bool {
    match timeout(Duration::from_millis(250), TcpStream::connect(daemon_addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

async fn bind_listener(daemon_addr: &str) -> Result<TcpListener> {
    if daemon_socket_available(daemon_addr).await {
        return Err(OverseerError::DaemonAlreadyRunning.into());
    }

    TcpListener::bind(daemon_addr)
        .await
        .with_context(|| format!("failed to bind daemon endpoint at {daemon_addr}"))
}

async fn handle_client(
    mut stream: TcpStream,
    control: ControlSurface,
    config: AppConfig,
    shutdown_tx: mpsc::UnboundedSender<()>,
) -> Result<()> {
    let request = read_json_line::<IpcRequest, _>(&mut stream).await?;
    let deadline = config.request_timeout;
    let response = with_deadline(
        deadline,
        spawn_request(request, control, config, shutdown_tx),
    )
    .await;
    write_json_line(&mut stream, &response).await
}

// Requests run on their own task so a late reply never interrupts a
// half-finished registry operation.
fn spawn_request(
    request: IpcRequest,
    control: ControlSurface,
    config: AppConfig,
    shutdown_tx: mpsc::UnboundedSender<()>,
) -> JoinHandle<IpcResponse> {
    tokio::spawn(async move { execute_request(request, &control, &config, &shutdown_tx).await })
}

/// Bounds how long the client waits for a reply. The request itself keeps
/// running after the deadline.
async fn with_deadline(deadline: Duration, request: JoinHandle<IpcResponse>) -> IpcResponse {
    match timeout(deadline, request).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => IpcResponse::error(format!("request handler failed: {err}")),
        Err(_) => IpcResponse::error(format!("request timed out after {deadline:?}")),
    }
}

async fn execute_request(
    request: IpcRequest,
    control: &ControlSurface,
    config: &AppConfig,
    shutdown_tx: &mpsc::UnboundedSender<()>,
) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::ok("pong"),
        IpcRequest::Shutdown => {
            let _ = shutdown_tx.send(());
            IpcResponse::ok("daemon shutdown scheduled")
        }
        IpcRequest::Add { descriptor } => match control.add_process(*descriptor).await {
            Ok(process) => {
                IpcResponse::ok(format!("added {}", process.target_label())).with_process(process)
            }
            Err(err) => IpcResponse::error(format!("{err:#}")),
        },
        IpcRequest::Start { descriptor } => match control.start_process(*descriptor).await {
            Ok(process) => {
                IpcResponse::ok(format!("started {}", process.target_label())).with_process(process)
            }
            Err(err) => IpcResponse::error(format!("{err:#}")),
        },
        IpcRequest::Spawn { descriptor } => match control.spawn_process(*descriptor).await {
            Ok(spawned) => IpcResponse::ok("spawned").with_result(spawned),
            Err(err) => IpcResponse::error(format!("{err:#}")),
        },
        IpcRequest::Stop { target } => {
            let Some(process) = control.find_process(&target).await else {
                return not_found(&target);
            };
            match control.stop_process(process.id).await {
                Ok(true) => IpcResponse::ok(format!("stopped {}", process.target_label()))
                    .with_result(true),
                Ok(false) => IpcResponse::ok(format!("{} is not running", process.target_label()))
                    .with_result(false),
                Err(err) => IpcResponse::error(format!("{err:#}")),
            }
        }
        IpcRequest::Restart { target } => match control.restart_process(&target).await {
            Ok(process) => IpcResponse::ok(format!("restarted {}", process.target_label()))
                .with_process(process),
            Err(err) => IpcResponse::error(format!("{err:#}")),
        },
        IpcRequest::Delete { target } => {
            let Some(process) = control.find_process(&target).await else {
                return not_found(&target);
            };
            match control.delete_process(process.id).await {
                Ok(deleted) => IpcResponse::ok(format!("deleted {}", process.target_label()))
                    .with_result(deleted),
                Err(err) => IpcResponse::error(format!("{err:#}")),
            }
        }
        IpcRequest::List => IpcResponse::ok("ok").with_processes(control.list_processes().await),
        IpcRequest::Find { target } => match control.find_process(&target).await {
            Some(process) => IpcResponse::ok("ok").with_process(process),
            None => IpcResponse::ok(format!("no process matches {target}")),
        },
        IpcRequest::Dump { file } => {
            let path = config.dump_path(file.as_deref());
            match control.dump(&path).await {
                Ok(processes) => IpcResponse::ok(format!(
                    "dumped {} processes to {}",
                    processes.len(),
                    path.display()
                ))
                .with_processes(processes),
                Err(err) => IpcResponse::error(format!("{err:#}")),
            }
        }
        IpcRequest::Restore { file } => {
            let path = config.dump_path(file.as_deref());
            let snapshots = match load_dump(&path) {
                Ok(snapshots) => snapshots,
                Err(err) => return IpcResponse::error(format!("{err:#}")),
            };
            let report = control.restore(snapshots).await;
            let mut message = format!(
                "restored {} processes from {}",
                report.restored.len(),
                path.display()
            );
            if !report.skipped.is_empty() {
                message.push_str(&format!("; skipped {}", report.skipped.join(", ")));
            }
            if !report.failed.is_empty() {
                message.push_str(&format!("; failed {}", report.failed.join(", ")));
            }
            IpcResponse::ok(message).with_processes(report.restored)
        }
        IpcRequest::Flush { target } => match control.flush(target.as_deref()).await {
            Ok(names) if names.is_empty() => IpcResponse::ok("no logs to flush"),
            Ok(names) => IpcResponse::ok(format!("flushed logs of {}", names.join(", "))),
            Err(err) => IpcResponse::error(format!("{err:#}")),
        },
    }
}

fn not_found(target: &str) -> IpcResponse {
    IpcResponse::error(OverseerError::ProcessNotFound(target.to_string()).to_string())
}
