use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cron;
use crate::errors::OverseerError;
use crate::logging::flush_log;
use crate::process::{Process, ProcessDescriptor};
use crate::registry::{Registry, STOP_GRACE};
use crate::spawner::{terminate_owned, SpawnedProcess, Spawner};
use crate::storage::save_dump;

/// Request handlers: validation, spawning and the registry writes that go
/// with them. The scheduler is the only other writer.
#[derive(Clone)]
pub struct ControlSurface {
    registry: Arc<Registry>,
    spawner: Spawner,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RestoreReport {
    pub restored: Vec<Process>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl ControlSurface {
    pub fn new(registry: Arc<Registry>, spawner: Spawner) -> Self {
        Self { registry, spawner }
    }

    /// Spawns (or adopts, when the descriptor carries a pid) and registers.
    pub async fn add_process(&self, descriptor: ProcessDescriptor) -> Result<Process> {
        validate(&descriptor)?;
        let spawned = match descriptor.pid {
            Some(pid) => self.spawner.adopt(&descriptor, pid)?,
            None => self.spawner.spawn(&descriptor)?,
        };
        self.register(spawned).await
    }

    pub async fn find_process(&self, key: &str) -> Option<Process> {
        self.registry.find(key).await
    }

    pub async fn list_processes(&self) -> Vec<Process> {
        self.registry.list().await
    }

    /// Starts the entity registered under the descriptor's name with its
    /// stored spawn parameters, or adds a new one when the name is unknown.
    /// An entity that is already online is returned untouched.
    pub async fn start_process(&self, descriptor: ProcessDescriptor) -> Result<Process> {
        let existing = match descriptor.name.as_deref() {
            Some(name) => self.registry.find(name).await,
            None => None,
        };
        let Some(existing) = existing else {
            return self.add_process(descriptor).await;
        };
        if existing.is_online() {
            return Ok(existing);
        }

        let spawned = self.spawner.spawn(&existing.descriptor())?;
        let handle = spawned.handle;
        match self.registry.start(existing.id, spawned).await {
            Ok(process) => {
                info!("started {}", process.target_label());
                Ok(process)
            }
            Err(err) => {
                discard(handle.pid(), handle.is_owned()).await;
                Err(err)
            }
        }
    }

    pub async fn stop_process(&self, id: u64) -> Result<bool> {
        self.registry.stop(id).await
    }

    /// Stops the entity first when it is still running, then removes it.
    pub async fn delete_process(&self, id: u64) -> Result<bool> {
        let Some(process) = self.registry.find(&id.to_string()).await else {
            return Ok(false);
        };
        if process.is_online() {
            self.registry.stop(id).await?;
        }
        let removed = self.registry.delete(id).await;
        if removed {
            info!("deleted {}", process.target_label());
        }
        Ok(removed)
    }

    /// Spawn plus register in one call; the descriptor's pid is ignored.
    pub async fn spawn_process(&self, descriptor: ProcessDescriptor) -> Result<bool> {
        let descriptor = ProcessDescriptor {
            pid: None,
            ..descriptor
        };
        self.add_process(descriptor).await.map(|_| true)
    }

    pub async fn restart_process(&self, key: &str) -> Result<Process> {
        let existing = self
            .registry
            .find(key)
            .await
            .ok_or_else(|| OverseerError::ProcessNotFound(key.to_string()))?;

        self.registry.stop(existing.id).await?;
        let spawned = self.spawner.spawn(&existing.descriptor())?;
        let handle = spawned.handle;
        match self.registry.restart(existing.id, spawned).await {
            Ok(process) => {
                info!("restarted {}", process.target_label());
                Ok(process)
            }
            Err(err) => {
                discard(handle.pid(), handle.is_owned()).await;
                Err(err)
            }
        }
    }

    /// Writes every entity to `path` and returns the snapshot.
    pub async fn dump(&self, path: &Path) -> Result<Vec<Process>> {
        let processes = self.registry.list().await;
        save_dump(path, &processes)?;
        info!("dumped {} processes to {}", processes.len(), path.display());
        Ok(processes)
    }

    /// Respawns every snapshot whose name is not registered yet. One failing
    /// entry never aborts the rest.
    pub async fn restore(&self, snapshots: Vec<Process>) -> RestoreReport {
        let mut report = RestoreReport::default();
        for snapshot in snapshots {
            if self.registry.find(&snapshot.name).await.is_some() {
                report.skipped.push(snapshot.name);
                continue;
            }

            match self.restore_one(&snapshot).await {
                Ok(process) => report.restored.push(process),
                Err(err) => {
                    error!("failed to restore {}: {err:#}", snapshot.name);
                    report.failed.push(snapshot.name);
                }
            }
        }
        report
    }

    async fn restore_one(&self, snapshot: &Process) -> Result<Process> {
        let descriptor = snapshot.descriptor();
        validate(&descriptor)?;
        let mut spawned = self.spawner.spawn(&descriptor)?;
        spawned.process.status.restarts = snapshot.status.restarts;
        self.register(spawned).await
    }

    /// Truncates the logs of the matching entity, or of every entity when no
    /// target is given. Returns the names that were flushed.
    pub async fn flush(&self, target: Option<&str>) -> Result<Vec<String>> {
        let processes = match target {
            Some(key) => vec![self
                .registry
                .find(key)
                .await
                .ok_or_else(|| OverseerError::ProcessNotFound(key.to_string()))?],
            None => self.registry.list().await,
        };

        let mut flushed = Vec::with_capacity(processes.len());
        for process in processes {
            flush_log(&process.log_file_path)
                .with_context(|| format!("failed to flush logs of {}", process.name))?;
            flush_log(&process.err_file_path)
                .with_context(|| format!("failed to flush logs of {}", process.name))?;
            flushed.push(process.name);
        }
        Ok(flushed)
    }

    /// Stops every online entity. Used on daemon shutdown.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for id in self.registry.online_ids().await {
            match self.registry.stop(id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(err) => warn!("failed to stop process {id} during shutdown: {err:#}"),
            }
        }
        stopped
    }

    async fn register(&self, spawned: SpawnedProcess) -> Result<Process> {
        let handle = spawned.handle;
        match self.registry.add(spawned).await {
            Ok(process) => {
                info!("registered {} (pid {})", process.target_label(), process.pid);
                Ok(process)
            }
            Err(err) => {
                discard(handle.pid(), handle.is_owned()).await;
                Err(err)
            }
        }
    }
}

// Rejections happen before any OS resource is touched.
fn validate(descriptor: &ProcessDescriptor) -> Result<(), OverseerError> {
    if descriptor.executable_path.trim().is_empty() {
        return Err(OverseerError::InvalidDescriptor(
            "executable path is required".to_string(),
        ));
    }
    if let Some(expr) = descriptor.cron_expr() {
        cron::parse(expr)?;
    }
    Ok(())
}

// A process the registry refused must not keep running if we started it.
async fn discard(pid: u32, owned: bool) {
    if !owned {
        return;
    }
    if let Err(err) = terminate_owned(pid, STOP_GRACE).await {
        warn!("failed to terminate unregistered pid {pid}: {err}");
    }
}
