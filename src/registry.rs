use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::LogRotateSettings;
use crate::cron;
use crate::errors::OverseerError;
use crate::logging::rotate_if_needed;
use crate::process::{Process, ProcessDescriptor, ProcessStatus};
use crate::spawner::{
    force_kill, process_exists, signal_pid, terminate_owned, ProcessHandle, SpawnedProcess,
};

/// Grace window between SIGTERM and SIGKILL for processes the daemon owns.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// The daemon's authoritative store. Every read and write goes through one
/// mutex; OS signalling and spawning happen outside of it.
pub struct Registry {
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    by_id: BTreeMap<u64, Process>,
    by_name: HashMap<String, u64>,
    live_handles: HashMap<u64, ProcessHandle>,
    // Entities the scheduler marked for respawn and has not completed yet.
    pending_restarts: HashSet<u64>,
    next_id: u64,
    system: System,
}

// How `stop` deals with the OS process once the lock is released.
#[derive(Debug, Clone, Copy)]
enum StopPlan {
    Terminate(ProcessHandle),
    Kill(ProcessHandle),
}

impl StopPlan {
    fn handle(&self) -> ProcessHandle {
        match self {
            StopPlan::Terminate(handle) | StopPlan::Kill(handle) => *handle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTrigger {
    Crash,
    Cron,
}

/// What the scheduler has to do for an entity after a reconcile pass.
#[derive(Debug)]
pub enum Reconcile {
    Idle,
    Restart {
        descriptor: ProcessDescriptor,
        trigger: RestartTrigger,
    },
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                by_id: BTreeMap::new(),
                by_name: HashMap::new(),
                live_handles: HashMap::new(),
                pending_restarts: HashSet::new(),
                next_id: 1,
                system: System::new(),
            }),
        }
    }

    /// Registers a freshly spawned (or adopted) process and assigns its id.
    /// The pid is probed again under the lock, so a process that died since
    /// spawn is rejected rather than recorded as online.
    pub async fn add(&self, spawned: SpawnedProcess) -> Result<Process> {
        let SpawnedProcess {
            mut process,
            handle,
        } = spawned;

        process.next_start_at = match process.cron_restart.as_deref().map(str::trim) {
            Some(expr) if !expr.is_empty() => Some(cron::next_occurrence(expr, Utc::now())?),
            _ => {
                process.cron_restart = None;
                None
            }
        };

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        if !handle.is_alive() {
            return Err(OverseerError::SpawnVerificationFailed {
                name: process.name,
                pid: handle.pid(),
            }
            .into());
        }

        let id = state.next_id;
        state.next_id += 1;

        process.id = id;
        process.pid = handle.pid();
        process.stop_requested = false;
        process.set_status(ProcessStatus::Online);
        process.init_started_at();

        if let Some(previous) = state.by_name.insert(process.name.clone(), id) {
            warn!(
                "name {} now refers to id {id}; id {previous} is only reachable by id",
                process.name
            );
        }
        state.live_handles.insert(id, handle);
        state.by_id.insert(id, process.clone());

        Ok(process)
    }

    /// Integer keys are ids; anything else is a name.
    pub async fn find(&self, key: &str) -> Option<Process> {
        let key = key.trim();
        let state = self.inner.lock().await;
        let id = match key.parse::<u64>() {
            Ok(id) => id,
            Err(_) => *state.by_name.get(key)?,
        };
        state.by_id.get(&id).cloned()
    }

    /// Id-ordered listing. Refreshes the CPU/memory sample of every online
    /// entity as a side effect.
    pub async fn list(&self) -> Vec<Process> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        for process in state.by_id.values_mut() {
            if process.is_online() {
                process.update_cpu_memory(&mut state.system);
            }
        }
        state.by_id.values().cloned().collect()
    }

    pub async fn ids(&self) -> Vec<u64> {
        self.inner.lock().await.by_id.keys().copied().collect()
    }

    pub async fn online_ids(&self) -> Vec<u64> {
        self.inner
            .lock()
            .await
            .by_id
            .values()
            .filter(|process| process.is_online())
            .map(|process| process.id)
            .collect()
    }

    /// Re-spawn semantics: copies the new pid and files in, clears the stop
    /// flag and tracks the new handle.
    pub async fn start(&self, id: u64, spawned: SpawnedProcess) -> Result<Process> {
        self.respawn(id, spawned, false).await
    }

    /// Same as [`Registry::start`], counting the respawn as a restart.
    pub async fn restart(&self, id: u64, spawned: SpawnedProcess) -> Result<Process> {
        self.respawn(id, spawned, true).await
    }

    async fn respawn(&self, id: u64, spawned: SpawnedProcess, counted: bool) -> Result<Process> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let Some(process) = state.by_id.get_mut(&id) else {
            return Err(OverseerError::ProcessNotFound(id.to_string()).into());
        };
        if !spawned.handle.is_alive() {
            return Err(OverseerError::SpawnVerificationFailed {
                name: process.name.clone(),
                pid: spawned.handle.pid(),
            }
            .into());
        }

        apply_spawned(process, spawned.process);
        if counted {
            process.increase_restarts();
        }
        if process.cron_restart.is_some() && process.next_start_at.is_none() {
            if let Err(err) = process.update_next_start_at() {
                error!("[{}] dropped cron schedule: {err}", process.target_label());
            }
        }
        state.pending_restarts.remove(&id);
        state.live_handles.insert(id, spawned.handle);
        Ok(process.clone())
    }

    /// Marks the entity as explicitly stopped and terminates its tracked OS
    /// process. Returns `false` when there is nothing left to stop. An entity
    /// stuck in `stopping` with a live pid gets SIGKILL.
    pub async fn stop(&self, id: u64) -> Result<bool> {
        let (plan, label) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let Some(process) = state.by_id.get_mut(&id) else {
                return Ok(false);
            };

            process.stop_requested = true;
            state.pending_restarts.remove(&id);
            let plan = match state.live_handles.remove(&id) {
                Some(handle) => StopPlan::Terminate(handle),
                None if process.status.status == ProcessStatus::Stopping
                    && process_exists(process.pid) =>
                {
                    let handle = if process.status.parent_pid == std::process::id() {
                        ProcessHandle::owned(process.pid)
                    } else {
                        ProcessHandle::adopted(process.pid)
                    };
                    StopPlan::Kill(handle)
                }
                None => {
                    if process.status.status != ProcessStatus::Stopping {
                        mark_stopped(process);
                    }
                    return Ok(false);
                }
            };
            process.set_status(ProcessStatus::Stopping);
            (plan, process.target_label())
        };

        let handle = plan.handle();
        let delivered = match plan {
            StopPlan::Terminate(handle) if handle.is_owned() => {
                info!("stopping {label} (pid {})", handle.pid());
                terminate_owned(handle.pid(), STOP_GRACE).await
            }
            StopPlan::Terminate(handle) => {
                info!("stopping {label} (pid {})", handle.pid());
                // Not our child: signal it and let the scheduler observe the exit.
                signal_pid(handle.pid(), Signal::SIGTERM)
            }
            StopPlan::Kill(handle) => {
                warn!("{label} is still stopping; sending SIGKILL to pid {}", handle.pid());
                force_kill(handle.pid(), handle.is_owned())
            }
        };

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Some(process) = state.by_id.get_mut(&id) else {
            return delivered.map(|()| true).map_err(Into::into);
        };
        if process.pid != handle.pid() || process.status.status != ProcessStatus::Stopping {
            return delivered.map(|()| true).map_err(Into::into);
        }

        match delivered {
            Ok(()) => {
                if handle.is_owned() || !handle.is_alive() {
                    mark_stopped(process);
                }
                Ok(true)
            }
            Err(err) if matches!(plan, StopPlan::Kill(_)) => Err(err.into()),
            Err(err) => {
                process.stop_requested = false;
                process.set_status(ProcessStatus::Online);
                state.live_handles.insert(id, handle);
                Err(err.into())
            }
        }
    }

    /// Removes the entity from every index. Never stops the OS process.
    pub async fn delete(&self, id: u64) -> bool {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Some(process) = state.by_id.remove(&id) else {
            return false;
        };
        if state.by_name.get(&process.name) == Some(&id) {
            state.by_name.remove(&process.name);
        }
        state.live_handles.remove(&id);
        state.pending_restarts.remove(&id);
        true
    }

    /// One scheduler pass for one entity: probes liveness, applies the exit
    /// transition and decides whether a crash or cron restart is due.
    pub async fn reconcile(&self, id: u64, now: DateTime<Utc>) -> Reconcile {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Some(process) = state.by_id.get_mut(&id) else {
            return Reconcile::Idle;
        };

        match process.status.status {
            ProcessStatus::Online | ProcessStatus::Stopping => {
                if process.pid != 0 && process_exists(process.pid) {
                    process.update_uptime();
                    return Reconcile::Idle;
                }

                let crashed = process.is_online();
                info!(
                    "{} exited (pid {}, uptime {}s)",
                    process.target_label(),
                    process.pid,
                    Utc::now()
                        .signed_duration_since(process.status.started_at)
                        .num_seconds()
                        .max(0)
                );
                mark_stopped(process);
                state.live_handles.remove(&id);

                if crashed && process.auto_restart && !process.stop_requested {
                    process.increase_restarts();
                    state.pending_restarts.insert(id);
                    return Reconcile::Restart {
                        descriptor: process.descriptor(),
                        trigger: RestartTrigger::Crash,
                    };
                }
                Reconcile::Idle
            }
            ProcessStatus::Stopped => {
                if process.is_cron_due(now) && state.pending_restarts.insert(id) {
                    process.increase_restarts();
                    return Reconcile::Restart {
                        descriptor: process.descriptor(),
                        trigger: RestartTrigger::Cron,
                    };
                }
                Reconcile::Idle
            }
        }
    }

    /// Completes a restart handed out by [`Registry::reconcile`]. When the
    /// restart was cancelled meanwhile (stop or delete), the new handle is
    /// returned so the caller can terminate it.
    pub async fn finish_restart(
        &self,
        id: u64,
        trigger: RestartTrigger,
        spawned: SpawnedProcess,
    ) -> Option<ProcessHandle> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if !state.pending_restarts.remove(&id) {
            return Some(spawned.handle);
        }
        let Some(process) = state.by_id.get_mut(&id) else {
            return Some(spawned.handle);
        };

        apply_spawned(process, spawned.process);
        if trigger == RestartTrigger::Cron {
            if let Err(err) = process.update_next_start_at() {
                error!("[{}] dropped cron schedule: {err}", process.target_label());
            }
        }
        info!(
            "{} restarted ({:?}) with pid {}",
            process.target_label(),
            trigger,
            process.pid
        );
        state.live_handles.insert(id, spawned.handle);
        None
    }

    /// A respawn failed: auto-restart is switched off for good and the entity
    /// stays stopped until someone starts it again.
    pub async fn fail_restart(&self, id: u64, err: &anyhow::Error) {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if !state.pending_restarts.remove(&id) {
            return;
        }
        let Some(process) = state.by_id.get_mut(&id) else {
            return;
        };

        process.auto_restart = false;
        process.stop_requested = true;
        process.next_start_at = None;
        mark_stopped(process);
        error!(
            "{} could not be restarted, giving up: {err:#}",
            process.target_label()
        );
    }

    /// Log-rotation maintenance for one entity, done under the lock so the
    /// rotation counter never races with another writer.
    pub async fn rotate_logs(&self, id: u64, settings: &LogRotateSettings) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let Some(process) = guard.by_id.get_mut(&id) else {
            return Ok(false);
        };
        rotate_if_needed(
            &process.log_file_path,
            &process.err_file_path,
            &mut process.log_file_rotation_count,
            settings,
        )
    }

    #[cfg(test)]
    async fn tracks_handle(&self, id: u64) -> bool {
        self.inner.lock().await.live_handles.contains_key(&id)
    }
}

fn apply_spawned(process: &mut Process, fresh: Process) {
    process.pid = fresh.pid;
    process.executable_path = fresh.executable_path;
    process.pid_file_path = fresh.pid_file_path;
    process.log_file_path = fresh.log_file_path;
    process.err_file_path = fresh.err_file_path;
    process.status.parent_pid = fresh.status.parent_pid;
    process.stop_requested = false;
    process.set_status(ProcessStatus::Online);
    process.init_started_at();
    process.reset_cpu_memory();
}

fn mark_stopped(process: &mut Process) {
    if process.pid != 0 {
        process.update_uptime();
    }
    process.reset_pid();
    process.set_status(ProcessStatus::Stopped);
    process.reset_cpu_memory();
}
