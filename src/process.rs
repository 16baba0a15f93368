use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

use crate::cron;
use crate::errors::OverseerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Online,
    Stopping,
    #[default]
    Stopped,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ProcessStatus::Online => "online",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Stopped => "stopped",
        };
        write!(f, "{value}")
    }
}

/// Runtime status sub-record of a [`Process`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcStatus {
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub restarts: u32,
    pub cpu: String,
    pub memory: String,
    /// OS parent recorded when the entity was registered. Equal to the daemon's
    /// pid for processes it spawned itself; anything else means adopted.
    pub parent_pid: u32,
}

impl Default for ProcStatus {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Stopped,
            started_at: Utc::now(),
            uptime_secs: 0,
            restarts: 0,
            cpu: IDLE_CPU.to_string(),
            memory: IDLE_MEMORY.to_string(),
            parent_pid: 0,
        }
    }
}

/// What a client asks the daemon to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    pub executable_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default)]
    pub cron_restart: Option<String>,
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Adopt this already-running pid instead of spawning.
    #[serde(default)]
    pub pid: Option<u32>,
}

impl ProcessDescriptor {
    pub fn new(executable_path: impl Into<String>) -> Self {
        Self {
            name: None,
            executable_path: executable_path.into(),
            args: Vec::new(),
            cwd: None,
            auto_restart: true,
            cron_restart: None,
            scripts: Vec::new(),
            pid: None,
        }
    }

    /// Cron expression with blank values treated as absent.
    pub fn cron_expr(&self) -> Option<&str> {
        self.cron_restart
            .as_deref()
            .map(str::trim)
            .filter(|expr| !expr.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Process {
    pub id: u64,
    pub name: String,
    pub executable_path: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub pid: u32,
    pub auto_restart: bool,
    #[serde(default)]
    pub cron_restart: Option<String>,
    #[serde(default)]
    pub next_start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scripts: Vec<String>,
    pub pid_file_path: PathBuf,
    pub log_file_path: PathBuf,
    pub err_file_path: PathBuf,
    #[serde(skip)]
    pub stop_requested: bool,
    #[serde(default)]
    pub log_file_rotation_count: u32,
    #[serde(default)]
    pub status: ProcStatus,
}

const IDLE_CPU: &str = "0.0%";
const IDLE_MEMORY: &str = "0.0MB";

impl Process {
    pub fn target_label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }

    pub fn is_online(&self) -> bool {
        self.status.status == ProcessStatus::Online
    }

    pub fn set_status(&mut self, status: ProcessStatus) {
        self.status.status = status;
    }

    pub fn reset_pid(&mut self) {
        self.pid = 0;
        self.status.parent_pid = 0;
    }

    pub fn update_uptime(&mut self) {
        let elapsed = Utc::now() - self.status.started_at;
        self.status.uptime_secs = elapsed.num_seconds().max(0) as u64;
    }

    pub fn init_started_at(&mut self) {
        self.status.started_at = Utc::now();
        self.status.uptime_secs = 0;
    }

    pub fn increase_restarts(&mut self) {
        self.status.restarts = self.status.restarts.saturating_add(1);
    }

    pub fn reset_cpu_memory(&mut self) {
        self.status.cpu = IDLE_CPU.to_string();
        self.status.memory = IDLE_MEMORY.to_string();
    }

    /// Samples CPU% and RSS for the current pid. Leaves the last sample in
    /// place when the pid is gone; the scheduler resets it on exit.
    pub fn update_cpu_memory(&mut self, system: &mut System) {
        if self.pid == 0 {
            return;
        }

        let pid = SysPid::from_u32(self.pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if let Some(info) = system.process(pid) {
            self.status.cpu = format!("{:.1}%", info.cpu_usage());
            self.status.memory = format!("{:.1}MB", info.memory() as f64 / (1024.0 * 1024.0));
        }
    }

    /// Recomputes `next_start_at` from `cron_restart`. A stored expression that
    /// no longer parses is cleared together with the schedule.
    pub fn update_next_start_at(&mut self) -> Result<(), OverseerError> {
        let Some(expr) = self.cron_restart.clone() else {
            self.next_start_at = None;
            return Ok(());
        };

        match cron::next_occurrence(&expr, Utc::now()) {
            Ok(next) => {
                self.next_start_at = Some(next);
                Ok(())
            }
            Err(err) => {
                self.cron_restart = None;
                self.next_start_at = None;
                Err(err)
            }
        }
    }

    /// Parameters needed to spawn this entity again.
    pub fn descriptor(&self) -> ProcessDescriptor {
        ProcessDescriptor {
            name: Some(self.name.clone()),
            executable_path: self.executable_path.clone(),
            args: self.args.clone(),
            cwd: Some(self.cwd.clone()),
            auto_restart: self.auto_restart,
            cron_restart: self.cron_restart.clone(),
            scripts: self.scripts.clone(),
            pid: None,
        }
    }

    pub fn is_cron_due(&self, now: DateTime<Utc>) -> bool {
        self.next_start_at.map(|next| next <= now).unwrap_or(false)
    }
}

fn default_auto_restart() -> bool {
    true
}
