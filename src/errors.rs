use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverseerError {
    #[error("invalid process descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to spawn {name}: {reason}")]
    SpawnFailed { name: String, reason: String },
    #[error("process {name} (pid {pid}) exited before it could be registered")]
    SpawnVerificationFailed { name: String, pid: u32 },
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCronExpression { expr: String, reason: String },
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    #[error("failed to stop pid {pid}: {reason}")]
    StopFailed { pid: u32, reason: String },
    #[error("daemon is already running")]
    DaemonAlreadyRunning,
}
