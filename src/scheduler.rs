//! Reconciliation loop. Each tick fans out one task per tracked entity, waits
//! for all of them, then sleeps for the tick interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::LogRotateSettings;
use crate::process::ProcessDescriptor;
use crate::registry::{Reconcile, Registry, RestartTrigger, STOP_GRACE};
use crate::spawner::{terminate_owned, Spawner};

#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<Registry>,
    spawner: Spawner,
    tick_interval: Duration,
    rotation: LogRotateSettings,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        spawner: Spawner,
        tick_interval: Duration,
        rotation: LogRotateSettings,
    ) -> Self {
        Self {
            registry,
            spawner,
            tick_interval,
            rotation,
        }
    }

    /// Runs for the daemon's lifetime.
    pub async fn run(self) {
        debug!(
            "scheduler started (tick {:?}, log rotation {})",
            self.tick_interval,
            if self.rotation.enabled { "on" } else { "off" }
        );
        loop {
            self.tick().await;
            sleep(self.tick_interval).await;
        }
    }

    pub async fn tick(&self) {
        let ids = self.registry.ids().await;
        if ids.is_empty() {
            return;
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        for id in ids {
            let registry = Arc::clone(&self.registry);
            let spawner = self.spawner.clone();
            let rotation = self.rotation;
            tasks.spawn(async move {
                reconcile_entity(&registry, &spawner, &rotation, id).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("scheduler task for one entity aborted: {err}");
            }
        }
    }
}

async fn reconcile_entity(
    registry: &Registry,
    spawner: &Spawner,
    rotation: &LogRotateSettings,
    id: u64,
) {
    if let Reconcile::Restart {
        descriptor,
        trigger,
    } = registry.reconcile(id, Utc::now()).await
    {
        restart_entity(registry, spawner, id, &descriptor, trigger).await;
    }

    if rotation.enabled {
        if let Err(err) = registry.rotate_logs(id, rotation).await {
            error!("log rotation failed for process {id}: {err:#}");
        }
    }
}

async fn restart_entity(
    registry: &Registry,
    spawner: &Spawner,
    id: u64,
    descriptor: &ProcessDescriptor,
    trigger: RestartTrigger,
) {
    match spawner.spawn(descriptor) {
        Ok(spawned) => {
            if let Some(orphan) = registry.finish_restart(id, trigger, spawned).await {
                warn!(
                    "restart of process {id} was cancelled; terminating pid {}",
                    orphan.pid()
                );
                if let Err(err) = terminate_owned(orphan.pid(), STOP_GRACE).await {
                    error!("failed to terminate cancelled restart pid {}: {err}", orphan.pid());
                }
            }
        }
        Err(err) => registry.fail_restart(id, &err).await,
    }
}
