//! Health monitor: one background task probing every launched task.
//!
//! Each tick takes a snapshot of the launched tasks from the scheduler,
//! probes the ones that are due and reports tasks that just crossed the
//! unhealthy threshold. Trackers of tasks that are no longer launched are
//! dropped, so a restarted instance starts from a clean slate.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flotilla_core::config::HealthConfig;
use flotilla_core::{TaskInstance, TaskState};
use flotilla_scheduler::{SchedulerError, SchedulerHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checker::{TaskHealth, Verdict, http_probe};

/// Where and how to probe one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub task_id: String,
    /// `host:PORT0`.
    pub address: String,
    pub path: String,
    /// Epoch millis before which failures are not counted.
    pub grace_until: u64,
}

/// The probe target of a running task with a health check and at least
/// one allocated port.
pub fn probe_target(task: &TaskInstance) -> Option<ProbeTarget> {
    let health_check = task.spec.health_check.as_ref()?;
    let task_id = task.id.as_ref()?;
    let runtime = task.runtime_info.as_ref()?;
    if runtime.state != TaskState::Running {
        return None;
    }
    let port = runtime.network.ports.first()?;
    let host = runtime
        .network
        .ip
        .as_deref()
        .unwrap_or(&runtime.network.hostname);
    if host.is_empty() {
        return None;
    }
    let grace_ms = (health_check.grace_period_secs.max(0.0) * 1000.0) as u64;
    Some(ProbeTarget {
        task_id: task_id.clone(),
        address: format!("{host}:{port}"),
        path: health_check.path.clone(),
        grace_until: runtime.start_time.saturating_add(grace_ms),
    })
}

/// Probe bookkeeping across ticks.
pub(crate) struct Checks {
    config: HealthConfig,
    tasks: HashMap<String, TaskHealth>,
}

impl Checks {
    pub(crate) fn new(config: HealthConfig) -> Self {
        Self {
            config,
            tasks: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.tasks.len()
    }

    /// Probe every due task in `launched`; returns the ids of tasks that
    /// turned unhealthy on this sweep.
    pub(crate) async fn sweep(
        &mut self,
        launched: &[TaskInstance],
        now: Instant,
        now_millis: u64,
    ) -> Vec<String> {
        let targets: Vec<ProbeTarget> = launched.iter().filter_map(probe_target).collect();
        self.tasks
            .retain(|id, _| targets.iter().any(|t| &t.task_id == id));

        let mut unhealthy = Vec::new();
        for target in targets {
            let health = self
                .tasks
                .entry(target.task_id.clone())
                .or_insert_with(|| TaskHealth::new(&self.config, target.grace_until));
            if !health.is_due(now, now_millis) {
                continue;
            }

            let result = http_probe(&target.address, &target.path, self.config.timeout).await;
            let verdict = health.observe(result, now);
            debug!(
                task_id = %target.task_id,
                address = %target.address,
                ?result,
                ?verdict,
                "health probe"
            );
            if verdict == Verdict::Unhealthy {
                warn!(
                    task_id = %target.task_id,
                    failures = health.failures(),
                    restart = self.config.restart_unhealthy,
                    "task failed its health check"
                );
                unhealthy.push(target.task_id);
            }
        }
        unhealthy
    }
}

/// Polls launched tasks and reports unhealthy ones to the scheduler.
pub struct HealthMonitor {
    handle: SchedulerHandle,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(handle: SchedulerHandle, config: HealthConfig) -> Self {
        Self { handle, config }
    }

    /// Start the polling task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_health_loop(self.handle, self.config, shutdown_rx));
        MonitorHandle { shutdown_tx, join }
    }
}

/// Controls a running [`HealthMonitor`].
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signal shutdown and wait for the loop to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "health monitor task failed");
        }
    }
}

async fn run_health_loop(
    handle: SchedulerHandle,
    config: HealthConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    // The tick bounds how quickly a task is first probed; per-task backoff
    // decides whether it is due.
    let tick = config.interval.min(Duration::from_secs(1)).max(Duration::from_millis(10));
    let mut checks = Checks::new(config);
    info!("health monitor started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown.changed() => break,
        }

        let launched = match handle.launched_tasks().await {
            Ok(tasks) => tasks,
            Err(SchedulerError::Stopped) => {
                debug!("scheduler stopped, health monitor exiting");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to list launched tasks");
                continue;
            }
        };

        for task_id in checks.sweep(&launched, Instant::now(), epoch_millis()).await {
            match handle.report_unhealthy(&task_id).await {
                Ok(()) => {}
                Err(SchedulerError::UnknownTask(_)) => {
                    debug!(%task_id, "unhealthy task already gone");
                }
                Err(e) => warn!(%task_id, error = %e, "failed to report unhealthy task"),
            }
        }
    }
    info!("health monitor stopped");
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
