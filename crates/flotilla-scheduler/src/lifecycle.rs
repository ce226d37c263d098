//! Task lifecycle: status updates, restarts and scaling.

use flotilla_core::{Call, Id, RuntimeInfo, TaskInstance, TaskState, TaskStatus};
use tracing::{debug, info, warn};

use crate::engine::{Engine, epoch_millis};
use crate::error::{SchedulerError, SchedulerResult};
use crate::notification::Notification;

impl Engine {
    /// Apply one UPDATE and acknowledge it.
    pub fn handle_update(&mut self, status: TaskStatus) {
        let task_id = status.task_id.value.clone();
        debug!(%task_id, state = %status.state, reason = ?status.reason, "status update");

        if self.tasks().launched(&task_id).is_some() {
            self.apply_update(&task_id, &status);
        } else if status.is_reconciliation() {
            self.reconcile_unknown(&task_id, &status);
        } else {
            debug!(%task_id, "update for untracked task");
        }

        self.acknowledge(&status);
    }

    fn apply_update(&mut self, task_id: &str, status: &TaskStatus) {
        let state = status.state;
        let restartable = self.config().scheduler.restart_states.contains(&state);

        if restartable || state.is_terminal() {
            let Some(task) = self.tasks_mut().remove_launched(task_id) else {
                return;
            };
            self.delete_task_record(task_id);
            if restartable && !task.is_winding_down() {
                info!(%task_id, task = %task.name, %state, "task ended, queueing restart");
                self.tasks_mut().enqueue(task.stripped());
            } else {
                info!(%task_id, task = %task.name, %state, "task ended");
            }
            return;
        }

        let Some(task) = self.tasks_mut().launched_mut(task_id) else {
            return;
        };
        let previous = task.state();
        let agent_id = status.agent_id.as_ref().map(|id| id.value.clone());
        let executor_id = status.executor_id.as_ref().map(|id| id.value.clone());
        match task.runtime_info.as_mut() {
            Some(info) => {
                info.state = state;
                if let Some(agent_id) = agent_id.filter(|id| !id.is_empty()) {
                    info.agent_id = agent_id;
                }
                if executor_id.is_some() {
                    info.executor_id = executor_id;
                }
            }
            None => {
                task.runtime_info = Some(RuntimeInfo {
                    agent_id: agent_id.unwrap_or_default(),
                    executor_id,
                    state,
                    start_time: epoch_millis(),
                    network: Default::default(),
                });
            }
        }
        let snapshot = task.clone();

        self.persist_task(&snapshot);
        if state == TaskState::Running && previous != Some(TaskState::Running) {
            info!(%task_id, task = %snapshot.name, "task running");
            self.notify(Notification::TaskLaunched(Box::new(snapshot)));
        }
    }

    fn reconcile_unknown(&mut self, task_id: &str, status: &TaskStatus) {
        if status.state == TaskState::Running {
            if self.config().scheduler.kill_unknown_tasks {
                warn!(%task_id, "unknown task running, killing it");
                self.call(Call::kill(status.task_id.clone(), status.agent_id.clone()));
            } else {
                debug!(%task_id, "unknown task running, left alone");
            }
        } else if self.paths().is_some() {
            debug!(%task_id, state = %status.state, "dropping stale record for unknown task");
            self.delete_task_record(task_id);
        }
    }

    fn acknowledge(&mut self, status: &TaskStatus) {
        let Some(uuid) = status.uuid.clone() else {
            debug!(task_id = %status.task_id, "update carries no uuid, not acknowledged");
            return;
        };
        let Some(agent_id) = status.agent_id.clone() else {
            warn!(task_id = %status.task_id, "update has a uuid but no agent id, not acknowledged");
            return;
        };
        self.call(Call::acknowledge(agent_id, status.task_id.clone(), uuid));
    }

    // ── Operator actions ───────────────────────────────────────────

    /// Replace a launched task: queue a fresh copy and kill the old one.
    pub fn restart(&mut self, task_id: &str) -> SchedulerResult<()> {
        let task = self
            .tasks_mut()
            .launched_mut(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
        if task.is_winding_down() {
            debug!(%task_id, "kill already in progress");
            return Ok(());
        }
        task.restarting = true;
        let snapshot = task.clone();

        info!(%task_id, task = %snapshot.name, "restarting task");
        self.tasks_mut().enqueue(snapshot.stripped());
        self.persist_task(&snapshot);
        self.kill_launched(&snapshot);
        Ok(())
    }

    /// Set the instance count of a scalable task.
    pub fn scale(&mut self, name: &str, instances: u32) -> SchedulerResult<()> {
        let serial_numbered = self.config().scheduler.serial_numbered_tasks;
        let spec = self
            .config_mut()
            .tasks
            .iter_mut()
            .find(|spec| spec.name == name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;
        if !spec.allow_scaling {
            return Err(SchedulerError::Config(format!(
                "task {name} does not allow scaling"
            )));
        }
        spec.instances = instances;
        let spec = spec.clone();

        let current = self.tasks().instances_of(name) as u32;
        info!(task = %name, from = current, to = instances, "scaling task");

        if instances > current {
            for _ in current..instances {
                let serial = serial_numbered.then(|| self.tasks().max_serial_of(name) + 1);
                self.tasks_mut().enqueue(TaskInstance::from_spec(&spec, serial));
            }
            return Ok(());
        }

        let mut surplus = current - instances;
        while surplus > 0 && self.tasks_mut().take_last_pending_of(name).is_some() {
            surplus -= 1;
        }
        if surplus == 0 {
            return Ok(());
        }

        let mut victims: Vec<TaskInstance> = self
            .tasks()
            .launched_tasks()
            .filter(|t| t.spec.name == name && !t.is_winding_down())
            .cloned()
            .collect();
        victims.sort_by(|a, b| b.serial.cmp(&a.serial));
        for victim in victims.into_iter().take(surplus as usize) {
            let Some(id) = victim.id.clone() else {
                continue;
            };
            if let Some(task) = self.tasks_mut().launched_mut(&id) {
                task.retiring = true;
            }
            let mut marked = victim;
            marked.retiring = true;
            self.persist_task(&marked);
            self.kill_launched(&marked);
        }
        Ok(())
    }

    /// Surface a failing health check, restarting the task when configured to.
    pub fn report_unhealthy(&mut self, task_id: &str) -> SchedulerResult<()> {
        let name = self
            .tasks()
            .launched(task_id)
            .map(|t| t.name.clone())
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;
        warn!(%task_id, task = %name, "task unhealthy");
        self.notify(Notification::TaskUnhealthy {
            task_id: task_id.to_string(),
            name,
        });
        if self.config().health.restart_unhealthy {
            self.restart(task_id)?;
        }
        Ok(())
    }

    fn kill_launched(&mut self, task: &TaskInstance) {
        if let Some(id) = &task.id {
            self.call(Call::kill(
                Id::new(id.clone()),
                task.agent_id().map(Id::new),
            ));
        }
    }
}
