//! Rebuild in-memory task state from the coordination store.
//!
//! Runs once before the scheduler reports ready. Every persisted task is
//! sorted into one of: launched (and queued for reconciliation), discarded
//! (never placed), killed (no longer configured) or stale (unreadable).
//! A launched task caught mid-restart keeps its replacement pending.

use flotilla_core::{ReconcileTask, TaskInstance};
use flotilla_state::CoordinationStore;
use tracing::{debug, info, warn};

use crate::engine::{Engine, PersistOp};
use crate::persist;
use crate::task_store::KillRequest;

/// What recovery did with the persisted tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub framework_id: Option<String>,
    pub restored: usize,
    pub discarded: usize,
    pub killed: usize,
    pub stale: usize,
}

/// Load persisted state into `engine`. A no-op without persistence.
pub async fn recover(store: &dyn CoordinationStore, engine: &mut Engine) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let Some(paths) = engine.paths().cloned() else {
        return report;
    };

    match store.get(&paths.framework_id()).await {
        Ok(data) => match String::from_utf8(data) {
            Ok(id) if !id.is_empty() => {
                info!(framework_id = %id, "recovered framework id");
                engine.restore_framework_id(id.clone());
                report.framework_id = Some(id);
            }
            _ => warn!("ignoring unreadable framework id"),
        },
        Err(e) if e.is_no_node() => debug!("no persisted framework id"),
        Err(e) => warn!(error = %e, "failed to read framework id"),
    }

    let ids = match store.list_children(&paths.tasks()).await {
        Ok(ids) => ids,
        Err(e) if e.is_no_node() => {
            debug!("no persisted tasks");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "failed to list persisted tasks, starting empty");
            Vec::new()
        }
    };

    for id in ids {
        let path = paths.task(&id);
        let record = match store.get(&path).await {
            Ok(data) => serde_json::from_slice::<TaskInstance>(&data)
                .map_err(|e| warn!(task_id = %id, error = %e, "unparseable task record")),
            Err(e) => {
                warn!(task_id = %id, error = %e, "unreadable task record");
                Err(())
            }
        };
        let Ok(mut record) = record else {
            report.stale += 1;
            persist::apply(store, PersistOp::Delete { path }).await;
            continue;
        };
        record.id = Some(id.clone());

        let configured = engine.tasks().pending().iter().any(|t| t.name == record.name);
        if !configured {
            info!(task_id = %id, task = %record.name, "persisted task no longer configured, queueing kill");
            engine.tasks_mut().queue_kill(KillRequest {
                task_id: id.clone(),
                agent_id: record.agent_id().map(str::to_string),
            });
            report.killed += 1;
            persist::apply(store, PersistOp::Delete { path }).await;
            continue;
        }

        let Some(agent_id) = record.agent_id().map(str::to_string) else {
            debug!(task_id = %id, task = %record.name, "persisted task was never placed, discarding");
            report.discarded += 1;
            persist::apply(store, PersistOp::Delete { path }).await;
            continue;
        };

        if record.restarting {
            // The configured instance stays pending as the replacement; the
            // old one is killed again in case the first KILL never landed.
            info!(task_id = %id, task = %record.name, agent = %agent_id, "restored task mid-restart");
            engine.tasks_mut().queue_kill(KillRequest {
                task_id: id.clone(),
                agent_id: Some(agent_id.clone()),
            });
        } else {
            engine.tasks_mut().take_pending_by_name(&record.name);
            info!(task_id = %id, task = %record.name, agent = %agent_id, "restored launched task");
        }
        engine.tasks_mut().queue_reconcile(ReconcileTask {
            task_id: id.clone().into(),
            agent_id: Some(agent_id.into()),
        });
        engine.tasks_mut().insert_launched(record);
        report.restored += 1;
    }

    info!(
        restored = report.restored,
        discarded = report.discarded,
        killed = report.killed,
        stale = report.stale,
        "recovery complete"
    );
    report
}
