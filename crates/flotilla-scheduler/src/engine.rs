//! The scheduler's state machine, free of I/O.
//!
//! `Engine` owns the task store and the session. Event handlers and
//! facade operations mutate it and queue [`Command`]s (calls to issue,
//! records to persist, notifications to emit) which the event loop
//! executes after each step. Everything here runs on the event loop, so
//! nothing is locked.

use std::time::{SystemTime, UNIX_EPOCH};

use flotilla_core::{
    Call, ErrorEvent, EventType, Failure, Filters, Id, Offer, Offers, ReconcileTask, Rescind,
    SchedulerConfig, TaskInstance, Update, call,
};
use flotilla_placement::{MatchOptions, plan_offer};
use flotilla_state::FrameworkPaths;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::notification::Notification;
use crate::task_store::TaskStore;

/// A write or delete against the coordination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    Write { path: String, data: Vec<u8> },
    Delete { path: String },
}

/// Side effect queued by the engine.
#[derive(Debug, Clone)]
pub enum Command {
    Call(Call),
    Persist(PersistOp),
    Notify(Notification),
}

pub struct Engine {
    config: SchedulerConfig,
    tasks: TaskStore,
    framework_id: Option<String>,
    stream_id: Option<String>,
    /// Set when persistence is enabled.
    paths: Option<FrameworkPaths>,
    match_opts: MatchOptions,
    outbox: Vec<Command>,
}

impl Engine {
    /// Build the engine with every configured task instance pending.
    pub fn new(config: SchedulerConfig) -> Self {
        let mut tasks = TaskStore::new();
        for spec in &config.tasks {
            for instance in TaskInstance::expand(spec, config.scheduler.serial_numbered_tasks) {
                tasks.enqueue(instance);
            }
        }
        let paths = config
            .persistence
            .enabled
            .then(|| FrameworkPaths::new(&config.persistence.prefix, &config.framework.name));
        let match_opts = MatchOptions {
            framework_name: config.framework.name.clone(),
            static_ports: config.scheduler.static_ports,
            serial_numbered: config.scheduler.serial_numbered_tasks,
        };
        Self {
            config,
            tasks,
            framework_id: None,
            stream_id: None,
            paths,
            match_opts,
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut SchedulerConfig {
        &mut self.config
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskStore {
        &mut self.tasks
    }

    pub fn paths(&self) -> Option<&FrameworkPaths> {
        self.paths.as_ref()
    }

    pub fn framework_id(&self) -> Option<&str> {
        self.framework_id.as_deref()
    }

    /// Record the framework id, persisting it when it changes.
    pub fn set_framework_id(&mut self, id: &str) {
        if self.framework_id.as_deref() == Some(id) {
            return;
        }
        info!(framework_id = %id, "framework id assigned");
        self.framework_id = Some(id.to_string());
        if let Some(paths) = &self.paths {
            let op = PersistOp::Write {
                path: paths.framework_id(),
                data: id.as_bytes().to_vec(),
            };
            self.outbox.push(Command::Persist(op));
        }
    }

    /// Restore a framework id read back from the store, without writing it.
    pub(crate) fn restore_framework_id(&mut self, id: String) {
        self.framework_id = Some(id);
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn set_stream_id(&mut self, id: Option<String>) {
        self.stream_id = id;
    }

    // ── Outbox ─────────────────────────────────────────────────────

    pub fn call(&mut self, call: Call) {
        debug!(call = %call.kind, "call queued");
        self.outbox.push(Command::Call(call));
    }

    pub fn notify(&mut self, notification: Notification) {
        self.outbox.push(Command::Notify(notification));
    }

    /// Mirror a task to the store (no-op without persistence).
    pub fn persist_task(&mut self, task: &TaskInstance) {
        let (Some(paths), Some(id)) = (&self.paths, &task.id) else {
            return;
        };
        match serde_json::to_vec(task) {
            Ok(data) => {
                let path = paths.task(id);
                self.outbox.push(Command::Persist(PersistOp::Write { path, data }));
            }
            Err(e) => warn!(task_id = %id, error = %e, "failed to serialize task, not persisted"),
        }
    }

    /// Drop a task's persisted record (no-op without persistence).
    pub fn delete_task_record(&mut self, task_id: &str) {
        if let Some(paths) = &self.paths {
            let path = paths.task(task_id);
            self.outbox.push(Command::Persist(PersistOp::Delete { path }));
        }
    }

    /// Everything queued since the last call.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn filters(&self) -> Filters {
        Filters {
            refuse_seconds: self.config.scheduler.refuse_seconds,
        }
    }

    // ── Built-in event handlers ────────────────────────────────────

    /// Default handling for each event type.
    pub fn handle_event(&mut self, kind: EventType, payload: &Value) {
        match kind {
            EventType::Subscribed => {
                info!(framework_id = ?self.framework_id, "subscribed");
            }
            EventType::Offers => {
                if let Some(offers) = self.decode::<Offers>(kind, payload) {
                    self.handle_offers(offers.offers);
                }
            }
            EventType::Rescind => {
                if let Some(rescind) = self.decode::<Rescind>(kind, payload) {
                    debug!(offer = %rescind.offer_id, "offer rescinded");
                }
            }
            EventType::Update => {
                if let Some(update) = self.decode::<Update>(kind, payload) {
                    self.handle_update(update.status);
                }
            }
            EventType::Message => {
                debug!("framework message received");
            }
            EventType::Failure => {
                if let Some(failure) = self.decode::<Failure>(kind, payload) {
                    warn!(
                        agent = ?failure.agent_id.map(|id| id.value),
                        executor = ?failure.executor_id.map(|id| id.value),
                        status = ?failure.status,
                        "agent or executor failure"
                    );
                }
            }
            EventType::Error => {
                if let Some(event) = self.decode::<ErrorEvent>(kind, payload) {
                    error!(message = %event.message, "master reported an error");
                }
            }
            EventType::Heartbeat => {
                debug!("heartbeat");
            }
            other => {
                debug!(event = %other, "event ignored");
            }
        }
    }

    fn decode<T: DeserializeOwned>(&mut self, kind: EventType, payload: &Value) -> Option<T> {
        match serde_json::from_value(payload.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(event = %kind, error = %e, "malformed event payload");
                self.notify(Notification::Error(SchedulerError::Protocol(format!(
                    "malformed {kind} payload: {e}"
                ))));
                None
            }
        }
    }

    // ── Offers ─────────────────────────────────────────────────────

    /// Match pending tasks against each offer; one ACCEPT per offer that
    /// launches anything, one DECLINE per offer that does not.
    pub fn handle_offers(&mut self, offers: Vec<Offer>) {
        for offer in offers {
            if !self.tasks.has_pending() {
                debug!(offer = %offer.id, "nothing pending, declining offer");
                self.call(Call::decline(vec![offer.id], Some(self.filters())));
                continue;
            }

            let plan = plan_offer(&offer, self.tasks.pending(), &self.match_opts, epoch_millis());
            if plan.is_empty() {
                debug!(offer = %offer.id, pending = self.tasks.pending().len(), "no pending task fits, declining offer");
                self.call(Call::decline(vec![offer.id], Some(self.filters())));
                continue;
            }

            let task_infos = plan.task_infos();
            let indices: Vec<usize> = plan.launches.iter().map(|l| l.pending_index).collect();
            self.tasks.take_pending(&indices);
            for launch in plan.launches {
                info!(
                    task = %launch.task.name,
                    task_id = ?launch.task.id,
                    agent = %offer.agent_id,
                    ports = ?launch.allocation.ports,
                    "launching task"
                );
                self.persist_task(&launch.task);
                self.tasks.insert_launched(launch.task);
            }
            self.call(Call::accept(
                vec![offer.id],
                vec![call::launch(task_infos)],
                Some(self.filters()),
            ));
        }
    }

    // ── Recovery work lists ────────────────────────────────────────

    /// Issue one KILL per queued kill and one RECONCILE per queued task,
    /// then clear both queues.
    pub fn sync(&mut self) {
        let kills = self.tasks.drain_kills();
        let reconciles = self.tasks.drain_reconciles();
        info!(kills = kills.len(), reconciles = reconciles.len(), "syncing recovered tasks");
        for kill in kills {
            self.call(Call::kill(
                Id::new(kill.task_id),
                kill.agent_id.map(Id::new),
            ));
        }
        for task in reconciles {
            self.call(Call::reconcile(vec![task]));
        }
    }

    /// Ask the master for the state of every launched task.
    pub fn reconcile_launched(&mut self) {
        let tasks: Vec<ReconcileTask> = self
            .tasks
            .launched_tasks()
            .filter_map(|t| {
                Some(ReconcileTask {
                    task_id: Id::new(t.id.clone()?),
                    agent_id: t.agent_id().map(Id::new),
                })
            })
            .collect();
        self.call(Call::reconcile(tasks));
    }
}

/// Unix epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use flotilla_core::{CallType, CommandInfo, Range, Resource, ResourceDemand, TaskSpec};
    use serde_json::json;

    use super::*;

    pub(crate) fn spec(name: &str, instances: u32) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            priority: 1,
            instances,
            resources: ResourceDemand {
                cpus: 0.2,
                mem: 128.0,
                disk: 10.0,
                ports: 1,
                static_ports: Default::default(),
            },
            command: Some(CommandInfo {
                value: Some("./serve".to_string()),
                ..CommandInfo::default()
            }),
            container: None,
            executor: None,
            health_check: None,
            labels: None,
            allow_scaling: true,
        }
    }

    pub(crate) fn config(tasks: Vec<TaskSpec>, persistence: bool) -> SchedulerConfig {
        let mut config = SchedulerConfig::from_toml_str("[framework]\nname = \"fw\"\n").unwrap();
        config.tasks = tasks;
        config.persistence.enabled = persistence;
        config.scheduler.serial_numbered_tasks = true;
        config
    }

    pub(crate) fn offer(id: &str) -> Offer {
        Offer {
            id: id.into(),
            framework_id: None,
            agent_id: "agent-1".into(),
            hostname: "node-1".to_string(),
            url: None,
            resources: vec![
                Resource::scalar("cpus", 1.1),
                Resource::scalar("mem", 256.0),
                Resource::scalar("disk", 100.0),
                Resource::ranges("ports", vec![Range::new(8080, 8090)]),
            ],
        }
    }

    pub(crate) fn calls(commands: &[Command]) -> Vec<&Call> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Call(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn persists(commands: &[Command]) -> Vec<&PersistOp> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Persist(op) => Some(op),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn expands_configured_tasks() {
        let engine = Engine::new(config(vec![spec("web", 2), spec("db", 1)], false));
        let names: Vec<_> = engine.tasks().pending().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["web-1", "web-2", "db-1"]);
    }

    #[test]
    fn offer_with_nothing_pending_is_declined() {
        let mut engine = Engine::new(config(vec![], false));
        engine.handle_offers(vec![offer("o1")]);
        let commands = engine.take_commands();
        let calls = calls(&commands);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallType::Decline);
        assert_eq!(calls[0].body.as_ref().unwrap()["offer_ids"][0]["value"], "o1");
        assert_eq!(calls[0].body.as_ref().unwrap()["filters"]["refuse_seconds"], 5.0);
    }

    #[test]
    fn matching_offer_is_accepted() {
        let mut engine = Engine::new(config(vec![spec("web", 1)], true));
        engine.handle_offers(vec![offer("o1")]);

        let commands = engine.take_commands();
        let calls = calls(&commands);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallType::Accept);
        let body = calls[0].body.as_ref().unwrap();
        let infos = body["operations"][0]["launch"]["task_infos"].as_array().unwrap();
        assert_eq!(infos.len(), 1);
        let port = infos[0]["resources"][3]["ranges"]["range"][0]["begin"].as_u64().unwrap();
        assert!((8080..=8090).contains(&port));

        assert!(!engine.tasks().has_pending());
        let launched: Vec<_> = engine.tasks().launched_tasks().collect();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].agent_id(), Some("agent-1"));

        let persists = persists(&commands);
        assert_eq!(persists.len(), 1);
        match persists[0] {
            PersistOp::Write { path, .. } => {
                assert!(path.starts_with("/dcos-service-fw/tasks/fw.web-1."))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unmatched_offer_declined_once() {
        let mut big = spec("big", 1);
        big.resources.cpus = 8.0;
        let mut engine = Engine::new(config(vec![big], false));
        engine.handle_offers(vec![offer("o1"), offer("o2")]);
        let commands = engine.take_commands();
        let kinds: Vec<_> = calls(&commands).iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallType::Decline, CallType::Decline]);
        assert!(engine.tasks().has_pending());
    }

    #[test]
    fn second_offer_declined_after_first_takes_all() {
        let mut engine = Engine::new(config(vec![spec("web", 1)], false));
        engine.handle_offers(vec![offer("o1"), offer("o2")]);
        let commands = engine.take_commands();
        let kinds: Vec<_> = calls(&commands).iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CallType::Accept, CallType::Decline]);
    }

    #[test]
    fn malformed_payload_notifies_error() {
        let mut engine = Engine::new(config(vec![], false));
        engine.handle_event(EventType::Offers, &json!({ "offers": "nope" }));
        let commands = engine.take_commands();
        assert!(matches!(
            commands.as_slice(),
            [Command::Notify(Notification::Error(SchedulerError::Protocol(_)))]
        ));
    }

    #[test]
    fn framework_id_persisted_once() {
        let mut engine = Engine::new(config(vec![], true));
        engine.set_framework_id("fw-1");
        engine.set_framework_id("fw-1");
        let commands = engine.take_commands();
        assert_eq!(
            persists(&commands),
            vec![&PersistOp::Write {
                path: "/dcos-service-fw/framework-id".to_string(),
                data: b"fw-1".to_vec(),
            }]
        );
        assert_eq!(engine.framework_id(), Some("fw-1"));
    }

    #[test]
    fn no_persistence_no_persist_commands() {
        let mut engine = Engine::new(config(vec![spec("web", 1)], false));
        engine.set_framework_id("fw-1");
        engine.handle_offers(vec![offer("o1")]);
        assert!(persists(&engine.take_commands()).is_empty());
    }

    #[test]
    fn reconcile_launched_lists_tasks() {
        let mut engine = Engine::new(config(vec![spec("web", 2)], false));
        engine.handle_offers(vec![offer("o1")]);
        engine.take_commands();
        engine.reconcile_launched();
        let commands = engine.take_commands();
        let calls = calls(&commands);
        assert_eq!(calls[0].kind, CallType::Reconcile);
        assert_eq!(
            calls[0].body.as_ref().unwrap()["tasks"].as_array().unwrap().len(),
            2
        );
    }
}
