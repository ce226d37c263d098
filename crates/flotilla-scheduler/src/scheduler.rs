//! Public entry point: build, recover, run.

use std::sync::Arc;

use flotilla_core::{
    Call, EventType, Filters, Id, ReconcileTask, SchedulerConfig, TaskInstance,
};
use flotilla_state::CoordinationStore;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::{Control, EventLoop};
use crate::dispatcher::HandlerTable;
use crate::engine::Engine;
use crate::error::{SchedulerError, SchedulerResult};
use crate::notification::Notification;
use crate::persist;
use crate::recovery::{RecoveryReport, recover};
use crate::transport::Endpoint;

/// Configures and starts a [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn CoordinationStore>>,
    handlers: HandlerTable,
    master: Option<Endpoint>,
}

impl SchedulerBuilder {
    /// Coordination store; required when persistence is enabled.
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Subscribe to this master instead of the configured one.
    pub fn master(mut self, endpoint: Endpoint) -> Self {
        self.master = Some(endpoint);
        self
    }

    /// Replace the built-in handling of one event type.
    pub fn handler(
        mut self,
        kind: EventType,
        handler: impl FnMut(&mut Engine, &Value) + Send + 'static,
    ) -> SchedulerResult<Self> {
        self.handlers.register(kind, handler)?;
        Ok(self)
    }

    /// Recover persisted state, start the event loop and report ready.
    ///
    /// The returned scheduler has not subscribed yet; call
    /// [`SchedulerHandle::subscribe`].
    pub async fn start(self) -> SchedulerResult<Scheduler> {
        let Self {
            config,
            store,
            handlers,
            master,
        } = self;
        config
            .validate()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;

        let endpoint = master.unwrap_or_else(|| {
            Endpoint::new(config.master.host.clone(), config.master.port)
        });
        let persistence = config.persistence.enabled;
        let mut engine = Engine::new(config);

        let (recovery, persist_tx) = match (persistence, store) {
            (true, Some(store)) => {
                let report = recover(store.as_ref(), &mut engine).await;
                let (tx, _worker) = persist::spawn(store);
                (report, Some(tx))
            }
            (true, None) => {
                return Err(SchedulerError::Config(
                    "persistence is enabled but no store was given".to_string(),
                ));
            }
            (false, _) => (RecoveryReport::default(), None),
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let _ = notify_tx.send(Notification::Ready);

        info!(
            framework = %engine.config().framework.name,
            pending = engine.tasks().pending().len(),
            launched = engine.tasks().launched_len(),
            "scheduler ready"
        );
        let event_loop = EventLoop::new(engine, handlers, endpoint, control_rx, notify_tx, persist_tx);
        let task = tokio::spawn(event_loop.run());

        Ok(Scheduler {
            handle: SchedulerHandle { tx: control_tx },
            notifications: notify_rx,
            task,
            recovery,
        })
    }
}

/// A running scheduler.
pub struct Scheduler {
    handle: SchedulerHandle,
    notifications: mpsc::UnboundedReceiver<Notification>,
    task: JoinHandle<SchedulerResult<()>>,
    recovery: RecoveryReport,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            store: None,
            handlers: HandlerTable::new(),
            master: None,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// What startup recovery found.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Next notification; `None` once the event loop has ended.
    pub async fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Split into the handle, the notification stream and the loop's
    /// join handle.
    pub fn into_parts(
        self,
    ) -> (
        SchedulerHandle,
        mpsc::UnboundedReceiver<Notification>,
        JoinHandle<SchedulerResult<()>>,
    ) {
        (self.handle, self.notifications, self.task)
    }
}

/// Cloneable handle to a running scheduler. Calls are queued on the event
/// loop; their outcome arrives as a notification.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SchedulerHandle {
    fn send(&self, control: Control) -> SchedulerResult<()> {
        self.tx.send(control).map_err(|_| SchedulerError::Stopped)
    }

    async fn ask<T>(&self, control: impl FnOnce(oneshot::Sender<T>) -> Control) -> SchedulerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(control(reply))?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Open (or reopen) the subscription.
    pub fn subscribe(&self) -> SchedulerResult<()> {
        self.send(Control::Subscribe)
    }

    /// Send any call.
    pub fn call(&self, call: Call) -> SchedulerResult<()> {
        self.send(Control::Call(call))
    }

    pub fn teardown(&self) -> SchedulerResult<()> {
        self.call(Call::teardown())
    }

    pub fn accept(
        &self,
        offer_ids: Vec<Id>,
        operations: Vec<Value>,
        filters: Option<Filters>,
    ) -> SchedulerResult<()> {
        self.call(Call::accept(offer_ids, operations, filters))
    }

    pub fn decline(&self, offer_ids: Vec<Id>, filters: Option<Filters>) -> SchedulerResult<()> {
        self.call(Call::decline(offer_ids, filters))
    }

    pub fn revive(&self) -> SchedulerResult<()> {
        self.call(Call::revive())
    }

    pub fn kill(&self, task_id: &str, agent_id: Option<&str>) -> SchedulerResult<()> {
        self.call(Call::kill(Id::new(task_id), agent_id.map(Id::new)))
    }

    pub fn shutdown(&self, executor_id: &str, agent_id: &str) -> SchedulerResult<()> {
        self.call(Call::shutdown(Id::new(executor_id), Id::new(agent_id)))
    }

    pub fn acknowledge(&self, agent_id: &str, task_id: &str, uuid: &str) -> SchedulerResult<()> {
        self.call(Call::acknowledge(
            Id::new(agent_id),
            Id::new(task_id),
            uuid.to_string(),
        ))
    }

    /// An empty list asks for every task the master knows of.
    pub fn reconcile(&self, tasks: Vec<ReconcileTask>) -> SchedulerResult<()> {
        self.call(Call::reconcile(tasks))
    }

    pub fn message(&self, agent_id: &str, executor_id: &str, data: &[u8]) -> SchedulerResult<()> {
        self.call(Call::message(Id::new(agent_id), Id::new(executor_id), data))
    }

    pub fn request(&self, requests: Vec<Value>) -> SchedulerResult<()> {
        self.call(Call::request(requests))
    }

    /// Issue the KILLs and RECONCILEs queued by recovery.
    pub fn sync(&self) -> SchedulerResult<()> {
        self.send(Control::Sync)
    }

    pub async fn scale(&self, name: &str, instances: u32) -> SchedulerResult<()> {
        let name = name.to_string();
        self.ask(|reply| Control::Scale {
            name,
            instances,
            reply,
        })
        .await?
    }

    pub async fn restart(&self, task_id: &str) -> SchedulerResult<()> {
        let task_id = task_id.to_string();
        self.ask(|reply| Control::Restart { task_id, reply }).await?
    }

    /// Called by the health checker when a task fails its probes.
    pub async fn report_unhealthy(&self, task_id: &str) -> SchedulerResult<()> {
        let task_id = task_id.to_string();
        self.ask(|reply| Control::ReportUnhealthy { task_id, reply })
            .await?
    }

    pub async fn launched_tasks(&self) -> SchedulerResult<Vec<TaskInstance>> {
        self.ask(Control::LaunchedTasks).await
    }

    pub async fn pending_tasks(&self) -> SchedulerResult<Vec<TaskInstance>> {
        self.ask(Control::PendingTasks).await
    }

    /// Stop the event loop. Outstanding calls are not cancelled.
    pub fn stop(&self) -> SchedulerResult<()> {
        self.send(Control::Stop)
    }
}
