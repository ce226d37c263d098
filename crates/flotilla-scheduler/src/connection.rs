//! The scheduler's event loop.
//!
//! One task owns the [`Engine`], the subscription stream and the
//! reconnect timers. Control messages from handles, frames from the
//! master and timer expiries are multiplexed with `select!`; after each of
//! them the engine's queued commands are executed before anything else
//! is read.
//!
//! ```text
//!   Idle ──subscribe──▶ Streaming ──end/error──▶ Waiting(deadline)
//!    ▲                     │  ▲                        │
//!    │  rejected /         │  └──────subscribe─────────┘
//!    └─ missing token      └─idle timeout─▶ probe ─▶ subscribe | LeaderLost
//! ```
//!
//! A caller's subscribe that cannot reach the master also falls back to
//! `Idle`; a reconnect that cannot reach it waits in `Waiting` again.

use std::time::Duration;

use bytes::Bytes;
use flotilla_core::{Call, CallType, EventType, TaskInstance};
use http_body_util::BodyExt;
use hyper::body::{Frame, Incoming};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::dispatcher::{HandlerTable, dispatch};
use crate::engine::{Command, Engine};
use crate::error::{SchedulerError, SchedulerResult};
use crate::notification::Notification;
use crate::persist::PersistSender;
use crate::recordio::{DEFAULT_MAX_RECORD, RecordIoDecoder};
use crate::transport::{self, Endpoint, SubscribeOutcome};

/// Redirects followed by one subscribe attempt before giving up.
const MAX_REDIRECTS: usize = 10;

/// Requests from [`SchedulerHandle`](crate::SchedulerHandle)s.
pub(crate) enum Control {
    Subscribe,
    Call(Call),
    Sync,
    Scale {
        name: String,
        instances: u32,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    Restart {
        task_id: String,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    ReportUnhealthy {
        task_id: String,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    LaunchedTasks(oneshot::Sender<Vec<TaskInstance>>),
    PendingTasks(oneshot::Sender<Vec<TaskInstance>>),
    Stop,
}

/// Who asked for a subscription attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// An explicit `subscribe()` from the caller.
    Caller,
    /// The loop itself, after a stream end or a stall.
    Reconnect,
}

enum ConnState {
    Idle,
    Streaming {
        body: Incoming,
        decoder: RecordIoDecoder,
        last_read: Instant,
    },
    /// A reconnect is scheduled for the deadline.
    Waiting(Instant),
}

enum Step {
    Control(Option<Control>),
    Frame(Option<Result<Frame<Bytes>, hyper::Error>>),
    IdleTimeout,
    Reconnect,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct EventLoop {
    engine: Engine,
    handlers: HandlerTable,
    endpoint: Endpoint,
    discovery_host: String,
    api_path: String,
    idle_timeout: Duration,
    request_timeout: Duration,
    backoff: Backoff,
    state: ConnState,
    control_rx: mpsc::UnboundedReceiver<Control>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    persist_tx: Option<PersistSender>,
    /// Set once TEARDOWN was sent; the stream closing is then expected.
    torn_down: bool,
}

impl EventLoop {
    pub(crate) fn new(
        engine: Engine,
        handlers: HandlerTable,
        endpoint: Endpoint,
        control_rx: mpsc::UnboundedReceiver<Control>,
        notify_tx: mpsc::UnboundedSender<Notification>,
        persist_tx: Option<PersistSender>,
    ) -> Self {
        let master = &engine.config().master;
        let discovery_host = master.discovery_host.clone();
        let api_path = master.api_path.clone();
        let idle_timeout = master.idle_timeout;
        let request_timeout = master.request_timeout;
        let backoff = Backoff::from_config(&engine.config().scheduler);
        Self {
            engine,
            handlers,
            endpoint,
            discovery_host,
            api_path,
            idle_timeout,
            request_timeout,
            backoff,
            state: ConnState::Idle,
            control_rx,
            notify_tx,
            persist_tx,
            torn_down: false,
        }
    }

    /// Run until stopped, every handle is dropped, or the leader is lost.
    pub(crate) async fn run(mut self) -> SchedulerResult<()> {
        info!(master = %self.endpoint, "scheduler event loop started");
        loop {
            let step = match &mut self.state {
                ConnState::Idle => Step::Control(self.control_rx.recv().await),
                ConnState::Streaming {
                    body, last_read, ..
                } => {
                    let deadline = *last_read + self.idle_timeout;
                    tokio::select! {
                        control = self.control_rx.recv() => Step::Control(control),
                        frame = body.frame() => Step::Frame(frame),
                        _ = sleep_until(deadline) => Step::IdleTimeout,
                    }
                }
                ConnState::Waiting(deadline) => {
                    let deadline = *deadline;
                    tokio::select! {
                        control = self.control_rx.recv() => Step::Control(control),
                        _ = sleep_until(deadline) => Step::Reconnect,
                    }
                }
            };

            match step {
                Step::Control(None) => {
                    info!("all scheduler handles dropped, stopping");
                    return Ok(());
                }
                Step::Control(Some(control)) => {
                    if let Flow::Stop = self.handle_control(control).await {
                        info!("scheduler stopped");
                        return Ok(());
                    }
                }
                Step::Frame(Some(Ok(frame))) => self.handle_frame(frame),
                Step::Frame(Some(Err(e))) => {
                    self.stream_ended(SchedulerError::Transport(format!(
                        "subscription stream failed: {e}"
                    )));
                }
                Step::Frame(None) => {
                    self.stream_ended(SchedulerError::Transport(
                        "subscription stream closed".to_string(),
                    ));
                }
                Step::IdleTimeout => self.handle_idle_timeout().await?,
                Step::Reconnect => {
                    self.state = ConnState::Idle;
                    self.subscribe(Trigger::Reconnect).await;
                }
            }
        }
    }

    // ── Control ────────────────────────────────────────────────────

    async fn handle_control(&mut self, control: Control) -> Flow {
        match control {
            Control::Subscribe => {
                self.torn_down = false;
                if matches!(self.state, ConnState::Streaming { .. }) {
                    debug!("already subscribed");
                } else {
                    self.subscribe(Trigger::Caller).await;
                }
            }
            Control::Call(call) => {
                if call.kind == CallType::Teardown {
                    self.torn_down = true;
                }
                self.engine.call(call);
            }
            Control::Sync => self.engine.sync(),
            Control::Scale {
                name,
                instances,
                reply,
            } => {
                let _ = reply.send(self.engine.scale(&name, instances));
            }
            Control::Restart { task_id, reply } => {
                let _ = reply.send(self.engine.restart(&task_id));
            }
            Control::ReportUnhealthy { task_id, reply } => {
                let _ = reply.send(self.engine.report_unhealthy(&task_id));
            }
            Control::LaunchedTasks(reply) => {
                let _ = reply.send(self.engine.tasks().launched_tasks().cloned().collect());
            }
            Control::PendingTasks(reply) => {
                let _ = reply.send(self.engine.tasks().pending().to_vec());
            }
            Control::Stop => return Flow::Stop,
        }
        self.flush();
        Flow::Continue
    }

    // ── Subscription ───────────────────────────────────────────────

    /// Open the subscription stream, following leader redirects.
    ///
    /// A failed connect or an exhausted redirect chain is surfaced as an
    /// error. Only attempts made by the loop itself are retried after the
    /// backoff delay; a caller-initiated attempt returns to idle and the
    /// caller decides whether to subscribe again.
    async fn subscribe(&mut self, trigger: Trigger) {
        self.state = ConnState::Idle;

        for _ in 0..=MAX_REDIRECTS {
            let framework_id = self.engine.framework_id().map(str::to_string);
            let info = self.engine.config().framework_info(framework_id.as_deref());
            let body = match Call::subscribe(&info).to_bytes(framework_id.as_deref()) {
                Ok(body) => body,
                Err(e) => {
                    self.emit(Notification::Error(SchedulerError::Protocol(format!(
                        "encoding SUBSCRIBE: {e}"
                    ))));
                    return;
                }
            };

            info!(master = %self.endpoint, framework_id = ?framework_id, "subscribing");
            let outcome = timeout(
                self.request_timeout,
                transport::subscribe(&self.endpoint, &self.api_path, body),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SchedulerError::Transport(format!(
                    "SUBSCRIBE to {} timed out after {:?}",
                    self.endpoint, self.request_timeout
                )))
            });

            match outcome {
                Ok(SubscribeOutcome::Stream { stream_id, body }) => {
                    info!(master = %self.endpoint, %stream_id, "subscription stream open");
                    self.engine.set_stream_id(Some(stream_id.clone()));
                    self.state = ConnState::Streaming {
                        body,
                        decoder: RecordIoDecoder::new(DEFAULT_MAX_RECORD),
                        last_read: Instant::now(),
                    };
                    self.emit(Notification::Connected { stream_id });
                    return;
                }
                Ok(SubscribeOutcome::Redirect(target)) => {
                    info!(from = %self.endpoint, to = %target, "following leader redirect");
                    self.endpoint = target;
                }
                Ok(SubscribeOutcome::MissingStreamId) => {
                    error!(master = %self.endpoint, "subscription accepted without a stream id");
                    self.emit(Notification::Error(SchedulerError::Protocol(
                        "SUBSCRIBE response carried no stream id".to_string(),
                    )));
                    return;
                }
                Ok(SubscribeOutcome::Rejected { status, body }) => {
                    warn!(master = %self.endpoint, status, %body, "subscription rejected");
                    self.emit(Notification::Error(SchedulerError::CallRejected {
                        call: CallType::Subscribe,
                        status,
                        body,
                    }));
                    return;
                }
                Err(e) => {
                    warn!(master = %self.endpoint, error = %e, ?trigger, "subscribe failed");
                    self.emit(Notification::Error(e));
                    self.retry_if_reconnecting(trigger);
                    return;
                }
            }
        }

        self.emit(Notification::Error(SchedulerError::Protocol(format!(
            "more than {MAX_REDIRECTS} redirects while subscribing"
        ))));
        self.retry_if_reconnecting(trigger);
    }

    fn retry_if_reconnecting(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Reconnect => self.schedule_reconnect(),
            Trigger::Caller => self.state = ConnState::Idle,
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.state = ConnState::Waiting(Instant::now() + delay);
    }

    fn stream_ended(&mut self, err: SchedulerError) {
        self.engine.set_stream_id(None);
        if self.torn_down {
            info!(master = %self.endpoint, "subscription closed after teardown");
            self.state = ConnState::Idle;
            return;
        }
        warn!(master = %self.endpoint, error = %err, "subscription lost");
        self.emit(Notification::Error(err));
        self.schedule_reconnect();
    }

    async fn handle_idle_timeout(&mut self) -> SchedulerResult<()> {
        if self.torn_down {
            self.state = ConnState::Idle;
            return Ok(());
        }
        warn!(
            master = %self.endpoint,
            idle = ?self.idle_timeout,
            "no data on subscription, assuming the master is gone"
        );
        self.state = ConnState::Idle;
        self.engine.set_stream_id(None);

        if self.endpoint.host == self.discovery_host {
            self.subscribe(Trigger::Reconnect).await;
            return Ok(());
        }

        let probe = timeout(self.request_timeout, transport::probe_redirect(&self.endpoint)).await;
        match probe {
            Ok(Ok(Some(target))) => {
                info!(from = %self.endpoint, to = %target, "leader moved");
                self.endpoint = target;
                self.subscribe(Trigger::Reconnect).await;
                Ok(())
            }
            Ok(Ok(None)) => {
                self.subscribe(Trigger::Reconnect).await;
                Ok(())
            }
            Ok(Err(e)) => Err(self.leader_lost(e.to_string())),
            Err(_) => Err(self.leader_lost("redirect probe timed out".to_string())),
        }
    }

    fn leader_lost(&self, reason: String) -> SchedulerError {
        let err = SchedulerError::LeaderLost(format!("{}: {reason}", self.endpoint));
        error!(error = %err, "no way to find the leading master");
        self.emit(Notification::Error(err.clone()));
        err
    }

    // ── Frames ─────────────────────────────────────────────────────

    fn handle_frame(&mut self, frame: Frame<Bytes>) {
        let ConnState::Streaming {
            decoder, last_read, ..
        } = &mut self.state
        else {
            return;
        };
        *last_read = Instant::now();
        let Ok(data) = frame.into_data() else {
            return;
        };

        let records = match decoder.feed(&data) {
            Ok(records) => records,
            Err(e) => {
                self.stream_ended(e);
                return;
            }
        };
        for record in records {
            let kind = dispatch(&mut self.engine, &mut self.handlers, &record);
            if kind == Some(EventType::Heartbeat) {
                self.backoff.reset();
            }
            self.flush();
        }
    }

    // ── Commands ───────────────────────────────────────────────────

    fn flush(&mut self) {
        for command in self.engine.take_commands() {
            match command {
                Command::Call(call) => self.send_call(call),
                Command::Persist(op) => {
                    let Some(tx) = &self.persist_tx else {
                        continue;
                    };
                    if tx.send(op).is_err() {
                        warn!("persistence worker gone, dropping store update");
                    }
                }
                Command::Notify(notification) => self.emit(notification),
            }
        }
    }

    fn emit(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification);
    }

    /// Issue an action call without waiting for it.
    fn send_call(&self, call: Call) {
        let kind = call.kind;
        let body = match call.to_bytes(self.engine.framework_id()) {
            Ok(body) => body,
            Err(e) => {
                self.emit(Notification::Error(SchedulerError::Protocol(format!(
                    "encoding {kind}: {e}"
                ))));
                return;
            }
        };
        let endpoint = self.endpoint.clone();
        let path = self.api_path.clone();
        let stream_id = self.engine.stream_id().map(str::to_string);
        let request_timeout = self.request_timeout;
        let notify_tx = self.notify_tx.clone();

        tokio::spawn(async move {
            let result = timeout(
                request_timeout,
                transport::call(&endpoint, &path, stream_id.as_deref(), body),
            )
            .await;
            let notification = match result {
                Ok(Ok((202, _))) => {
                    debug!(call = %kind, "call accepted");
                    Notification::Sent(kind)
                }
                Ok(Ok((status, body))) => {
                    warn!(call = %kind, status, %body, "call rejected");
                    Notification::Error(SchedulerError::CallRejected {
                        call: kind,
                        status,
                        body,
                    })
                }
                Ok(Err(e)) => {
                    warn!(call = %kind, error = %e, "call failed");
                    Notification::Error(e)
                }
                Err(_) => Notification::Error(SchedulerError::Transport(format!(
                    "{kind} timed out after {request_timeout:?}"
                ))),
            };
            let _ = notify_tx.send(notification);
        });
    }
}
