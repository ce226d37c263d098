//! Notifications delivered to whoever drives the scheduler.

use flotilla_core::{CallType, EventType, TaskInstance};
use serde_json::Value;

use crate::error::SchedulerError;

#[derive(Debug, Clone)]
pub enum Notification {
    /// Recovery finished; the scheduler accepts `subscribe()`.
    Ready,
    /// The master accepted SUBSCRIBE and the event stream is open.
    Connected { stream_id: String },
    Subscribed {
        framework_id: String,
        stream_id: Option<String>,
    },
    /// Local receipt time, Unix epoch milliseconds.
    Heartbeat { received_at: u64 },
    /// `MESSAGE` with its data decoded from base64.
    Message {
        agent_id: String,
        executor_id: String,
        data: Vec<u8>,
    },
    /// Any other event, payload as received.
    Event { kind: EventType, payload: Value },
    /// A launched task reached running (or was first observed).
    TaskLaunched(Box<TaskInstance>),
    /// The master accepted an action call.
    Sent(CallType),
    TaskUnhealthy { task_id: String, name: String },
    Error(SchedulerError),
}

impl Notification {
    /// Stable name, e.g. `offers`, `task_launched`, `sent_accept`.
    pub fn name(&self) -> String {
        match self {
            Notification::Ready => "ready".to_string(),
            Notification::Connected { .. } => "connected".to_string(),
            Notification::Subscribed { .. } => "subscribed".to_string(),
            Notification::Heartbeat { .. } => "heartbeat".to_string(),
            Notification::Message { .. } => "message".to_string(),
            Notification::Event { kind, .. } => kind.field().to_string(),
            Notification::TaskLaunched(_) => "task_launched".to_string(),
            Notification::Sent(call) => format!("sent_{}", call.field()),
            Notification::TaskUnhealthy { .. } => "task_unhealthy".to_string(),
            Notification::Error(_) => "error".to_string(),
        }
    }
}
