//! Master API wire types.
//!
//! Enumerations are converted once, at the serde boundary. Everything the
//! scheduler inspects (offers, task statuses, event tags) is typed here;
//! payloads it only forwards stay as `serde_json::Value`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Identifiers ────────────────────────────────────────────────────

/// The `{ "value": "..." }` wrapper the master uses for every identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub value: String,
}

impl Id {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self { value }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ── Task state ─────────────────────────────────────────────────────

/// Task state as reported in status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_KILLING")]
    Killing,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_ERROR")]
    Error,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(rename = "TASK_DROPPED")]
    Dropped,
    #[serde(rename = "TASK_UNREACHABLE")]
    Unreachable,
    #[serde(rename = "TASK_GONE")]
    Gone,
    #[serde(rename = "TASK_GONE_BY_OPERATOR")]
    GoneByOperator,
    #[serde(rename = "TASK_UNKNOWN")]
    #[serde(other)]
    Unknown,
}

impl TaskState {
    const ALL: [TaskState; 14] = [
        TaskState::Staging,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Killing,
        TaskState::Finished,
        TaskState::Failed,
        TaskState::Killed,
        TaskState::Error,
        TaskState::Lost,
        TaskState::Dropped,
        TaskState::Unreachable,
        TaskState::Gone,
        TaskState::GoneByOperator,
        TaskState::Unknown,
    ];

    /// Wire name, e.g. `TASK_RUNNING`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Killing => "TASK_KILLING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Error => "TASK_ERROR",
            TaskState::Lost => "TASK_LOST",
            TaskState::Dropped => "TASK_DROPPED",
            TaskState::Unreachable => "TASK_UNREACHABLE",
            TaskState::Gone => "TASK_GONE",
            TaskState::GoneByOperator => "TASK_GONE_BY_OPERATOR",
            TaskState::Unknown => "TASK_UNKNOWN",
        }
    }

    /// No further transitions are expected without an explicit relaunch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
                | TaskState::GoneByOperator
        )
    }

    /// Not yet running: the agent is still preparing the task.
    pub fn is_launching(&self) -> bool {
        matches!(self, TaskState::Staging | TaskState::Starting)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    /// Accepts the wire name (`TASK_FAILED`) or the short form (`FAILED`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        let wanted = if wanted.starts_with("TASK_") {
            wanted
        } else {
            format!("TASK_{wanted}")
        };
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

/// Why a status update was sent. Only the reasons the scheduler acts on
/// are named; the rest collapse into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatusReason {
    ReasonReconciliation,
    ReasonTaskHealthCheckStatusUpdated,
    ReasonExecutorTerminated,
    ReasonAgentRemoved,
    ReasonAgentRestarted,
    #[serde(other)]
    Other,
}

/// A task status update, as carried by the `UPDATE` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: Id,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TaskStatusReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<Id>,
    /// De-duplication token; echoed back verbatim in ACKNOWLEDGE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_status: Option<Value>,
}

impl TaskStatus {
    pub fn is_reconciliation(&self) -> bool {
        self.reason == Some(TaskStatusReason::ReasonReconciliation)
    }
}

// ── Offers and resources ───────────────────────────────────────────

/// A resource offer from one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<Id>,
    pub agent_id: Id,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<OfferUrl>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Offer {
    /// The agent's advertised IP, if the offer carries a URL.
    pub fn ip(&self) -> Option<&str> {
        self.url.as_ref().and_then(|url| url.address.ip.as_deref())
    }
}

/// Where the offering agent can be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferUrl {
    #[serde(default)]
    pub scheme: Option<String>,
    pub address: Address,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    pub port: u32,
}

/// The value kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Scalar,
    Ranges,
    Set,
    Text,
}

/// One named resource in an offer (`cpus`, `mem`, `disk`, `ports`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Ranges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Resource {
    pub fn scalar(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueType::Scalar,
            scalar: Some(Scalar { value }),
            ranges: None,
            role: None,
        }
    }

    pub fn ranges(name: &str, ranges: Vec<Range>) -> Self {
        Self {
            name: name.to_string(),
            kind: ValueType::Ranges,
            scalar: None,
            ranges: Some(Ranges { range: ranges }),
            role: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default)]
    pub range: Vec<Range>,
}

/// An inclusive integer interval `[begin, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

impl Range {
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub fn single(port: u64) -> Self {
        Self {
            begin: port,
            end: port,
        }
    }

    pub fn len(&self) -> u64 {
        if self.end < self.begin {
            0
        } else {
            self.end - self.begin + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, value: u64) -> bool {
        self.begin <= value && value <= self.end
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// The `type` tag of an event on the subscription stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Subscribed,
    Offers,
    InverseOffers,
    Rescind,
    RescindInverseOffer,
    Update,
    UpdateOperationStatus,
    Message,
    Failure,
    Error,
    Heartbeat,
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Every type a handler can be registered for.
    pub const DISPATCHABLE: [EventType; 11] = [
        EventType::Subscribed,
        EventType::Offers,
        EventType::InverseOffers,
        EventType::Rescind,
        EventType::RescindInverseOffer,
        EventType::Update,
        EventType::UpdateOperationStatus,
        EventType::Message,
        EventType::Failure,
        EventType::Error,
        EventType::Heartbeat,
    ];

    /// Wire tag, e.g. `OFFERS`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Subscribed => "SUBSCRIBED",
            EventType::Offers => "OFFERS",
            EventType::InverseOffers => "INVERSE_OFFERS",
            EventType::Rescind => "RESCIND",
            EventType::RescindInverseOffer => "RESCIND_INVERSE_OFFER",
            EventType::Update => "UPDATE",
            EventType::UpdateOperationStatus => "UPDATE_OPERATION_STATUS",
            EventType::Message => "MESSAGE",
            EventType::Failure => "FAILURE",
            EventType::Error => "ERROR",
            EventType::Heartbeat => "HEARTBEAT",
            EventType::Unknown => "UNKNOWN",
        }
    }

    /// Name of the sub-object carrying this event's payload.
    pub fn field(&self) -> &'static str {
        match self {
            EventType::Subscribed => "subscribed",
            EventType::Offers => "offers",
            EventType::InverseOffers => "inverse_offers",
            EventType::Rescind => "rescind",
            EventType::RescindInverseOffer => "rescind_inverse_offer",
            EventType::Update => "update",
            EventType::UpdateOperationStatus => "update_operation_status",
            EventType::Message => "message",
            EventType::Failure => "failure",
            EventType::Error => "error",
            EventType::Heartbeat => "heartbeat",
            EventType::Unknown => "unknown",
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        Self::DISPATCHABLE.contains(self)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame of the subscription stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Event {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The type-specific sub-object, or `Null` when the event has none
    /// (`HEARTBEAT`).
    pub fn payload(&self) -> Value {
        self.body
            .get(self.kind.field())
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// `SUBSCRIBED` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Subscribed {
    pub framework_id: Id,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<f64>,
    #[serde(default)]
    pub master_info: Option<Value>,
}

/// `OFFERS` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Offers {
    #[serde(default)]
    pub offers: Vec<Offer>,
}

/// `RESCIND` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rescind {
    pub offer_id: Id,
}

/// `UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Update {
    pub status: TaskStatus,
}

/// `MESSAGE` payload; `data` is base64 on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub agent_id: Id,
    pub executor_id: Id,
    #[serde(default)]
    pub data: String,
}

/// `FAILURE` payload: an agent or executor went away.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Failure {
    #[serde(default)]
    pub agent_id: Option<Id>,
    #[serde(default)]
    pub executor_id: Option<Id>,
    #[serde(default)]
    pub status: Option<i32>,
}

/// `ERROR` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub message: String,
}

// ── Framework identity ─────────────────────────────────────────────

/// The framework description sent with SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub user: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failover_timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webui_url: Option<String>,
}
