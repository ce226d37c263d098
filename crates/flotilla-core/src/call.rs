//! Builders for scheduler calls.
//!
//! Every call travels in the same envelope:
//! `{ "framework_id": {...}?, "type": "ACCEPT", "accept": {...} }`.
//! `Call` holds the type and the type-specific body; the framework id is
//! filled in at send time because it is only known after SUBSCRIBED.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Value, json};

use crate::protocol::{FrameworkInfo, Id};

/// The `type` tag of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    Subscribe,
    Teardown,
    Accept,
    Decline,
    Revive,
    Kill,
    Shutdown,
    Acknowledge,
    Reconcile,
    Message,
    Request,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Subscribe => "SUBSCRIBE",
            CallType::Teardown => "TEARDOWN",
            CallType::Accept => "ACCEPT",
            CallType::Decline => "DECLINE",
            CallType::Revive => "REVIVE",
            CallType::Kill => "KILL",
            CallType::Shutdown => "SHUTDOWN",
            CallType::Acknowledge => "ACKNOWLEDGE",
            CallType::Reconcile => "RECONCILE",
            CallType::Message => "MESSAGE",
            CallType::Request => "REQUEST",
        }
    }

    /// Name of the body field, the lower-cased type.
    pub fn field(&self) -> &'static str {
        match self {
            CallType::Subscribe => "subscribe",
            CallType::Teardown => "teardown",
            CallType::Accept => "accept",
            CallType::Decline => "decline",
            CallType::Revive => "revive",
            CallType::Kill => "kill",
            CallType::Shutdown => "shutdown",
            CallType::Acknowledge => "acknowledge",
            CallType::Reconcile => "reconcile",
            CallType::Message => "message",
            CallType::Request => "request",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offer filters attached to ACCEPT and DECLINE.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Filters {
    pub refuse_seconds: f64,
}

/// One entry of a RECONCILE call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileTask {
    pub task_id: Id,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Id>,
}

/// A call to the master, ready to be wrapped in its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: CallType,
    pub body: Option<Value>,
}

impl Call {
    fn new(kind: CallType, body: Value) -> Self {
        Self {
            kind,
            body: Some(body),
        }
    }

    pub fn subscribe(framework_info: &FrameworkInfo) -> Self {
        Self::new(
            CallType::Subscribe,
            json!({ "framework_info": framework_info }),
        )
    }

    pub fn teardown() -> Self {
        Self {
            kind: CallType::Teardown,
            body: None,
        }
    }

    /// Accept offers, applying `operations` (see [`launch`]).
    pub fn accept(offer_ids: Vec<Id>, operations: Vec<Value>, filters: Option<Filters>) -> Self {
        let mut body = json!({
            "offer_ids": offer_ids,
            "operations": operations,
        });
        if let Some(filters) = filters {
            body["filters"] = json!(filters);
        }
        Self::new(CallType::Accept, body)
    }

    pub fn decline(offer_ids: Vec<Id>, filters: Option<Filters>) -> Self {
        let mut body = json!({ "offer_ids": offer_ids });
        if let Some(filters) = filters {
            body["filters"] = json!(filters);
        }
        Self::new(CallType::Decline, body)
    }

    pub fn revive() -> Self {
        Self {
            kind: CallType::Revive,
            body: None,
        }
    }

    pub fn kill(task_id: Id, agent_id: Option<Id>) -> Self {
        let mut body = json!({ "task_id": task_id });
        if let Some(agent_id) = agent_id {
            body["agent_id"] = json!(agent_id);
        }
        Self::new(CallType::Kill, body)
    }

    pub fn shutdown(executor_id: Id, agent_id: Id) -> Self {
        Self::new(
            CallType::Shutdown,
            json!({ "executor_id": executor_id, "agent_id": agent_id }),
        )
    }

    /// `uuid` is the status update's de-duplication token, passed through
    /// in the (base64) form it arrived in.
    pub fn acknowledge(agent_id: Id, task_id: Id, uuid: String) -> Self {
        Self::new(
            CallType::Acknowledge,
            json!({ "agent_id": agent_id, "task_id": task_id, "uuid": uuid }),
        )
    }

    /// An empty task list asks the master for every known task (implicit
    /// reconciliation).
    pub fn reconcile(tasks: Vec<ReconcileTask>) -> Self {
        Self::new(CallType::Reconcile, json!({ "tasks": tasks }))
    }

    pub fn message(agent_id: Id, executor_id: Id, data: &[u8]) -> Self {
        Self::new(
            CallType::Message,
            json!({
                "agent_id": agent_id,
                "executor_id": executor_id,
                "data": STANDARD.encode(data),
            }),
        )
    }

    pub fn request(requests: Vec<Value>) -> Self {
        Self::new(CallType::Request, json!({ "requests": requests }))
    }

    /// The full JSON envelope.
    pub fn envelope(&self, framework_id: Option<&str>) -> Value {
        let mut envelope = json!({ "type": self.kind.as_str() });
        if let Some(id) = framework_id {
            envelope["framework_id"] = json!(Id::new(id));
        }
        if let Some(body) = &self.body {
            envelope[self.kind.field()] = body.clone();
        }
        envelope
    }

    pub fn to_bytes(&self, framework_id: Option<&str>) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.envelope(framework_id))
    }
}

/// A LAUNCH operation for an ACCEPT call.
pub fn launch(task_infos: Vec<Value>) -> Value {
    json!({
        "type": "LAUNCH",
        "launch": { "task_infos": task_infos },
    })
}
