//! Event dispatch: decode a frame, run its handler, emit a notification.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flotilla_core::{Event, EventType, Message, Subscribed};
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::{Engine, epoch_millis};
use crate::error::{SchedulerError, SchedulerResult};
use crate::notification::Notification;

/// Caller-supplied handler for one event type. Receives the type-specific
/// sub-object of the event.
pub type Handler = Box<dyn FnMut(&mut Engine, &Value) + Send>;

/// Override handlers keyed by event type. Types without an override use
/// the engine's built-in handling.
#[derive(Default)]
pub struct HandlerTable {
    overrides: HashMap<EventType, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an override. Only dispatchable event types are accepted.
    pub fn register(
        &mut self,
        kind: EventType,
        handler: impl FnMut(&mut Engine, &Value) + Send + 'static,
    ) -> SchedulerResult<()> {
        if !kind.is_dispatchable() {
            return Err(SchedulerError::UnsupportedHandler(kind));
        }
        if self.overrides.insert(kind, Box::new(handler)).is_some() {
            debug!(event = %kind, "handler override replaced");
        }
        Ok(())
    }

    pub fn has_override(&self, kind: EventType) -> bool {
        self.overrides.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handle one frame. Returns the event type when the frame parsed.
pub fn dispatch(engine: &mut Engine, table: &mut HandlerTable, frame: &[u8]) -> Option<EventType> {
    let event = match Event::parse(frame) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, len = frame.len(), "unparseable event");
            engine.notify(Notification::Error(SchedulerError::Protocol(format!(
                "unparseable event: {e}"
            ))));
            return None;
        }
    };
    let kind = event.kind;
    let payload = event.payload();

    // The framework id is session state, kept even when SUBSCRIBED is
    // overridden.
    let subscribed = if kind == EventType::Subscribed {
        match serde_json::from_value::<Subscribed>(payload.clone()) {
            Ok(subscribed) => {
                engine.set_framework_id(&subscribed.framework_id.value);
                Some(subscribed)
            }
            Err(e) => {
                engine.notify(Notification::Error(SchedulerError::Protocol(format!(
                    "malformed SUBSCRIBED payload: {e}"
                ))));
                return Some(kind);
            }
        }
    } else {
        None
    };

    match table.overrides.get_mut(&kind) {
        Some(handler) => handler(engine, &payload),
        None => engine.handle_event(kind, &payload),
    }

    let notification = match kind {
        EventType::Subscribed => Notification::Subscribed {
            framework_id: subscribed
                .map(|s| s.framework_id.value)
                .unwrap_or_default(),
            stream_id: engine.stream_id().map(str::to_string),
        },
        EventType::Heartbeat => Notification::Heartbeat {
            received_at: epoch_millis(),
        },
        EventType::Message => match decode_message(&payload) {
            Ok(notification) => notification,
            Err(e) => Notification::Error(e),
        },
        EventType::Error => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            engine.notify(Notification::Event { kind, payload });
            Notification::Error(SchedulerError::Master(message))
        }
        _ => Notification::Event { kind, payload },
    };
    engine.notify(notification);
    Some(kind)
}

fn decode_message(payload: &Value) -> SchedulerResult<Notification> {
    let message: Message = serde_json::from_value(payload.clone())
        .map_err(|e| SchedulerError::Protocol(format!("malformed MESSAGE payload: {e}")))?;
    let data = STANDARD
        .decode(message.data.as_bytes())
        .map_err(|e| SchedulerError::Protocol(format!("MESSAGE data is not base64: {e}")))?;
    Ok(Notification::Message {
        agent_id: message.agent_id.value,
        executor_id: message.executor_id.value,
        data,
    })
}
