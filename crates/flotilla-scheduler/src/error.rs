//! Scheduler error types.

use flotilla_core::{CallType, EventType};
use thiserror::Error;

/// Errors surfaced by the scheduler, either returned from facade calls or
/// carried by `Notification::Error`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    /// Connection refused, reset, timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The master spoke something we cannot read.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{call} rejected with status {status}: {body}")]
    CallRejected {
        call: CallType,
        status: u16,
        body: String,
    },

    /// An `ERROR` event sent by the master.
    #[error("master error: {0}")]
    Master(String),

    #[error("no handler can be registered for event type {0}")]
    UnsupportedHandler(EventType),

    /// Stalled on a non-discovery address and the address gave no
    /// redirect. Ends the event loop.
    #[error("leader lost: {0}")]
    LeaderLost(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("scheduler stopped")]
    Stopped,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
