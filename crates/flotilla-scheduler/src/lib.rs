//! flotilla-scheduler — the scheduler protocol engine.
//!
//! Keeps one subscription to the master, turns offers into launches,
//! tracks every task through its lifecycle and mirrors task state into a
//! coordination store so a restarted scheduler can pick up where it left
//! off.
//!
//! # Architecture
//!
//! ```text
//! Scheduler::builder(config).start()
//!   ├── recover()            persisted tasks → launched / kill / reconcile queues
//!   ├── persist worker       sequential writes and deletes
//!   └── EventLoop (one task)
//!       ├── transport        SUBSCRIBE stream, action calls, leader probe
//!       ├── RecordIoDecoder  stream bytes → event frames
//!       ├── dispatch()       override or built-in handler, then notification
//!       └── Engine           TaskStore, offer matching, lifecycle
//!                            └── Commands: Call | Persist | Notify
//! ```
//!
//! Handlers never perform I/O. They queue commands on the [`Engine`],
//! which the loop executes after every frame and every control message,
//! so the matching and lifecycle logic is testable without a master.
//!
//! # Reconnecting
//!
//! A closed or broken stream schedules a resubscribe after the current
//! [`Backoff`] delay; a HEARTBEAT resets it. A stalled stream on the
//! discovery host resubscribes at once, elsewhere the loop asks the stalled
//! master for a redirect and ends with [`SchedulerError::LeaderLost`] when
//! it gets no answer.

pub mod backoff;
mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notification;
pub mod persist;
pub mod recordio;
pub mod recovery;
pub mod scheduler;
pub mod task_store;
pub mod transport;

pub use backoff::Backoff;
pub use dispatcher::{Handler, HandlerTable};
pub use engine::{Command, Engine, PersistOp};
pub use error::{SchedulerError, SchedulerResult};
pub use notification::Notification;
pub use recordio::RecordIoDecoder;
pub use recovery::RecoveryReport;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerHandle};
pub use task_store::{KillRequest, TaskStore};
pub use transport::Endpoint;
