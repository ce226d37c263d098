//! flotilla-core — shared types for the Flotilla scheduler.
//!
//! - **`protocol`** — master API wire types and enumerations
//! - **`call`** — builders for the calls the scheduler sends to the master
//! - **`types`** — task specs, task instances and their runtime info
//! - **`config`** — `flotilla.toml` parsing and validation

pub mod call;
pub mod config;
pub mod protocol;
pub mod types;

pub use call::{Call, CallType, Filters, ReconcileTask};
pub use config::SchedulerConfig;
pub use protocol::*;
pub use types::*;
