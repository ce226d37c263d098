//! flotilla-state — coordination store for the Flotilla scheduler.
//!
//! The scheduler persists one record per launched task and its framework
//! id in a hierarchical node store (ZooKeeper-style paths such as
//! `/dcos-service-flotilla/tasks/<task-id>`). The [`CoordinationStore`]
//! trait is the capability the scheduler is handed at construction;
//! [`RedbStore`] implements it on top of [redb](https://docs.rs/redb),
//! on disk or in memory.
//!
//! Missing nodes are reported as [`StateError::NoNode`], separately from
//! every other failure, so callers can treat "nothing persisted yet" as a
//! normal outcome.

pub mod error;
pub mod paths;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use paths::FrameworkPaths;
pub use store::{CoordinationStore, RedbStore};
