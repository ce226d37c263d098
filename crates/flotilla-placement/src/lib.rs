//! Flotilla offer matcher — first-fit placement of pending tasks onto
//! resource offers.
//!
//! This crate is pure: it never talks to the master or the store. The
//! scheduler hands it one offer and the priority-ordered pending list and
//! gets back the tasks to launch, fully decorated, plus the offer's
//! leftover resources.
//!
//! # Components
//!
//! - **`pool`** — Per-offer resource accumulator (scalars + port ranges)
//! - **`matcher`** — Feasibility test and first-fit pass over pending tasks
//! - **`launch`** — Launch decoration: env bindings, port mappings,
//!   health descriptor, task id and the `TaskInfo` JSON

pub mod launch;
pub mod matcher;
pub mod pool;

pub use launch::{decorate, generate_task_id, info_ports, sanitize_name, task_info};
pub use matcher::{Launch, MatchOptions, OfferPlan, plan_offer};
pub use pool::{Allocation, AllocationError, ResourcePool};
