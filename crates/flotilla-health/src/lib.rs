//! flotilla-health — HTTP health checking for launched tasks.
//!
//! Polls every launched task that declares a health check and tells the
//! scheduler when one stops answering.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (one background task)
//!   ├── SchedulerHandle::launched_tasks()   snapshot per tick
//!   ├── per task: TaskHealth (grace period, failure streak, backoff)
//!   │   └── http_probe(host:PORT0, path) → ProbeResult
//!   └── SchedulerHandle::report_unhealthy() on the transition to Unhealthy
//! ```
//!
//! # Backoff
//!
//! Each failed probe doubles the wait before the next one, up to 60s. A
//! single passing probe resets it and ends the failure streak. Probes are
//! skipped while a task is still within its grace period.

pub mod checker;
pub mod monitor;

pub use checker::{ProbeResult, TaskHealth, Verdict, http_probe};
pub use monitor::{HealthMonitor, MonitorHandle, ProbeTarget, probe_target};
