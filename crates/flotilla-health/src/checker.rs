//! HTTP probes and the per-task failure streak.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::time::Instant;
use tracing::{debug, warn};

use flotilla_core::config::HealthConfig;

const USER_AGENT_VALUE: &str = concat!("flotilla-health/", env!("CARGO_PKG_VERSION"));
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx.
    Healthy,
    /// Any other status.
    Unhealthy,
    /// No response: connection error or timeout.
    Failed,
}

/// What a probe result means for the task it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passing,
    /// Failing, below the threshold or already reported for this streak.
    Failing { failures: u32 },
    /// The failure streak just reached the threshold.
    Unhealthy,
}

/// Probe schedule and failure streak of one launched task.
///
/// A task is reported at most once per failure streak: when the scheduler
/// restarts unhealthy tasks the replacement gets a new id and a fresh
/// tracker, otherwise the streak has to be broken by a passing probe before
/// the task can be reported again.
#[derive(Debug)]
pub struct TaskHealth {
    /// Epoch millis before which the task is not probed.
    grace_until: u64,
    threshold: u32,
    interval: Duration,
    wait: Duration,
    next_due: Option<Instant>,
    failures: u32,
}

impl TaskHealth {
    pub fn new(config: &HealthConfig, grace_until: u64) -> Self {
        Self {
            grace_until,
            threshold: config.unhealthy_threshold.max(1),
            interval: config.interval,
            wait: config.interval,
            next_due: None,
            failures: 0,
        }
    }

    /// Whether a probe should run now.
    pub fn is_due(&self, now: Instant, now_millis: u64) -> bool {
        now_millis >= self.grace_until && self.next_due.is_none_or(|due| now >= due)
    }

    /// Fold in a probe taken at `now` and schedule the next one. Failures
    /// double the wait up to 60s; a pass resets it.
    pub fn observe(&mut self, result: ProbeResult, now: Instant) -> Verdict {
        let verdict = if result == ProbeResult::Healthy {
            if self.failures > 0 {
                debug!(failures = self.failures, "health check passing again");
            }
            self.failures = 0;
            self.wait = self.interval;
            Verdict::Passing
        } else {
            self.failures += 1;
            self.wait = (self.wait * 2).min(MAX_BACKOFF);
            if self.failures == self.threshold {
                Verdict::Unhealthy
            } else {
                Verdict::Failing {
                    failures: self.failures,
                }
            }
        };
        self.next_due = Some(now + self.wait);
        verdict
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Wait before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.wait
    }
}

/// GET `path` on `address` (`host:port`).
///
/// `Healthy` for 2xx, `Unhealthy` for any other status, `Failed` when the
/// connection fails or the probe outlives `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %address, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %address, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::get(path)
            .header(HOST, address)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, %path, "invalid health check path");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %address, %path, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %address, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%address, %path, "health probe timed out");
        ProbeResult::Failed
    })
}
