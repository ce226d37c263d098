//! flotilla.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::protocol::{FrameworkInfo, Id, TaskState};
use crate::types::TaskSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub framework: FrameworkConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub scheduler: SchedulingConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkConfig {
    pub name: String,
    #[serde(default = "default_user")]
    pub user: String,
    pub role: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default = "default_failover_timeout")]
    pub failover_timeout_secs: f64,
    pub webui_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_discovery_host")]
    pub host: String,
    #[serde(default = "default_master_port")]
    pub port: u16,
    /// Symbolic name that always resolves to the current leader.
    #[serde(default = "default_discovery_host")]
    pub discovery_host: String,
    #[serde(default = "default_api_path")]
    pub api_path: String,
    /// No bytes read on the subscription for this long counts as a stall.
    #[serde(default = "default_idle_timeout", with = "duration_str")]
    pub idle_timeout: Duration,
    /// Timeout for action calls and leader probes.
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: default_discovery_host(),
            port: default_master_port(),
            discovery_host: default_discovery_host(),
            api_path: default_api_path(),
            idle_timeout: default_idle_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Terminal states that re-queue the task instead of discarding it.
    #[serde(default = "default_restart_states", deserialize_with = "de_task_states")]
    pub restart_states: Vec<TaskState>,
    #[serde(default)]
    pub kill_unknown_tasks: bool,
    #[serde(default)]
    pub static_ports: bool,
    #[serde(default)]
    pub serial_numbered_tasks: bool,
    #[serde(default = "default_refuse_seconds")]
    pub refuse_seconds: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            restart_states: default_restart_states(),
            kill_unknown_tasks: false,
            static_ports: false,
            serial_numbered_tasks: false,
            refuse_seconds: default_refuse_seconds(),
            backoff_factor: default_backoff_factor(),
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// redb file backing the coordination store.
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_store_path(),
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_interval", with = "duration_str")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "duration_str")]
    pub timeout: Duration,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub restart_unhealthy: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            restart_unhealthy: false,
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_failover_timeout() -> f64 {
    604_800.0
}

fn default_discovery_host() -> String {
    "leader.mesos".to_string()
}

fn default_master_port() -> u16 {
    5050
}

fn default_api_path() -> String {
    "/api/v1/scheduler".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_restart_states() -> Vec<TaskState> {
    vec![TaskState::Failed, TaskState::Lost, TaskState::Error]
}

fn default_refuse_seconds() -> f64 {
    5.0
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_backoff_min_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    15_000
}

fn default_store_path() -> String {
    "flotilla.redb".to_string()
}

fn default_prefix() -> String {
    "/dcos-service-".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

/// Accepts `TASK_FAILED` as well as `FAILED`.
fn de_task_states<'de, D>(deserializer: D) -> Result<Vec<TaskState>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    raw.iter()
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .collect()
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SchedulerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.framework.name.trim().is_empty() {
            anyhow::bail!("framework.name must not be empty");
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.name.as_str()) {
                anyhow::bail!("duplicate task name: {}", task.name);
            }
            if task.instances == 0 {
                anyhow::bail!("task {} must request at least one instance", task.name);
            }
            let static_ports = task.resources.static_ports.len() as u64;
            if task.resources.ports > 0 && static_ports > u64::from(task.resources.ports) {
                anyhow::bail!(
                    "task {} lists {} static ports but only {} ports",
                    task.name,
                    static_ports,
                    task.resources.ports
                );
            }
        }

        let s = &self.scheduler;
        let factor_ok = s.backoff_factor.is_finite() && s.backoff_factor > 0.0;
        if !factor_ok || s.backoff_min_ms == 0 || s.backoff_max_ms == 0 {
            anyhow::bail!("backoff parameters must be positive");
        }
        if s.backoff_min_ms > s.backoff_max_ms {
            anyhow::bail!(
                "backoff_min_ms ({}) exceeds backoff_max_ms ({})",
                s.backoff_min_ms,
                s.backoff_max_ms
            );
        }
        Ok(())
    }

    /// The identity sent with SUBSCRIBE; `id` is the previously assigned
    /// framework id, if any.
    pub fn framework_info(&self, id: Option<&str>) -> FrameworkInfo {
        FrameworkInfo {
            user: self.framework.user.clone(),
            name: self.framework.name.clone(),
            id: id.map(Id::new),
            failover_timeout: Some(self.framework.failover_timeout_secs),
            checkpoint: Some(self.framework.checkpoint),
            role: self.framework.role.clone(),
            hostname: self.framework.hostname.clone(),
            webui_url: self.framework.webui_url.clone(),
        }
    }

    /// `host:port` of the master to subscribe to first.
    pub fn master_address(&self) -> String {
        format!("{}:{}", self.master.host, self.master.port)
    }
}

/// Parse `"500ms"`, `"10s"`, `"2m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {s:?}"))?;
    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
    };
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {s:?}: {e}"))
}

/// Render a duration the way `parse_duration` reads it back.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{millis}ms")
    } else if millis % 60_000 != 0 || millis == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}m", millis / 60_000)
    }
}

mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
