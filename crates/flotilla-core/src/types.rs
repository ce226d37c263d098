//! Task definitions and the per-instance state the scheduler tracks.
//!
//! A `TaskSpec` is what an operator writes in `flotilla.toml`. At load time
//! it is expanded into one `TaskInstance` per requested instance; the
//! instance is what moves through pending → launched → terminal and what
//! gets persisted to the coordination store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::TaskState;

/// Environment variable names the scheduler injects at launch time.
pub const HOST_ENV: &str = "HOST";
pub const SERIAL_NUMBER_ENV: &str = "TASK_SERIAL_NUMBER";

/// `PORT0`, `PORT1`, ...
pub fn port_env_name(index: usize) -> String {
    format!("PORT{index}")
}

/// Whether `name` is one of the bindings synthesized at launch
/// (`HOST`, `PORT{n}`, `TASK_SERIAL_NUMBER`).
pub fn is_launch_binding(name: &str) -> bool {
    if name == HOST_ENV || name == SERIAL_NUMBER_ENV {
        return true;
    }
    name.strip_prefix("PORT")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

// ── Task spec ──────────────────────────────────────────────────────

/// Static definition of a task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    /// Lower sorts first; ties keep insertion order.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_instances")]
    pub instances: u32,
    pub resources: ResourceDemand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    /// Passed through to the task info untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Value>,
    #[serde(default)]
    pub allow_scaling: bool,
}

fn default_priority() -> u32 {
    1
}

fn default_instances() -> u32 {
    1
}

impl TaskSpec {
    /// The environment the launched process sees: the executor's command
    /// when a custom executor is used, otherwise the task's own command.
    pub fn environment_mut(&mut self) -> &mut Vec<EnvVar> {
        let command = match self.executor.as_mut() {
            Some(executor) => &mut executor.command,
            None => self.command.get_or_insert_with(CommandInfo::default),
        };
        &mut command
            .environment
            .get_or_insert_with(Environment::default)
            .variables
    }

    /// Set (or replace) one environment variable.
    pub fn set_env(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let vars = self.environment_mut();
        match vars.iter_mut().find(|var| var.name == name) {
            Some(var) => var.value = value,
            None => vars.push(EnvVar {
                name: name.to_string(),
                value,
            }),
        }
    }

    /// Look up an environment variable wherever the launch would place it.
    pub fn env(&self, name: &str) -> Option<&str> {
        let command = match &self.executor {
            Some(executor) => Some(&executor.command),
            None => self.command.as_ref(),
        }?;
        command
            .environment
            .as_ref()?
            .variables
            .iter()
            .find(|var| var.name == name)
            .map(|var| var.value.as_str())
    }

    /// Remove every launch-time binding, keeping user-defined variables.
    pub fn strip_launch_env(&mut self) {
        let commands = [
            self.command.as_mut(),
            self.executor.as_mut().map(|executor| &mut executor.command),
        ];
        for command in commands.into_iter().flatten() {
            if let Some(env) = command.environment.as_mut() {
                env.variables.retain(|var| !is_launch_binding(&var.name));
            }
        }
    }
}

/// Resources one instance needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceDemand {
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub mem: f64,
    #[serde(default)]
    pub disk: f64,
    /// Number of ports, static ones included.
    #[serde(default)]
    pub ports: u32,
    /// Ports that must be allocated exactly (only honoured when the
    /// scheduler runs with static ports enabled).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub static_ports: BTreeSet<u64>,
}

impl ResourceDemand {
    /// Total ports needed; never fewer than the static ports requested.
    pub fn port_count(&self) -> u64 {
        u64::from(self.ports).max(self.static_ports.len() as u64)
    }
}

/// Command to run. Unknown fields are passed through to the master.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub variables: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Container descriptor. Only the docker port mappings are interpreted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DockerInfo {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Rewritten to the allocated port at launch.
    #[serde(default)]
    pub host_port: u64,
    pub container_port: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Custom executor descriptor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Defaults to the task id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub command: CommandInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// HTTP health check, bound to the first allocated port at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: f64,
    #[serde(default = "default_health_interval")]
    pub interval_secs: f64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub delay_secs: f64,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_grace_period() -> f64 {
    10.0
}

fn default_health_interval() -> f64 {
    10.0
}

fn default_health_timeout() -> f64 {
    20.0
}

fn default_consecutive_failures() -> u32 {
    3
}

// ── Task instance ──────────────────────────────────────────────────

/// One concrete unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Instance name: the spec name, suffixed `-<n>` when serial numbering
    /// is enabled.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<u32>,
    /// Per-instance copy of the spec; launch bindings are written into it.
    pub spec: TaskSpec,
    /// Generated at launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_info: Option<RuntimeInfo>,
    /// Health check descriptor synthesized at launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_info: Option<Value>,
    #[serde(default)]
    pub submitted: bool,
    /// Set once a restart has been initiated; a replacement is queued.
    #[serde(default)]
    pub restarting: bool,
    /// Set when a scale-down kill has been issued; nothing replaces it.
    #[serde(default)]
    pub retiring: bool,
    /// Insertion order among pending tasks; not persisted.
    #[serde(skip)]
    pub seq: u64,
}

impl TaskInstance {
    /// Expand a spec into its instances.
    pub fn expand(spec: &TaskSpec, serial_numbered: bool) -> Vec<TaskInstance> {
        (1..=spec.instances)
            .map(|n| Self::from_spec(spec, serial_numbered.then_some(n)))
            .collect()
    }

    /// A fresh, never-launched instance.
    pub fn from_spec(spec: &TaskSpec, serial: Option<u32>) -> Self {
        let name = match serial {
            Some(n) => format!("{}-{n}", spec.name),
            None => spec.name.clone(),
        };
        Self {
            name,
            serial,
            spec: spec.clone(),
            id: None,
            runtime_info: None,
            health_check_info: None,
            submitted: false,
            restarting: false,
            retiring: false,
            seq: 0,
        }
    }

    pub fn priority(&self) -> u32 {
        self.spec.priority
    }

    /// The agent this instance was placed on, if any.
    pub fn agent_id(&self) -> Option<&str> {
        self.runtime_info
            .as_ref()
            .map(|info| info.agent_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// A kill has been issued for this instance on purpose.
    pub fn is_winding_down(&self) -> bool {
        self.restarting || self.retiring
    }

    pub fn state(&self) -> Option<TaskState> {
        self.runtime_info.as_ref().map(|info| info.state)
    }

    /// A copy with every launch-derived field removed, ready to be queued
    /// as pending again.
    pub fn stripped(&self) -> TaskInstance {
        let mut clone = self.clone();
        clone.id = None;
        clone.runtime_info = None;
        clone.health_check_info = None;
        clone.submitted = false;
        clone.restarting = false;
        clone.retiring = false;
        clone.spec.strip_launch_env();
        clone
    }
}

/// What the scheduler knows about a launched instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<String>,
    pub state: TaskState,
    /// Unix epoch milliseconds of the launch.
    pub start_time: u64,
    #[serde(default)]
    pub network: NetworkBinding,
}

/// Where a launched instance can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<u64>,
}
