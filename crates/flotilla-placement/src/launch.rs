//! Launch decoration.
//!
//! Once a task has its resources, it is stamped with everything the agent
//! and the rest of the scheduler need: env bindings for host and ports, a
//! rewritten docker port mapping, an HTTP health check on the first port,
//! a unique task id and its initial `runtime_info`.

use flotilla_core::{
    HOST_ENV, NetworkBinding, Offer, Range, Resource, RuntimeInfo, SERIAL_NUMBER_ENV, TaskInstance,
    TaskState, port_env_name,
};
use serde_json::{Value, json};
use tracing::{error, warn};
use uuid::Uuid;

use crate::matcher::MatchOptions;
use crate::pool::Allocation;

/// Replace anything outside `[A-Za-z0-9_-]` so the name can sit between
/// the dots of a task id.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// `<framework>.<sanitized name>.<uuid v4>`.
pub fn generate_task_id(framework: &str, name: &str) -> String {
    format!("{framework}.{}.{}", sanitize_name(name), Uuid::new_v4())
}

/// Stamp a matched task with its launch-time fields.
pub fn decorate(
    task: &mut TaskInstance,
    offer: &Offer,
    allocation: &Allocation,
    opts: &MatchOptions,
    now_millis: u64,
) {
    let task_id = generate_task_id(&opts.framework_name, &task.name);

    task.spec.set_env(HOST_ENV, offer.hostname.clone());
    for (idx, port) in allocation.ports.iter().enumerate() {
        task.spec.set_env(&port_env_name(idx), port.to_string());
    }
    if opts.serial_numbered {
        if let Some(serial) = task.serial {
            task.spec.set_env(SERIAL_NUMBER_ENV, serial.to_string());
        }
    }

    rewrite_port_mappings(task, &allocation.ports);

    task.health_check_info = task.spec.health_check.as_ref().and_then(|hc| {
        let Some(&port) = allocation.ports.first() else {
            warn!(task = %task.name, "health check configured but no port allocated, skipping");
            return None;
        };
        Some(json!({
            "type": "HTTP",
            "http": {
                "scheme": "http",
                "port": port,
                "path": hc.path,
            },
            "delay_seconds": hc.delay_secs,
            "interval_seconds": hc.interval_secs,
            "timeout_seconds": hc.timeout_secs,
            "consecutive_failures": hc.consecutive_failures,
            "grace_period_seconds": hc.grace_period_secs,
        }))
    });

    let executor_id = task.spec.executor.as_ref().map(|executor| {
        executor
            .executor_id
            .clone()
            .unwrap_or_else(|| task_id.clone())
    });

    task.runtime_info = Some(RuntimeInfo {
        agent_id: offer.agent_id.value.clone(),
        executor_id,
        state: TaskState::Staging,
        start_time: now_millis,
        network: NetworkBinding {
            hostname: offer.hostname.clone(),
            ip: offer.ip().map(str::to_string),
            ports: allocation.ports.clone(),
        },
    });
    task.id = Some(task_id);
    task.submitted = true;
}

/// Point each docker port mapping at the allocated port with the same
/// index. A count mismatch is logged and the mappings are left as written.
fn rewrite_port_mappings(task: &mut TaskInstance, ports: &[u64]) {
    let Some(docker) = task
        .spec
        .container
        .as_mut()
        .and_then(|container| container.docker.as_mut())
    else {
        return;
    };
    if docker.port_mappings.is_empty() {
        return;
    }
    if docker.port_mappings.len() != ports.len() {
        error!(
            task = %task.name,
            mappings = docker.port_mappings.len(),
            ports = ports.len(),
            "port mapping count does not match allocated ports"
        );
        return;
    }
    for (mapping, port) in docker.port_mappings.iter_mut().zip(ports) {
        mapping.host_port = *port;
    }
}

/// The `TaskInfo` object for a LAUNCH operation.
pub fn task_info(task: &TaskInstance, offer: &Offer, allocation: &Allocation) -> Value {
    let demand = &task.spec.resources;
    let mut resources = vec![
        Resource::scalar("cpus", demand.cpus),
        Resource::scalar("mem", demand.mem),
    ];
    if demand.disk > 0.0 {
        resources.push(Resource::scalar("disk", demand.disk));
    }
    if !allocation.ports.is_empty() {
        resources.push(Resource::ranges("ports", allocation.port_ranges()));
    }

    let task_id = task.id.clone().unwrap_or_default();
    let mut info = json!({
        "name": task.name,
        "task_id": { "value": task_id },
        "agent_id": offer.agent_id,
        "resources": resources,
    });

    match &task.spec.executor {
        Some(executor) => {
            let executor_id = executor.executor_id.clone().unwrap_or_else(|| task_id.clone());
            let mut value = json!(executor);
            value["executor_id"] = json!({ "value": executor_id });
            value["type"] = json!("CUSTOM");
            info["executor"] = value;
        }
        None => {
            info["command"] = json!(task.spec.command.clone().unwrap_or_default());
        }
    }
    if let Some(container) = &task.spec.container {
        info["container"] = json!(container);
    }
    if let Some(health_check) = &task.health_check_info {
        info["health_check"] = health_check.clone();
    }
    if let Some(labels) = &task.spec.labels {
        info["labels"] = labels.clone();
    }
    info
}

/// Ports of a TaskInfo's `ports` resource, for logging and tests.
pub fn info_ports(info: &Value) -> Vec<u64> {
    info["resources"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|r| r["name"] == "ports")
        .filter_map(|r| serde_json::from_value::<Vec<Range>>(r["ranges"]["range"].clone()).ok())
        .flatten()
        .flat_map(|r| r.begin..=r.end)
        .collect()
}
