//! First-fit matching of pending tasks against one offer.
//!
//! Pending tasks are visited in the order given (the scheduler keeps them
//! sorted by priority, then insertion). Every task that fits is allocated
//! from the offer's working pool and decorated for launch; tasks that do
//! not fit are skipped without touching the pool.

use flotilla_core::{Offer, TaskInstance};
use serde_json::Value;
use tracing::{debug, warn};

use crate::launch::{decorate, task_info};
use crate::pool::{Allocation, ResourcePool};

/// Matching knobs taken from the scheduler configuration.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Prefix of generated task ids.
    pub framework_name: String,
    /// Honour `static_ports` in task demands.
    pub static_ports: bool,
    /// Add a `TASK_SERIAL_NUMBER` binding to serial-numbered instances.
    pub serial_numbered: bool,
}

/// One task matched to the offer.
#[derive(Debug, Clone)]
pub struct Launch {
    /// Position of the task in the pending slice handed to `plan_offer`.
    pub pending_index: usize,
    /// The decorated task, ready to move to the launched set.
    pub task: TaskInstance,
    pub allocation: Allocation,
    /// `TaskInfo` for the LAUNCH operation.
    pub task_info: Value,
}

/// Outcome of matching one offer.
#[derive(Debug, Clone)]
pub struct OfferPlan {
    pub launches: Vec<Launch>,
    /// What is left of the offer.
    pub remaining: ResourcePool,
}

impl OfferPlan {
    pub fn is_empty(&self) -> bool {
        self.launches.is_empty()
    }

    pub fn task_infos(&self) -> Vec<Value> {
        self.launches.iter().map(|l| l.task_info.clone()).collect()
    }
}

/// Match `pending` against `offer`. Pure apart from id generation.
pub fn plan_offer(
    offer: &Offer,
    pending: &[TaskInstance],
    opts: &MatchOptions,
    now_millis: u64,
) -> OfferPlan {
    let mut pool = ResourcePool::from_offer(offer);
    let mut launches = Vec::new();

    for (pending_index, candidate) in pending.iter().enumerate() {
        let demand = &candidate.spec.resources;
        if !pool.is_feasible(demand, opts.static_ports) {
            debug!(offer = %offer.id, task = %candidate.name, "task does not fit offer");
            continue;
        }

        let allocation = match pool.allocate(demand, opts.static_ports) {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(
                    offer = %offer.id,
                    task = %candidate.name,
                    error = %e,
                    "allocation failed after feasibility check, leaving task pending"
                );
                continue;
            }
        };

        let mut task = candidate.clone();
        decorate(&mut task, offer, &allocation, opts, now_millis);
        let task_info = task_info(&task, offer, &allocation);
        debug!(
            offer = %offer.id,
            task = %task.name,
            ports = ?allocation.ports,
            "task matched"
        );
        launches.push(Launch {
            pending_index,
            task,
            allocation,
            task_info,
        });
    }

    OfferPlan {
        launches,
        remaining: pool,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use flotilla_core::{Range, Resource, ResourceDemand, TaskSpec};
    use serde_json::json;

    use super::*;
    use crate::launch::info_ports;

    fn offer(cpus: f64, mem: f64, ranges: Vec<Range>) -> Offer {
        Offer {
            id: "offer-1".into(),
            framework_id: None,
            agent_id: "agent-1".into(),
            hostname: "node-1".to_string(),
            url: None,
            resources: vec![
                Resource::scalar("cpus", cpus),
                Resource::scalar("mem", mem),
                Resource::scalar("disk", 1000.0),
                Resource::ranges("ports", ranges),
            ],
        }
    }

    fn task(name: &str, cpus: f64, mem: f64, ports: u32, statics: &[u64]) -> TaskInstance {
        let spec = TaskSpec {
            name: name.to_string(),
            priority: 1,
            instances: 1,
            resources: ResourceDemand {
                cpus,
                mem,
                disk: 10.0,
                ports,
                static_ports: statics.iter().copied().collect(),
            },
            command: None,
            container: None,
            executor: None,
            health_check: None,
            labels: None,
            allow_scaling: false,
        };
        TaskInstance::from_spec(&spec, None)
    }

    fn opts(static_ports: bool) -> MatchOptions {
        MatchOptions {
            framework_name: "fw".to_string(),
            static_ports,
            serial_numbered: false,
        }
    }

    #[test]
    fn single_task_single_offer() {
        let offer = offer(1.1, 256.0, vec![Range::new(8080, 8090)]);
        let pending = vec![task("web", 0.2, 128.0, 1, &[])];
        let plan = plan_offer(&offer, &pending, &opts(false), 0);

        assert_eq!(plan.launches.len(), 1);
        let launch = &plan.launches[0];
        assert_eq!(launch.pending_index, 0);
        let port = launch.allocation.ports[0];
        assert!((8080..=8090).contains(&port));
        assert_eq!(
            launch.task.runtime_info.as_ref().unwrap().agent_id,
            "agent-1"
        );
        assert_eq!(info_ports(&launch.task_info), vec![port]);
        assert_eq!(plan.task_infos().len(), 1);
    }

    #[test]
    fn nothing_pending_nothing_launched() {
        let offer = offer(4.0, 4096.0, vec![Range::new(1, 100)]);
        let plan = plan_offer(&offer, &[], &opts(false), 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn skips_tasks_that_do_not_fit() {
        let offer = offer(1.0, 256.0, vec![Range::new(8080, 8081)]);
        let pending = vec![
            task("big", 2.0, 128.0, 0, &[]),
            task("small", 0.5, 128.0, 1, &[]),
        ];
        let plan = plan_offer(&offer, &pending, &opts(false), 0);
        assert_eq!(plan.launches.len(), 1);
        assert_eq!(plan.launches[0].pending_index, 1);
        assert_eq!(plan.launches[0].task.name, "small");
    }

    #[test]
    fn never_exceeds_offer() {
        let offer = offer(1.0, 300.0, vec![Range::new(8080, 8084)]);
        let pending: Vec<_> = (0..10).map(|i| task(&format!("t{i}"), 0.3, 100.0, 2, &[])).collect();
        let plan = plan_offer(&offer, &pending, &opts(false), 0);

        let cpus: f64 = plan.launches.iter().map(|l| l.task.spec.resources.cpus).sum();
        let mem: f64 = plan.launches.iter().map(|l| l.task.spec.resources.mem).sum();
        assert!(cpus <= 1.0 + 1e-9);
        assert!(mem <= 300.0);
        assert_eq!(plan.launches.len(), 2);

        let mut allocated = BTreeSet::new();
        for launch in &plan.launches {
            for port in info_ports(&launch.task_info) {
                assert!(allocated.insert(port));
            }
        }
        let mut all = allocated.clone();
        all.extend(plan.remaining.ports());
        assert_eq!(all, (8080..=8084).collect::<BTreeSet<u64>>());
        assert!(allocated.is_disjoint(&plan.remaining.ports()));
    }

    #[test]
    fn static_ports_served_before_dynamic() {
        let offer = offer(4.0, 4096.0, vec![Range::new(8080, 8082)]);
        let pending = vec![
            task("dynamic", 0.1, 1.0, 2, &[]),
            task("pinned", 0.1, 1.0, 1, &[8080]),
        ];
        let plan = plan_offer(&offer, &pending, &opts(true), 0);

        // The dynamic task takes 8080 and 8081 first, so the pinned one
        // cannot have its port from this offer.
        assert_eq!(plan.launches.len(), 1);
        assert_eq!(plan.launches[0].task.name, "dynamic");

        let pending = vec![
            task("pinned", 0.1, 1.0, 1, &[8080]),
            task("dynamic", 0.1, 1.0, 2, &[]),
        ];
        let plan = plan_offer(&offer, &pending, &opts(true), 0);
        assert_eq!(plan.launches.len(), 2);
        assert_eq!(plan.launches[0].allocation.ports, vec![8080]);
        assert_eq!(plan.launches[1].allocation.ports, vec![8081, 8082]);
    }

    #[test]
    fn static_port_missing_from_offer_never_launches() {
        let offer = offer(4.0, 4096.0, vec![Range::new(31000, 31010)]);
        let pending = vec![task("pinned", 0.1, 1.0, 1, &[8080])];
        let plan = plan_offer(&offer, &pending, &opts(true), 0);
        assert!(plan.is_empty());
        assert_eq!(plan.remaining.port_count(), 11);
    }

    #[test]
    fn feasible_but_unallocatable_stays_pending() {
        // Static port offered, but the extra dynamic port is not.
        let offer = offer(4.0, 4096.0, vec![Range::single(8080)]);
        let pending = vec![task("pinned", 0.1, 1.0, 2, &[8080])];
        let plan = plan_offer(&offer, &pending, &opts(true), 0);
        assert!(plan.is_empty());
        assert_eq!(plan.remaining.ports(), BTreeSet::from([8080]));
        assert_eq!(plan.remaining.cpus(), 4.0);
    }

    #[test]
    fn launched_ids_unique_within_pass() {
        let offer = offer(4.0, 4096.0, vec![Range::new(1, 100)]);
        let pending: Vec<_> = (0..5).map(|_| task("web", 0.1, 1.0, 1, &[])).collect();
        let plan = plan_offer(&offer, &pending, &opts(false), 0);
        let ids: BTreeSet<_> = plan
            .launches
            .iter()
            .map(|l| l.task.id.clone().unwrap())
            .collect();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn labels_pass_through() {
        let offer = offer(1.0, 256.0, vec![]);
        let mut pending = vec![task("web", 0.1, 1.0, 0, &[])];
        pending[0].spec.labels = Some(json!({ "labels": [{ "key": "tier", "value": "web" }] }));
        let plan = plan_offer(&offer, &pending, &opts(false), 0);
        assert_eq!(plan.launches[0].task_info["labels"]["labels"][0]["key"], "tier");
    }
}
