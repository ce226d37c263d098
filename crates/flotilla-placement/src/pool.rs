//! Working resource set for one offer.
//!
//! The port ranges are the only record of which ports remain; the port
//! count is updated in the same step as every range edit, and the
//! discrete port list is derived from the ranges on demand. An allocation
//! either takes everything it needs or leaves the pool untouched.

use std::collections::BTreeSet;

use flotilla_core::{Offer, Range, ResourceDemand};
use thiserror::Error;

/// Slack for float subtraction (`1.1 - 0.2 - ...`).
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AllocationError {
    #[error("insufficient {resource}: wanted {wanted}, {available} left")]
    Insufficient {
        resource: &'static str,
        wanted: f64,
        available: f64,
    },

    #[error("static port {0} is not offered")]
    StaticPortUnavailable(u64),

    #[error("insufficient ports: wanted {wanted}, {available} left")]
    InsufficientPorts { wanted: u64, available: u64 },
}

/// Ports handed to one task, in allocation order (static first).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    pub ports: Vec<u64>,
}

impl Allocation {
    /// One single-port range per allocated port, as the ACCEPT call wants.
    pub fn port_ranges(&self) -> Vec<Range> {
        self.ports.iter().copied().map(Range::single).collect()
    }
}

/// Remaining resources of one offer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePool {
    cpus: f64,
    mem: f64,
    disk: f64,
    ranges: Vec<Range>,
    port_count: u64,
}

impl ResourcePool {
    pub fn new(cpus: f64, mem: f64, disk: f64, ranges: Vec<Range>) -> Self {
        let ranges: Vec<Range> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        let port_count = ranges.iter().map(Range::len).sum();
        Self {
            cpus,
            mem,
            disk,
            ranges,
            port_count,
        }
    }

    /// Sum the offer's `cpus`, `mem`, `disk` and collect its `ports` ranges
    /// in arrival order. Other resources are ignored.
    pub fn from_offer(offer: &Offer) -> Self {
        let (mut cpus, mut mem, mut disk) = (0.0, 0.0, 0.0);
        let mut ranges = Vec::new();
        for resource in &offer.resources {
            let scalar = resource.scalar.map(|s| s.value).unwrap_or(0.0);
            match resource.name.as_str() {
                "cpus" => cpus += scalar,
                "mem" => mem += scalar,
                "disk" => disk += scalar,
                "ports" => {
                    if let Some(r) = &resource.ranges {
                        ranges.extend(r.range.iter().copied());
                    }
                }
                _ => {}
            }
        }
        Self::new(cpus, mem, disk, ranges)
    }

    pub fn cpus(&self) -> f64 {
        self.cpus
    }

    pub fn mem(&self) -> f64 {
        self.mem
    }

    pub fn disk(&self) -> f64 {
        self.disk
    }

    pub fn port_count(&self) -> u64 {
        self.port_count
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Discrete view of the remaining ports.
    pub fn ports(&self) -> BTreeSet<u64> {
        self.ranges.iter().flat_map(|r| r.begin..=r.end).collect()
    }

    pub fn has_port(&self, port: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(port))
    }

    /// cpus, mem and disk all cover the demand.
    pub fn covers_scalars(&self, demand: &ResourceDemand) -> bool {
        self.cpus + EPSILON >= demand.cpus
            && self.mem + EPSILON >= demand.mem
            && self.disk + EPSILON >= demand.disk
    }

    /// The first-pass feasibility test: scalars fit, and either enough
    /// ports remain or (with static ports enabled) every requested static
    /// port is still offered.
    pub fn is_feasible(&self, demand: &ResourceDemand, static_ports: bool) -> bool {
        if !self.covers_scalars(demand) {
            return false;
        }
        let enough_ports = self.port_count >= demand.port_count();
        let statics_offered = static_ports
            && !demand.static_ports.is_empty()
            && demand.static_ports.iter().all(|p| self.has_port(*p));
        enough_ports || statics_offered
    }

    /// Take everything `demand` needs, or nothing.
    pub fn allocate(
        &mut self,
        demand: &ResourceDemand,
        static_ports: bool,
    ) -> Result<Allocation, AllocationError> {
        let mut work = self.clone();
        work.take_scalars(demand)?;

        let mut ports = Vec::new();
        let mut needed = demand.port_count();
        if static_ports && !demand.static_ports.is_empty() {
            ports = work.take_static_ports(&demand.static_ports)?;
            needed -= ports.len() as u64;
        }
        ports.extend(work.take_dynamic_ports(needed)?);

        *self = work;
        Ok(Allocation { ports })
    }

    fn take_scalars(&mut self, demand: &ResourceDemand) -> Result<(), AllocationError> {
        for (resource, available, wanted) in [
            ("cpus", self.cpus, demand.cpus),
            ("mem", self.mem, demand.mem),
            ("disk", self.disk, demand.disk),
        ] {
            if available + EPSILON < wanted {
                return Err(AllocationError::Insufficient {
                    resource,
                    wanted,
                    available,
                });
            }
        }
        self.cpus = (self.cpus - demand.cpus).max(0.0);
        self.mem = (self.mem - demand.mem).max(0.0);
        self.disk = (self.disk - demand.disk).max(0.0);
        Ok(())
    }

    /// Carve each static port out of the range that holds it, leaving the
    /// left and right remainders in that range's place.
    fn take_static_ports(&mut self, wanted: &BTreeSet<u64>) -> Result<Vec<u64>, AllocationError> {
        let mut taken = Vec::with_capacity(wanted.len());
        for &port in wanted {
            let idx = self
                .ranges
                .iter()
                .position(|r| r.contains(port))
                .ok_or(AllocationError::StaticPortUnavailable(port))?;
            let range = self.ranges.remove(idx);
            let mut remainder = Vec::with_capacity(2);
            if port > range.begin {
                remainder.push(Range::new(range.begin, port - 1));
            }
            if port < range.end {
                remainder.push(Range::new(port + 1, range.end));
            }
            self.ranges.splice(idx..idx, remainder);
            self.port_count -= 1;
            taken.push(port);
        }
        Ok(taken)
    }

    /// Consume from the front of the range list, splitting the last range
    /// touched when it is larger than needed.
    fn take_dynamic_ports(&mut self, count: u64) -> Result<Vec<u64>, AllocationError> {
        if count > self.port_count {
            return Err(AllocationError::InsufficientPorts {
                wanted: count,
                available: self.port_count,
            });
        }
        let mut taken = Vec::with_capacity(count as usize);
        let mut needed = count;
        while needed > 0 {
            let Some(front) = self.ranges.first_mut() else {
                break;
            };
            let take = needed.min(front.len());
            taken.extend(front.begin..front.begin + take);
            if take == front.len() {
                self.ranges.remove(0);
            } else {
                front.begin += take;
            }
            self.port_count -= take;
            needed -= take;
        }
        Ok(taken)
    }
}
