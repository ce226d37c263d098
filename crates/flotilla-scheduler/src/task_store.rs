//! In-memory task collections.
//!
//! A task instance lives in exactly one of `pending` (no id yet) or
//! `launched` (keyed by its id). Moving between them goes through the
//! methods here. The kill and reconcile queues are filled by recovery and
//! drained by `sync()`.

use std::collections::BTreeMap;

use flotilla_core::{ReconcileTask, TaskInstance};

/// A KILL to issue on the next sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub task_id: String,
    pub agent_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskStore {
    /// Sorted by (priority, seq).
    pending: Vec<TaskInstance>,
    launched: BTreeMap<String, TaskInstance>,
    kill_queue: Vec<KillRequest>,
    reconcile_queue: Vec<ReconcileTask>,
    next_seq: u64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Pending ────────────────────────────────────────────────────

    /// Queue a task behind every pending task of the same or higher
    /// priority.
    pub fn enqueue(&mut self, mut task: TaskInstance) {
        task.seq = self.next_seq;
        self.next_seq += 1;
        let key = (task.priority(), task.seq);
        let idx = self
            .pending
            .partition_point(|t| (t.priority(), t.seq) <= key);
        self.pending.insert(idx, task);
    }

    pub fn pending(&self) -> &[TaskInstance] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Remove the pending tasks at `indices` (any order), returning them in
    /// ascending index order.
    pub fn take_pending(&mut self, indices: &[usize]) -> Vec<TaskInstance> {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut taken = Vec::with_capacity(sorted.len());
        for &idx in sorted.iter().rev() {
            if idx < self.pending.len() {
                taken.push(self.pending.remove(idx));
            }
        }
        taken.reverse();
        taken
    }

    /// Remove the first pending instance with this name.
    pub fn take_pending_by_name(&mut self, name: &str) -> Option<TaskInstance> {
        let idx = self.pending.iter().position(|t| t.name == name)?;
        Some(self.pending.remove(idx))
    }

    /// Remove the pending instance of `spec_name` with the highest serial.
    pub fn take_last_pending_of(&mut self, spec_name: &str) -> Option<TaskInstance> {
        let idx = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, t)| t.spec.name == spec_name)
            .max_by_key(|(idx, t)| (t.serial, *idx))
            .map(|(idx, _)| idx)?;
        Some(self.pending.remove(idx))
    }

    // ── Launched ───────────────────────────────────────────────────

    /// Track a launched task. Tasks without an id are ignored.
    pub fn insert_launched(&mut self, task: TaskInstance) -> bool {
        match task.id.clone() {
            Some(id) => {
                self.launched.insert(id, task);
                true
            }
            None => false,
        }
    }

    pub fn launched(&self, task_id: &str) -> Option<&TaskInstance> {
        self.launched.get(task_id)
    }

    pub fn launched_mut(&mut self, task_id: &str) -> Option<&mut TaskInstance> {
        self.launched.get_mut(task_id)
    }

    pub fn remove_launched(&mut self, task_id: &str) -> Option<TaskInstance> {
        self.launched.remove(task_id)
    }

    pub fn launched_tasks(&self) -> impl Iterator<Item = &TaskInstance> {
        self.launched.values()
    }

    pub fn launched_len(&self) -> usize {
        self.launched.len()
    }

    /// Every instance of `spec_name`, pending and launched. Launched
    /// instances already being replaced are not counted.
    pub fn instances_of(&self, spec_name: &str) -> usize {
        let pending = self.pending.iter().filter(|t| t.spec.name == spec_name).count();
        let launched = self
            .launched
            .values()
            .filter(|t| t.spec.name == spec_name && !t.is_winding_down())
            .count();
        pending + launched
    }

    /// Highest serial number in use for `spec_name`.
    pub fn max_serial_of(&self, spec_name: &str) -> u32 {
        self.pending
            .iter()
            .chain(self.launched.values())
            .filter(|t| t.spec.name == spec_name)
            .filter_map(|t| t.serial)
            .max()
            .unwrap_or(0)
    }

    // ── Recovery work lists ────────────────────────────────────────

    pub fn queue_kill(&mut self, request: KillRequest) {
        self.kill_queue.push(request);
    }

    pub fn queue_reconcile(&mut self, task: ReconcileTask) {
        self.reconcile_queue.push(task);
    }

    pub fn kill_queue(&self) -> &[KillRequest] {
        &self.kill_queue
    }

    pub fn reconcile_queue(&self) -> &[ReconcileTask] {
        &self.reconcile_queue
    }

    pub fn drain_kills(&mut self) -> Vec<KillRequest> {
        std::mem::take(&mut self.kill_queue)
    }

    pub fn drain_reconciles(&mut self) -> Vec<ReconcileTask> {
        std::mem::take(&mut self.reconcile_queue)
    }
}

#[cfg(test)]
mod tests {
    use flotilla_core::{ResourceDemand, TaskSpec};

    use super::*;

    fn instance(name: &str, priority: u32) -> TaskInstance {
        let spec = TaskSpec {
            name: name.to_string(),
            priority,
            instances: 1,
            resources: ResourceDemand::default(),
            command: None,
            container: None,
            executor: None,
            health_check: None,
            labels: None,
            allow_scaling: false,
        };
        TaskInstance::from_spec(&spec, None)
    }

    fn names(store: &TaskStore) -> Vec<&str> {
        store.pending().iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn pending_ordered_by_priority_then_insertion() {
        let mut store = TaskStore::new();
        store.enqueue(instance("b1", 2));
        store.enqueue(instance("a1", 1));
        store.enqueue(instance("b2", 2));
        store.enqueue(instance("z0", 0));
        store.enqueue(instance("a2", 1));
        assert_eq!(names(&store), vec!["z0", "a1", "a2", "b1", "b2"]);
    }

    #[test]
    fn requeued_task_goes_behind_its_peers() {
        let mut store = TaskStore::new();
        store.enqueue(instance("a", 1));
        store.enqueue(instance("b", 1));
        let a = store.take_pending_by_name("a").unwrap();
        store.enqueue(a);
        assert_eq!(names(&store), vec!["b", "a"]);
    }

    #[test]
    fn take_pending_by_indices() {
        let mut store = TaskStore::new();
        for name in ["a", "b", "c", "d"] {
            store.enqueue(instance(name, 1));
        }
        let taken = store.take_pending(&[2, 0]);
        let taken: Vec<_> = taken.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(taken, vec!["a", "c"]);
        assert_eq!(names(&store), vec!["b", "d"]);
    }

    #[test]
    fn launched_keyed_by_id() {
        let mut store = TaskStore::new();
        let mut task = instance("web", 1);
        assert!(!store.insert_launched(task.clone()));
        task.id = Some("fw.web.1".to_string());
        assert!(store.insert_launched(task));
        assert!(store.launched("fw.web.1").is_some());
        assert_eq!(store.launched_len(), 1);
        assert!(store.remove_launched("fw.web.1").is_some());
        assert_eq!(store.launched_len(), 0);
    }

    #[test]
    fn counts_instances_and_serials() {
        let mut store = TaskStore::new();
        let mut a = instance("web", 1);
        a.serial = Some(1);
        let mut b = instance("web", 1);
        b.serial = Some(3);
        b.id = Some("x".to_string());
        let mut c = instance("web", 1);
        c.serial = Some(2);
        c.id = Some("y".to_string());
        c.restarting = true;
        let mut d = instance("web", 1);
        d.serial = Some(4);
        d.id = Some("z".to_string());
        d.retiring = true;
        store.enqueue(a);
        store.insert_launched(d);
        store.insert_launched(b);
        store.insert_launched(c);
        assert_eq!(store.instances_of("web"), 2);
        assert_eq!(store.max_serial_of("web"), 4);
        assert_eq!(store.max_serial_of("db"), 0);
    }

    #[test]
    fn take_last_pending_by_serial() {
        let mut store = TaskStore::new();
        for serial in [1, 3, 2] {
            let mut task = instance("web", 1);
            task.serial = Some(serial);
            store.enqueue(task);
        }
        assert_eq!(store.take_last_pending_of("web").unwrap().serial, Some(3));
        assert_eq!(store.take_last_pending_of("web").unwrap().serial, Some(2));
        assert!(store.take_last_pending_of("db").is_none());
    }

    #[test]
    fn queues_drain_once() {
        let mut store = TaskStore::new();
        store.queue_kill(KillRequest {
            task_id: "t1".to_string(),
            agent_id: None,
        });
        store.queue_reconcile(ReconcileTask {
            task_id: "t2".into(),
            agent_id: Some("a1".into()),
        });
        assert_eq!(store.drain_kills().len(), 1);
        assert_eq!(store.drain_reconciles().len(), 1);
        assert!(store.kill_queue().is_empty());
        assert!(store.reconcile_queue().is_empty());
    }
}
