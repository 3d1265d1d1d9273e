use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostmon_plugin::{Plugin, PluginId};

use crate::heap::{IndexedHeap, Slots};
use crate::task::{TaskId, TaskTable};

/// Scheduling state of one registered plugin: its pending task heap, the
/// capacity in use by dispatched tasks and its position in the global
/// plugin heap.
#[derive(Debug)]
pub struct PluginAgent {
    id: PluginId,
    plugin: Arc<Plugin>,
    tasks: IndexedHeap<TaskId>,
    used_capacity: u32,
    /// Position in the global plugin heap.
    index: Option<usize>,
    /// Number of clients (single checks count as one) using the plugin.
    ref_count: u32,
    last_served: u64,
    next_due: Option<DateTime<Utc>>,
}

impl PluginAgent {
    pub fn new(id: PluginId, plugin: Arc<Plugin>) -> Self {
        Self {
            id,
            plugin,
            tasks: IndexedHeap::new(),
            used_capacity: 0,
            index: None,
            ref_count: 0,
            last_served: 0,
            next_due: None,
        }
    }

    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    pub fn capacity(&self) -> u32 {
        self.plugin.capacity()
    }

    pub fn used_capacity(&self) -> u32 {
        self.used_capacity
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Due time of the earliest pending task.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next_due
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.iter()
    }

    pub fn peek_task(&self) -> Option<TaskId> {
        self.tasks.peek()
    }

    pub fn pop_task(&mut self, tasks: &mut TaskTable) -> Option<TaskId> {
        let id = self.tasks.pop(tasks);
        self.refresh_due(tasks);
        id
    }

    pub fn enqueue_task(&mut self, tasks: &mut TaskTable, id: TaskId) {
        self.tasks.push(tasks, id);
        self.refresh_due(tasks);
    }

    /// Removes the pending task at `index` of this plugin's heap.
    pub fn remove_task(&mut self, tasks: &mut TaskTable, index: usize) -> Option<TaskId> {
        let id = self.tasks.remove(tasks, index);
        self.refresh_due(tasks);
        id
    }

    /// Repositions the pending task at `index` after its due time changed.
    pub fn update_task(&mut self, tasks: &mut TaskTable, index: usize) {
        self.tasks.fix(tasks, index);
        self.refresh_due(tasks);
    }

    pub fn reserve_capacity(&mut self, weight: u32) {
        debug_assert!(self.used_capacity + weight <= self.capacity());
        self.used_capacity += weight;
    }

    pub fn release_capacity(&mut self, weight: u32) {
        debug_assert!(weight <= self.used_capacity);
        self.used_capacity = self.used_capacity.saturating_sub(weight);
    }

    /// Whether the next pending task fits into the free capacity.
    pub fn has_capacity(&self, tasks: &TaskTable) -> bool {
        let free = self.capacity().saturating_sub(self.used_capacity);
        match self.peek_task().and_then(|id| tasks.get(id)) {
            Some(task) => task.weight() <= free,
            None => free > 0,
        }
    }

    pub fn queued(&self) -> bool {
        self.index.is_some()
    }

    pub fn active(&self) -> bool {
        self.ref_count > 0
    }

    /// Increments the reference count; returns `true` on the 0 to 1
    /// transition.
    pub fn acquire(&mut self) -> bool {
        self.ref_count += 1;
        self.ref_count == 1
    }

    /// Decrements the reference count; returns `true` on the 1 to 0
    /// transition.
    pub fn release(&mut self) -> bool {
        if self.ref_count == 0 {
            return false;
        }
        self.ref_count -= 1;
        self.ref_count == 0
    }

    pub fn mark_served(&mut self, sequence: u64) {
        self.last_served = sequence;
    }

    fn refresh_due(&mut self, tasks: &TaskTable) {
        self.next_due = self
            .tasks
            .peek()
            .and_then(|id| tasks.get(id))
            .map(|task| task.scheduled());
    }
}

/// All plugin agents, indexed by [`PluginId`]. Slot table of the global
/// plugin heap, keyed by `(next due, last served, id)` so plugins with
/// equally due work take turns.
#[derive(Debug, Default)]
pub struct AgentTable {
    agents: Vec<PluginAgent>,
}

impl AgentTable {
    pub fn new(agents: Vec<PluginAgent>) -> Self {
        Self { agents }
    }

    pub fn get(&self, id: PluginId) -> Option<&PluginAgent> {
        self.agents.get(id.index())
    }

    pub fn get_mut(&mut self, id: PluginId) -> Option<&mut PluginAgent> {
        self.agents.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginAgent> {
        self.agents.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PluginAgent> {
        self.agents.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Slots<PluginId> for AgentTable {
    type Key = (DateTime<Utc>, u64, PluginId);

    fn key(&self, id: PluginId) -> Self::Key {
        match self.get(id) {
            Some(agent) => (
                agent.next_due.unwrap_or(DateTime::<Utc>::MAX_UTC),
                agent.last_served,
                id,
            ),
            None => (DateTime::<Utc>::MAX_UTC, u64::MAX, id),
        }
    }

    fn set_index(&mut self, id: PluginId, index: Option<usize>) {
        if let Some(agent) = self.get_mut(id) {
            agent.index = index;
        }
    }
}
