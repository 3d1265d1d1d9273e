//! The scheduling authority.
//!
//! [`Manager`] owns both heap levels, every task, the client table and the
//! plugin reference counts. All of its methods are synchronous and take the
//! current time explicitly; [`Manager::start`] moves it into a tokio task
//! that drains a command channel, dispatches due tasks to blocking
//! execution contexts and feeds their completions back in. Nothing else
//! mutates scheduling state.

mod query;
mod service;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hostmon_common::id::SINGLE_CHECK_CLIENT_ID;
use hostmon_common::itemutil::parse_key;
use hostmon_common::types::{AgentResult, Request};
use hostmon_plugin::{PluginError, PluginId, PluginRegistry, ResultWriter, Runner};
use tracing::{debug, info, trace};

use crate::agent::{AgentTable, PluginAgent};
use crate::alias::AliasTable;
use crate::client::Client;
use crate::error::SchedulerError;
use crate::heap::IndexedHeap;
use crate::regexp::{Expression, GlobalRegexp};
use crate::task::{
    Delay, DirectCheck, ExporterItem, Job, Task, TaskId, TaskKind, TaskState, TaskTable,
    WatchBatch,
};

pub use service::ManagerHandle;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound for one task execution.
    pub timeout: std::time::Duration,
    /// Exporter tasks not confirmed by a batch within this window retire.
    pub item_ttl: Duration,
    /// Idle time after which a plugin used only by single checks is released.
    pub plugin_ttl: Duration,
    pub housekeeping_interval: std::time::Duration,
    /// Per-plugin options handed to Configurators, keyed by plugin name.
    pub plugin_options: HashMap<String, HashMap<String, String>>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(3),
            item_ttl: Duration::seconds(3600),
            plugin_ttl: Duration::seconds(3600),
            housekeeping_interval: std::time::Duration::from_secs(60),
            plugin_options: HashMap::new(),
        }
    }
}

/// A task popped for execution.
pub struct Dispatch {
    pub task: TaskId,
    pub plugin: PluginId,
    pub kind: &'static str,
    pub job: Job,
    /// Where a timeout of an item check is reported.
    pub report_to: Option<(Arc<dyn ResultWriter>, u64)>,
}

struct Resolved {
    plugin: PluginId,
    key: String,
    name: String,
    params: Vec<String>,
}

/// Output of the single-check client. Direct checks carry their own writer.
struct Discard;

impl ResultWriter for Discard {
    fn write(&self, _result: AgentResult) {}

    fn flush(&self) {}

    fn slots_available(&self) -> usize {
        0
    }

    fn persist_slots_available(&self) -> usize {
        0
    }
}

pub struct Manager {
    registry: PluginRegistry,
    agents: AgentTable,
    plugin_heap: IndexedHeap<PluginId>,
    tasks: TaskTable,
    clients: HashMap<u64, Client>,
    collectors: HashMap<PluginId, TaskId>,
    aliases: AliasTable,
    regexp: Arc<GlobalRegexp>,
    options: SchedulerOptions,
    served: u64,
}

impl Manager {
    /// Builds the manager and queues a configuration task for every plugin
    /// offering a Configurator.
    pub fn new(registry: PluginRegistry, aliases: AliasTable, options: SchedulerOptions) -> Self {
        let agents = registry
            .iter()
            .map(|(id, plugin)| PluginAgent::new(id, Arc::clone(plugin)))
            .collect();
        let mut manager = Self {
            registry,
            agents: AgentTable::new(agents),
            plugin_heap: IndexedHeap::new(),
            tasks: TaskTable::new(),
            clients: HashMap::new(),
            collectors: HashMap::new(),
            aliases,
            regexp: Arc::new(GlobalRegexp::default()),
            options,
            served: 0,
        };
        manager.configure_plugins(Utc::now());
        manager
    }

    fn configure_plugins(&mut self, now: DateTime<Utc>) {
        let pending: Vec<_> = self
            .agents
            .iter()
            .filter_map(|agent| {
                let plugin = agent.plugin();
                let configurator = Arc::clone(plugin.configurator()?);
                let options = self
                    .options
                    .plugin_options
                    .get(plugin.name())
                    .cloned()
                    .unwrap_or_default();
                Some((agent.id(), plugin.capacity(), configurator, options))
            })
            .collect();
        for (id, weight, configurator, options) in pending {
            self.enqueue(id, now, weight, TaskKind::Configurator(configurator, options));
        }
    }

    pub fn agent(&self, id: PluginId) -> Option<&PluginAgent> {
        self.agents.get(id)
    }

    pub fn find_plugin(&self, name: &str) -> Option<PluginId> {
        self.registry.find_by_name(name)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Exporter task serving `itemid` for `client_id`.
    pub fn item_task(&self, client_id: u64, itemid: u64) -> Option<TaskId> {
        self.clients.get(&client_id)?.items.get(&itemid).copied()
    }

    pub fn has_client(&self, client_id: u64) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn regexp(&self) -> &Arc<GlobalRegexp> {
        &self.regexp
    }

    /// Earliest due time among plugins that can take work.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.plugin_heap
            .peek()
            .and_then(|id| self.agents.get(id))
            .and_then(PluginAgent::next_due)
    }

    fn resolve(&self, raw: &str) -> Result<Resolved, PluginError> {
        let key = self.aliases.resolve(raw).into_owned();
        let (name, params) = parse_key(&key)
            .map_err(|e| PluginError::unsupported(format!("Invalid item key format: {e}.")))?;
        let plugin = self
            .registry
            .find_by_metric(&name)
            .ok_or_else(|| PluginError::unsupported("Unknown metric."))?;
        Ok(Resolved {
            plugin,
            key,
            name,
            params,
        })
    }

    /// Replaces the client's request set.
    ///
    /// New items get exporter tasks, known items are refreshed (and moved
    /// if their key or interval changed), items missing from the batch are
    /// deactivated. Watch-style requests are grouped per plugin and
    /// delivered in one watcher task when the set changed. Requests that
    /// cannot be scheduled are answered with a "not supported" result on
    /// `output`.
    pub fn update(
        &mut self,
        client_id: u64,
        output: Arc<dyn ResultWriter>,
        requests: &[Request],
        now: DateTime<Utc>,
    ) {
        let mut client = self.clients.remove(&client_id).unwrap_or_else(|| {
            info!(client_id, "Client registered");
            Client::new(client_id, Arc::clone(&output), now)
        });
        client.output = Arc::clone(&output);
        client.updated = now;

        let mut seen_items = HashSet::new();
        let mut used_plugins = HashSet::new();
        let mut watches: HashMap<PluginId, Vec<Request>> = HashMap::new();

        for request in requests {
            let resolved = match self.resolve(&request.key) {
                Ok(resolved) => resolved,
                Err(e) => {
                    debug!(client_id, key = %request.key, error = %e, "Rejected request");
                    output.write(AgentResult::not_supported(request.itemid, e.to_string()));
                    continue;
                }
            };
            let id = resolved.plugin;
            let Some(plugin) = self.agents.get(id).map(|a| Arc::clone(a.plugin())) else {
                continue;
            };

            if plugin.watcher().is_some() {
                self.reference_plugin(&mut client, id, now, &mut used_plugins);
                watches.entry(id).or_default().push(Request {
                    key: resolved.key,
                    ..request.clone()
                });
                continue;
            }
            if plugin.exporter().is_none() {
                output.write(AgentResult::not_supported(request.itemid, "Unsupported item key."));
                continue;
            }
            let delay = match request.delay.parse::<Delay>() {
                Ok(delay) => delay,
                Err(e) => {
                    output.write(AgentResult::not_supported(request.itemid, e.to_string()));
                    continue;
                }
            };

            self.reference_plugin(&mut client, id, now, &mut used_plugins);
            seen_items.insert(request.itemid);
            self.upsert_exporter(&mut client, request, resolved, delay, now);
        }

        let stale: Vec<TaskId> = client
            .items
            .iter()
            .filter(|(itemid, _)| !seen_items.contains(*itemid))
            .map(|(_, task)| *task)
            .collect();
        client.items.retain(|itemid, _| seen_items.contains(itemid));
        for task in stale {
            self.deactivate_task(task);
        }

        let mut watch_plugins: Vec<PluginId> =
            client.watches.keys().chain(watches.keys()).copied().collect();
        watch_plugins.sort();
        watch_plugins.dedup();
        for id in watch_plugins {
            let requests = watches.remove(&id).unwrap_or_default();
            if client.watches.get(&id) == Some(&requests) {
                continue;
            }
            self.enqueue_watch(id, client_id, requests.clone(), Arc::clone(&output), now);
            if requests.is_empty() {
                client.watches.remove(&id);
            } else {
                client.watches.insert(id, requests);
            }
        }

        let unused: Vec<PluginId> = client
            .plugins
            .keys()
            .filter(|id| !used_plugins.contains(*id))
            .copied()
            .collect();
        for id in unused {
            client.plugins.remove(&id);
            self.release_plugin(id, now);
        }

        trace!(client_id, items = client.items.len(), "Client batch applied");
        self.clients.insert(client_id, client);
    }

    fn reference_plugin(
        &mut self,
        client: &mut Client,
        id: PluginId,
        now: DateTime<Utc>,
        used: &mut HashSet<PluginId>,
    ) {
        used.insert(id);
        if client.plugins.insert(id, now).is_none() {
            self.acquire_plugin(id, now);
        }
    }

    fn upsert_exporter(
        &mut self,
        client: &mut Client,
        request: &Request,
        resolved: Resolved,
        delay: Delay,
        now: DateTime<Utc>,
    ) {
        let itemid = request.itemid;
        if let Some(&id) = client.items.get(&itemid) {
            if self.refresh_exporter(id, client, &resolved, delay, now) {
                return;
            }
            self.deactivate_task(id);
        }

        let meta = Arc::new(hostmon_plugin::Meta::new(
            request.last_log_size.unwrap_or(0),
            request.mtime.unwrap_or(0),
        ));
        let item = ExporterItem {
            client_id: client.id,
            itemid,
            key: resolved.key,
            name: resolved.name,
            params: resolved.params,
            delay,
            updated: now,
            ttl: self.options.item_ttl,
            output: Arc::clone(&client.output),
            meta,
        };
        let id = self.enqueue(
            resolved.plugin,
            delay.next_check(itemid, now),
            1,
            TaskKind::Exporter(item),
        );
        client.items.insert(itemid, id);
    }

    /// Refreshes an existing exporter task in place. Returns `false` when
    /// the task cannot be reused (retired, inactive or now served by a
    /// different plugin).
    fn refresh_exporter(
        &mut self,
        id: TaskId,
        client: &Client,
        resolved: &Resolved,
        delay: Delay,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        if !task.is_active() || task.plugin() != resolved.plugin {
            return false;
        }
        let TaskKind::Exporter(item) = task.kind_mut() else {
            return false;
        };

        item.updated = now;
        item.output = Arc::clone(&client.output);
        let changed = item.key != resolved.key || item.delay != delay;
        if changed {
            item.key = resolved.key.clone();
            item.name = resolved.name.clone();
            item.params = resolved.params.clone();
            item.delay = delay;
            let itemid = item.itemid;
            task.set_scheduled(delay.next_check(itemid, now));
        }

        // dispatched tasks pick the new schedule up on completion
        if let (true, Some(index)) = (changed, task.index()) {
            if let Some(agent) = self.agents.get_mut(resolved.plugin) {
                agent.update_task(&mut self.tasks, index);
            }
            self.requeue_plugin(resolved.plugin);
        }
        true
    }

    fn enqueue_watch(
        &mut self,
        id: PluginId,
        client_id: u64,
        requests: Vec<Request>,
        output: Arc<dyn ResultWriter>,
        now: DateTime<Utc>,
    ) {
        let Some(agent) = self.agents.get(id) else {
            return;
        };
        let Some(watcher) = agent.plugin().watcher().cloned() else {
            return;
        };
        let weight = agent.capacity();
        let batch = WatchBatch {
            client_id,
            requests,
            output,
        };
        self.enqueue(id, now, weight, TaskKind::Watcher(watcher, batch));
    }

    /// Schedules a one-shot check of `key` for the single-check client.
    /// The result is written to `output`.
    ///
    /// # Errors
    ///
    /// Fails with an "unsupported" reason if the key does not resolve to an
    /// exporter.
    pub fn perform_direct(
        &mut self,
        key: &str,
        output: Arc<dyn ResultWriter>,
        now: DateTime<Utc>,
    ) -> Result<TaskId, PluginError> {
        let resolved = self.resolve(key)?;
        let id = resolved.plugin;
        let exports = self
            .agents
            .get(id)
            .is_some_and(|agent| agent.plugin().exporter().is_some());
        if !exports {
            return Err(PluginError::unsupported("Unsupported item key."));
        }

        let mut client = self
            .clients
            .remove(&SINGLE_CHECK_CLIENT_ID)
            .unwrap_or_else(|| Client::new(SINGLE_CHECK_CLIENT_ID, Arc::new(Discard), now));
        client.updated = now;
        if client.plugins.insert(id, now).is_none() {
            self.acquire_plugin(id, now);
        }
        self.clients.insert(SINGLE_CHECK_CLIENT_ID, client);

        let check = DirectCheck {
            key: resolved.key,
            name: resolved.name,
            params: resolved.params,
            output,
        };
        Ok(self.enqueue(id, now, 1, TaskKind::Direct(check)))
    }

    /// Drops a client: its items are deactivated, its watch subscriptions
    /// withdrawn and its plugin references released.
    pub fn unregister(&mut self, client_id: u64, now: DateTime<Utc>) {
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };
        for task in client.items.values() {
            self.deactivate_task(*task);
        }
        for id in client.watches.keys() {
            self.enqueue_watch(*id, client_id, Vec::new(), Arc::clone(&client.output), now);
        }
        for id in client.plugins.keys() {
            self.release_plugin(*id, now);
        }
        info!(client_id, "Client unregistered");
    }

    /// Expires batch clients that stopped refreshing and releases plugins
    /// idle for single checks.
    pub fn housekeeping(&mut self, now: DateTime<Utc>) {
        let expired: Vec<u64> = self
            .clients
            .values()
            .filter(|c| c.id != SINGLE_CHECK_CLIENT_ID && now - c.updated > self.options.item_ttl)
            .map(|c| c.id)
            .collect();
        for client_id in expired {
            info!(client_id, "Client expired");
            self.unregister(client_id, now);
        }

        if let Some(mut single) = self.clients.remove(&SINGLE_CHECK_CLIENT_ID) {
            let idle: Vec<PluginId> = single
                .plugins
                .iter()
                .filter(|(_, last_used)| now - **last_used > self.options.plugin_ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in idle {
                single.plugins.remove(&id);
                self.release_plugin(id, now);
            }
            if !single.plugins.is_empty() {
                self.clients.insert(SINGLE_CHECK_CLIENT_ID, single);
            }
        }
    }

    /// Replaces the global regular expression bundle unless it already
    /// holds the same expressions. Running tasks keep the bundle they
    /// started with.
    ///
    /// # Errors
    ///
    /// Fails if an expression does not compile; the current bundle stays.
    pub fn update_regexps(&mut self, expressions: Vec<Expression>) -> Result<(), SchedulerError> {
        if self.regexp.same_expressions(&expressions) {
            return Ok(());
        }
        let bundle = GlobalRegexp::new(expressions)?;
        debug!(count = bundle.len(), "Global regular expressions updated");
        self.regexp = Arc::new(bundle);
        Ok(())
    }

    fn acquire_plugin(&mut self, id: PluginId, now: DateTime<Utc>) {
        let Some(agent) = self.agents.get_mut(id) else {
            return;
        };
        if !agent.acquire() {
            return;
        }
        let plugin = Arc::clone(agent.plugin());
        info!(plugin = plugin.name(), "Plugin activated");

        let weight = plugin.capacity();
        if let Some(runner) = plugin.runner() {
            self.enqueue(id, now, weight, TaskKind::Starter(Arc::clone(runner)));
        }
        if let Some(collector) = plugin.collector() {
            let task = self.enqueue(id, now, weight, TaskKind::Collector(Arc::clone(collector)));
            self.collectors.insert(id, task);
        }
    }

    fn release_plugin(&mut self, id: PluginId, now: DateTime<Utc>) {
        let Some(agent) = self.agents.get_mut(id) else {
            return;
        };
        if !agent.release() {
            return;
        }
        let plugin = Arc::clone(agent.plugin());
        info!(plugin = plugin.name(), "Plugin deactivated");

        if let Some(task) = self.collectors.remove(&id) {
            self.deactivate_task(task);
        }
        if let Some(runner) = plugin.runner() {
            self.enqueue(id, now, plugin.capacity(), TaskKind::Stopper(Arc::clone(runner)));
        }
    }

    fn enqueue(
        &mut self,
        id: PluginId,
        scheduled: DateTime<Utc>,
        weight: u32,
        kind: TaskKind,
    ) -> TaskId {
        let task = self.tasks.insert(id, scheduled, weight, kind);
        if let Some(agent) = self.agents.get_mut(id) {
            agent.enqueue_task(&mut self.tasks, task);
        }
        self.requeue_plugin(id);
        task
    }

    /// Puts the agent where it belongs in the plugin heap: out of it when
    /// it has no pending task, repositioned when it is in, pushed when it
    /// has work that fits its free capacity.
    fn requeue_plugin(&mut self, id: PluginId) {
        let Some(agent) = self.agents.get(id) else {
            return;
        };
        let has_work = agent.peek_task().is_some();
        match agent.index() {
            Some(index) if has_work => self.plugin_heap.fix(&mut self.agents, index),
            Some(index) => {
                self.plugin_heap.remove(&mut self.agents, index);
            }
            None if has_work && agent.has_capacity(&self.tasks) => {
                self.plugin_heap.push(&mut self.agents, id);
            }
            None => {}
        }
    }

    /// Pops every task due at `now` that fits its plugin's free capacity,
    /// reserving the capacity and building its job.
    ///
    /// A plugin whose next task does not fit is taken out of the plugin heap
    /// and skipped; it is pushed back when a completion frees capacity.
    pub fn dispatch(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let mut ready = Vec::new();
        while let Some(id) = self.plugin_heap.peek() {
            match self.agents.get(id).and_then(PluginAgent::next_due) {
                Some(due) if due > now => break,
                _ => {}
            }
            self.plugin_heap.pop(&mut self.agents);

            let Some(agent) = self.agents.get_mut(id) else {
                continue;
            };
            if !agent.has_capacity(&self.tasks) {
                trace!(plugin = agent.plugin().name(), "Plugin at capacity, deferring");
                continue;
            }
            let Some(task_id) = agent.pop_task(&mut self.tasks) else {
                continue;
            };
            let Some(task) = self.tasks.get_mut(task_id) else {
                continue;
            };

            agent.reserve_capacity(task.weight());
            self.served += 1;
            agent.mark_served(self.served);
            task.set_state(TaskState::Dispatched);
            let exporter = agent.plugin().exporter().cloned();
            let job = task.perform(exporter, Arc::clone(&self.regexp));
            ready.push(Dispatch {
                task: task_id,
                plugin: id,
                kind: task.kind().name(),
                job,
                report_to: task.result_target(),
            });

            self.requeue_plugin(id);
        }
        ready
    }

    /// Completion of a dispatched task: releases its capacity, then either
    /// requeues it (active, recurring and rescheduled) or retires it.
    pub fn finish(&mut self, task_id: TaskId, now: DateTime<Utc>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.state() != TaskState::Dispatched {
            return;
        }
        let id = task.plugin();
        let weight = task.weight();

        let requeue = task.is_active()
            && task.is_recurring()
            && match task.reschedule(now) {
                Ok(()) => true,
                Err(e) => {
                    debug!(task = %task_id, reason = %e, "Retiring task");
                    false
                }
            };
        if requeue {
            task.set_state(TaskState::Pending);
        }

        if let Some(agent) = self.agents.get_mut(id) {
            agent.release_capacity(weight);
            if requeue {
                agent.enqueue_task(&mut self.tasks, task_id);
            }
        }
        if !requeue {
            self.retire(task_id);
        }
        self.requeue_plugin(id);
    }

    /// Marks a task inactive. Pending tasks leave their heap and retire at
    /// once; dispatched tasks retire on completion. Repeated calls are
    /// no-ops.
    pub fn deactivate_task(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if !task.deactivate() || task.state() == TaskState::Dispatched {
            return;
        }
        let id = task.plugin();
        if let Some(index) = task.index() {
            if let Some(agent) = self.agents.get_mut(id) {
                agent.remove_task(&mut self.tasks, index);
            }
        }
        self.retire(task_id);
        self.requeue_plugin(id);
    }

    fn retire(&mut self, task_id: TaskId) {
        let Some(task) = self.tasks.remove(task_id) else {
            return;
        };
        trace!(task = %task_id, kind = task.kind().name(), "Task retired");
        match task.kind() {
            TaskKind::Exporter(item) => {
                if let Some(client) = self.clients.get_mut(&item.client_id) {
                    if client.items.get(&item.itemid) == Some(&task_id) {
                        client.items.remove(&item.itemid);
                    }
                }
            }
            TaskKind::Collector(_) => {
                if self.collectors.get(&task.plugin()) == Some(&task_id) {
                    self.collectors.remove(&task.plugin());
                }
            }
            _ => {}
        }
    }

    /// Runners of plugins that are still active, to be stopped on shutdown.
    fn active_runners(&self) -> Vec<(String, Arc<dyn Runner>)> {
        self.agents
            .iter()
            .filter(|agent| agent.active())
            .filter_map(|agent| {
                let plugin = agent.plugin();
                plugin
                    .runner()
                    .map(|runner| (plugin.name().to_string(), Arc::clone(runner)))
            })
            .collect()
    }
}
