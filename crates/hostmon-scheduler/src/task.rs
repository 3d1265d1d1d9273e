//! Scheduled units of work.
//!
//! A [`Task`] carries its scheduling state (due time, heap position,
//! activity and dispatch flags) plus a [`TaskKind`] describing what it does
//! when performed. Performing a task never touches scheduler state: it
//! produces a [`Job`] closure that runs on a blocking execution context and
//! only talks to the plugin and the result writer.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use hostmon_common::types::{AgentResult, Request};
use hostmon_plugin::{
    Collector, Configurator, ContextProvider, ExportValue, Exporter, Meta, PluginId,
    RegexpMatcher, ResultWriter, Runner, Watcher,
};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::heap::Slots;
use crate::regexp::GlobalRegexp;

/// Work handed to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Longest accepted update interval (one week, like the `w` suffix).
const MAX_DELAY_SECS: u64 = 7 * 86_400;

/// Identifier assigned at creation; increasing, so it doubles as the FIFO
/// tie-breaker between tasks due at the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Item update interval in whole seconds.
///
/// # Examples
///
/// ```
/// use hostmon_scheduler::task::Delay;
///
/// assert_eq!("30".parse::<Delay>().unwrap().secs(), 30);
/// assert_eq!("5m".parse::<Delay>().unwrap().secs(), 300);
/// assert!("0".parse::<Delay>().is_err());
/// assert!("1y".parse::<Delay>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay(u64);

impl Delay {
    pub fn from_secs(secs: u64) -> Result<Self, TaskError> {
        if secs == 0 || secs > MAX_DELAY_SECS {
            return Err(TaskError::InvalidInterval(secs.to_string()));
        }
        Ok(Self(secs))
    }

    pub fn secs(self) -> u64 {
        self.0
    }

    /// Next check time after `now`, aligned on the interval and spread by
    /// item ID so items sharing a delay don't all fire on the same second.
    pub fn next_check(self, itemid: u64, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.0 as i64;
        let now_secs = now.timestamp();
        let offset = (itemid % self.0) as i64;
        let mut next = delay * now_secs.div_euclid(delay) + offset;
        while next <= now_secs {
            next += delay;
        }
        Utc.timestamp_opt(next, 0)
            .single()
            .unwrap_or(now + Duration::seconds(delay))
    }
}

impl FromStr for Delay {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TaskError::InvalidInterval(s.to_string());
        let trimmed = s.trim();
        let (digits, multiplier) = match trimmed.char_indices().last() {
            Some((pos, 's')) => (&trimmed[..pos], 1),
            Some((pos, 'm')) => (&trimmed[..pos], 60),
            Some((pos, 'h')) => (&trimmed[..pos], 3_600),
            Some((pos, 'd')) => (&trimmed[..pos], 86_400),
            Some((pos, 'w')) => (&trimmed[..pos], 7 * 86_400),
            Some(_) => (trimmed, 1),
            None => return Err(invalid()),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let secs = value.checked_mul(multiplier).ok_or_else(invalid)?;
        Delay::from_secs(secs).map_err(|_| invalid())
    }
}

/// Where a task is in its lifecycle. A retired task is simply removed from
/// the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued in its plugin's heap.
    Pending,
    /// Handed to an execution context, holding capacity until finished.
    Dispatched,
}

/// A client's active check served by an [`Exporter`].
pub struct ExporterItem {
    pub client_id: u64,
    pub itemid: u64,
    /// Key after alias resolution.
    pub key: String,
    pub name: String,
    pub params: Vec<String>,
    pub delay: Delay,
    /// Last time the owning client confirmed the item in a batch.
    pub updated: DateTime<Utc>,
    pub ttl: Duration,
    pub output: Arc<dyn ResultWriter>,
    pub meta: Arc<Meta>,
}

/// A one-shot check on behalf of a passive request.
pub struct DirectCheck {
    pub key: String,
    pub name: String,
    pub params: Vec<String>,
    pub output: Arc<dyn ResultWriter>,
}

/// The complete request set of one client for one watcher plugin.
pub struct WatchBatch {
    pub client_id: u64,
    pub requests: Vec<Request>,
    pub output: Arc<dyn ResultWriter>,
}

pub enum TaskKind {
    Exporter(ExporterItem),
    Direct(DirectCheck),
    Collector(Arc<dyn Collector>),
    Starter(Arc<dyn Runner>),
    Stopper(Arc<dyn Runner>),
    Watcher(Arc<dyn Watcher>, WatchBatch),
    Configurator(Arc<dyn Configurator>, HashMap<String, String>),
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Exporter(_) => "exporter",
            TaskKind::Direct(_) => "direct",
            TaskKind::Collector(_) => "collector",
            TaskKind::Starter(_) => "starter",
            TaskKind::Stopper(_) => "stopper",
            TaskKind::Watcher(..) => "watcher",
            TaskKind::Configurator(..) => "configurator",
        }
    }

    /// Exporters and direct checks share the plugin; everything else
    /// occupies its whole capacity.
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, TaskKind::Exporter(_) | TaskKind::Direct(_))
    }
}

pub struct Task {
    id: TaskId,
    plugin: PluginId,
    scheduled: DateTime<Utc>,
    weight: u32,
    index: Option<usize>,
    active: bool,
    state: TaskState,
    kind: TaskKind,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn plugin(&self) -> PluginId {
        self.plugin
    }

    pub fn scheduled(&self) -> DateTime<Utc> {
        self.scheduled
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Position in the owning plugin's heap, `None` unless pending.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut TaskKind {
        &mut self.kind
    }

    pub(crate) fn set_scheduled(&mut self, scheduled: DateTime<Utc>) {
        self.scheduled = scheduled;
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Marks the task for retirement. Returns `false` if it was already
    /// inactive.
    pub(crate) fn deactivate(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.kind, TaskKind::Exporter(_) | TaskKind::Collector(_))
    }

    /// Moves the due time to the next period.
    ///
    /// # Errors
    ///
    /// [`TaskError::Expired`] when an exporter item was not refreshed by its
    /// client within its TTL, [`TaskError::OneShot`] for non-recurring tasks.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        match &self.kind {
            TaskKind::Exporter(item) => {
                if now - item.updated > item.ttl {
                    return Err(TaskError::Expired);
                }
                self.scheduled = item.delay.next_check(item.itemid, now);
                Ok(())
            }
            TaskKind::Collector(collector) => {
                let period = collector.period().max(1) as i64;
                let next = period * (now.timestamp().div_euclid(period) + 1);
                self.scheduled = Utc
                    .timestamp_opt(next, 0)
                    .single()
                    .unwrap_or(now + Duration::seconds(period));
                Ok(())
            }
            _ => Err(TaskError::OneShot),
        }
    }

    /// Writer and item ID that receive the value of this task, for tasks
    /// that check an item.
    pub fn result_target(&self) -> Option<(Arc<dyn ResultWriter>, u64)> {
        match &self.kind {
            TaskKind::Exporter(item) => Some((Arc::clone(&item.output), item.itemid)),
            TaskKind::Direct(check) => Some((Arc::clone(&check.output), 0)),
            _ => None,
        }
    }

    /// Builds the job that carries out this task. The job owns clones of
    /// everything it needs, so the task may be rescheduled or dropped while
    /// the job is still running.
    pub fn perform(&self, exporter: Option<Arc<dyn Exporter>>, regexp: Arc<GlobalRegexp>) -> Job {
        let task = self.id;
        match &self.kind {
            TaskKind::Exporter(item) => {
                let ctx = TaskContext {
                    client_id: item.client_id,
                    item_id: item.itemid,
                    output: Arc::clone(&item.output),
                    meta: Arc::clone(&item.meta),
                    regexp,
                };
                let name = item.name.clone();
                let params = item.params.clone();
                Box::new(move || export(exporter, &name, &params, &ctx))
            }
            TaskKind::Direct(check) => {
                let ctx = TaskContext {
                    client_id: hostmon_common::id::SINGLE_CHECK_CLIENT_ID,
                    item_id: 0,
                    output: Arc::clone(&check.output),
                    meta: Arc::new(Meta::default()),
                    regexp,
                };
                let name = check.name.clone();
                let params = check.params.clone();
                Box::new(move || export(exporter, &name, &params, &ctx))
            }
            TaskKind::Collector(collector) => {
                let collector = Arc::clone(collector);
                Box::new(move || {
                    if let Err(e) = collector.collect() {
                        warn!(task = %task, error = %e, "Collector failed");
                    }
                })
            }
            TaskKind::Starter(runner) => {
                let runner = Arc::clone(runner);
                Box::new(move || runner.start())
            }
            TaskKind::Stopper(runner) => {
                let runner = Arc::clone(runner);
                Box::new(move || runner.stop())
            }
            TaskKind::Watcher(watcher, batch) => {
                let watcher = Arc::clone(watcher);
                let requests = batch.requests.clone();
                let ctx = TaskContext {
                    client_id: batch.client_id,
                    item_id: 0,
                    output: Arc::clone(&batch.output),
                    meta: Arc::new(Meta::default()),
                    regexp,
                };
                Box::new(move || watcher.watch(&requests, &ctx))
            }
            TaskKind::Configurator(configurator, options) => {
                let configurator = Arc::clone(configurator);
                let options = options.clone();
                Box::new(move || configurator.configure(&options))
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("kind", &self.kind.name())
            .field("scheduled", &self.scheduled)
            .field("weight", &self.weight)
            .field("index", &self.index)
            .field("active", &self.active)
            .field("state", &self.state)
            .finish()
    }
}

fn export(exporter: Option<Arc<dyn Exporter>>, name: &str, params: &[String], ctx: &TaskContext) {
    let itemid = ctx.item_id;
    let Some(exporter) = exporter else {
        ctx.output.write(AgentResult::not_supported(itemid, "Unsupported item key."));
        return;
    };
    let result = match exporter.export(name, params, ctx) {
        Ok(Some(ExportValue::Results(results))) => {
            for mut result in results {
                result.itemid = itemid;
                ctx.output.write(result);
            }
            return;
        }
        Ok(Some(value)) => AgentResult::value(itemid, value.to_string()),
        Ok(None) => {
            debug!(key = name, "Exporter returned no value");
            return;
        }
        Err(e) => AgentResult::not_supported(itemid, e.to_string()),
    };
    ctx.output.write(result);
}

/// [`ContextProvider`] handed to exporters and watchers.
struct TaskContext {
    client_id: u64,
    item_id: u64,
    output: Arc<dyn ResultWriter>,
    meta: Arc<Meta>,
    regexp: Arc<GlobalRegexp>,
}

impl ContextProvider for TaskContext {
    fn client_id(&self) -> u64 {
        self.client_id
    }

    fn item_id(&self) -> u64 {
        self.item_id
    }

    fn output(&self) -> Arc<dyn ResultWriter> {
        Arc::clone(&self.output)
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn global_regexp(&self) -> &dyn RegexpMatcher {
        self.regexp.as_ref()
    }
}

/// Owner of all live tasks. Acts as the slot table of every plugin's task
/// heap, keyed by `(due time, creation order)`.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    last_id: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending, active task and returns its ID. The caller is
    /// responsible for queueing it.
    pub fn insert(
        &mut self,
        plugin: PluginId,
        scheduled: DateTime<Utc>,
        weight: u32,
        kind: TaskKind,
    ) -> TaskId {
        self.last_id += 1;
        let id = TaskId(self.last_id);
        self.tasks.insert(
            id,
            Task {
                id,
                plugin,
                scheduled,
                weight,
                index: None,
                active: true,
                state: TaskState::Pending,
                kind,
            },
        );
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

impl Slots<TaskId> for TaskTable {
    type Key = (DateTime<Utc>, TaskId);

    fn key(&self, id: TaskId) -> Self::Key {
        let scheduled = self
            .tasks
            .get(&id)
            .map(|t| t.scheduled)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (scheduled, id)
    }

    fn set_index(&mut self, id: TaskId, index: Option<usize>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.index = index;
        }
    }
}
