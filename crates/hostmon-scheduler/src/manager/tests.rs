use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use hostmon_common::types::{AgentResult, Request};
use hostmon_plugin::{
    Collector, Configurator, ContextProvider, ExportValue, Exporter, Plugin, PluginError,
    PluginId, PluginRegistry, ResultWriter, Runner, Watcher,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::task::{DirectCheck, TaskKind, TaskState};

#[derive(Default)]
struct Sink(Mutex<Vec<AgentResult>>);

impl Sink {
    fn results(&self) -> Vec<AgentResult> {
        self.0.lock().unwrap().clone()
    }
}

impl ResultWriter for Sink {
    fn write(&self, result: AgentResult) {
        self.0.lock().unwrap().push(result);
    }
    fn flush(&self) {}
    fn slots_available(&self) -> usize {
        100
    }
    fn persist_slots_available(&self) -> usize {
        100
    }
}

struct Echo;

impl Exporter for Echo {
    fn export(
        &self,
        key: &str,
        params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        Ok(Some(format!("{key}[{}]", params.join(",")).into()))
    }
}

#[derive(Default)]
struct Lifecycle {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Runner for Lifecycle {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Trap(Mutex<Vec<Vec<String>>>);

impl Watcher for Trap {
    fn watch(&self, requests: &[Request], _ctx: &dyn ContextProvider) {
        let keys = requests.iter().map(|r| r.key.clone()).collect();
        self.0.lock().unwrap().push(keys);
    }
}

#[derive(Default)]
struct Options(Mutex<Option<HashMap<String, String>>>);

impl Configurator for Options {
    fn configure(&self, options: &HashMap<String, String>) {
        *self.0.lock().unwrap() = Some(options.clone());
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn echo_plugin(name: &str, capacity: u32, keys: &[&str]) -> Plugin {
    keys.iter()
        .fold(Plugin::builder(name).capacity(capacity), |b, key| b.metric(*key, "Echo."))
        .exporter(Arc::new(Echo))
        .build()
}

fn manager(plugins: Vec<Plugin>) -> Manager {
    manager_with(plugins, SchedulerOptions::default())
}

fn manager_with(plugins: Vec<Plugin>, options: SchedulerOptions) -> Manager {
    let mut registry = PluginRegistry::new();
    for plugin in plugins {
        registry.register(plugin).unwrap();
    }
    Manager::new(registry, AliasTable::new(), options)
}

fn direct(sink: &Arc<Sink>) -> TaskKind {
    TaskKind::Direct(DirectCheck {
        key: "test.echo".into(),
        name: "test.echo".into(),
        params: Vec::new(),
        output: sink.clone(),
    })
}

fn used(m: &Manager, id: PluginId) -> u32 {
    m.agent(id).unwrap().used_capacity()
}

fn run(dispatches: Vec<Dispatch>) -> Vec<TaskId> {
    dispatches
        .into_iter()
        .map(|d| {
            (d.job)();
            d.task
        })
        .collect()
}

#[test]
fn capacity_defers_task_that_does_not_fit() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let p = m.find_plugin("P").unwrap();
    let sink = Arc::new(Sink::default());
    let now = at(1000);

    let heavy = m.enqueue(p, now, 6, direct(&sink));
    let light = m.enqueue(p, now, 5, direct(&sink));

    assert_eq!(run(m.dispatch(now)), vec![heavy]);
    assert_eq!(used(&m, p), 6);
    assert!(m.dispatch(now).is_empty());
    assert!(m.next_due().is_none());

    m.finish(heavy, now);
    assert_eq!(used(&m, p), 0);
    assert!(m.task(heavy).is_none());

    assert_eq!(run(m.dispatch(now)), vec![light]);
    assert_eq!(used(&m, p), 5);
    m.finish(light, now);
    assert_eq!(used(&m, p), 0);
    assert_eq!(sink.results().len(), 2);
}

#[test]
fn saturated_plugin_does_not_block_others() {
    let mut m = manager(vec![
        echo_plugin("Busy", 1, &["busy.echo"]),
        echo_plugin("Free", 10, &["free.echo"]),
    ]);
    let busy = m.find_plugin("Busy").unwrap();
    let free = m.find_plugin("Free").unwrap();
    let sink = Arc::new(Sink::default());

    let first = m.enqueue(busy, at(10), 1, direct(&sink));
    m.enqueue(busy, at(10), 1, direct(&sink));
    let other = m.enqueue(free, at(20), 1, direct(&sink));

    assert_eq!(run(m.dispatch(at(30))), vec![first, other]);
    assert_eq!(used(&m, busy), 1);
    assert_eq!(used(&m, free), 1);
}

#[test]
fn equally_due_plugins_take_turns() {
    let mut m = manager(vec![
        echo_plugin("A", 10, &["a.echo"]),
        echo_plugin("B", 10, &["b.echo"]),
    ]);
    let a = m.find_plugin("A").unwrap();
    let b = m.find_plugin("B").unwrap();
    let sink = Arc::new(Sink::default());

    let a1 = m.enqueue(a, at(5), 1, direct(&sink));
    let a2 = m.enqueue(a, at(5), 1, direct(&sink));
    let b1 = m.enqueue(b, at(5), 1, direct(&sink));
    let b2 = m.enqueue(b, at(5), 1, direct(&sink));

    let order: Vec<TaskId> = m.dispatch(at(5)).into_iter().map(|d| d.task).collect();
    assert_eq!(order, vec![a1, b1, a2, b2]);
}

#[test]
fn double_deactivation_releases_capacity_once() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let p = m.find_plugin("P").unwrap();
    let sink = Arc::new(Sink::default());

    let running = m.enqueue(p, at(0), 4, direct(&sink));
    let pending = m.enqueue(p, at(100), 4, direct(&sink));
    assert_eq!(run(m.dispatch(at(0))), vec![running]);

    m.deactivate_task(running);
    m.deactivate_task(running);
    let task = m.task(running).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);
    assert_eq!(task.index(), None);
    assert_eq!(used(&m, p), 4);

    m.finish(running, at(1));
    m.finish(running, at(1));
    m.deactivate_task(running);
    assert_eq!(used(&m, p), 0);
    assert!(m.task(running).is_none());

    assert!(m.task(pending).unwrap().index().is_some());
    m.deactivate_task(pending);
    m.deactivate_task(pending);
    assert!(m.task(pending).is_none());
    assert_eq!(m.agent(p).unwrap().task_count(), 0);
    assert!(!m.agent(p).unwrap().queued());
    assert_eq!(used(&m, p), 0);
}

#[test]
fn exporter_items_run_on_their_interval() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let sink = Arc::new(Sink::default());
    let now = at(1000);

    m.update(1, sink.clone(), &[Request::new(7, "test.echo[a,b]", "10")], now);
    let task = m.item_task(1, 7).unwrap();
    // 1000 is aligned on 10, item 7 is offset by 7 seconds
    assert_eq!(m.next_due(), Some(at(1007)));
    assert!(m.dispatch(at(1006)).is_empty());

    assert_eq!(run(m.dispatch(at(1007))), vec![task]);
    m.finish(task, at(1007));
    assert_eq!(m.task(task).unwrap().scheduled(), at(1017));
    assert_eq!(m.task(task).unwrap().state(), TaskState::Pending);

    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].itemid, 7);
    assert_eq!(results[0].value.as_deref(), Some("test.echo[a,b]"));
}

#[test]
fn batch_refresh_replaces_item_set() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let p = m.find_plugin("P").unwrap();
    let sink = Arc::new(Sink::default());

    m.update(
        1,
        sink.clone(),
        &[Request::new(1, "test.echo[1]", "30"), Request::new(2, "test.echo[2]", "30")],
        at(0),
    );
    let kept = m.item_task(1, 1).unwrap();
    let dropped = m.item_task(1, 2).unwrap();
    assert_eq!(m.agent(p).unwrap().ref_count(), 1);

    m.update(1, sink.clone(), &[Request::new(1, "test.echo[1]", "30")], at(10));
    assert_eq!(m.item_task(1, 1), Some(kept));
    assert!(m.task(dropped).is_none());
    assert_eq!(m.agent(p).unwrap().task_count(), 1);

    // interval change moves the pending task in place
    m.update(1, sink.clone(), &[Request::new(1, "test.echo[1]", "60")], at(20));
    assert_eq!(m.item_task(1, 1), Some(kept));
    assert_eq!(m.task(kept).unwrap().scheduled(), at(61));

    m.update(1, sink.clone(), &[], at(30));
    assert!(m.task(kept).is_none());
    assert!(!m.agent(p).unwrap().active());
    assert!(m.next_due().is_none());
}

#[test]
fn unschedulable_requests_are_reported_not_supported() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let sink = Arc::new(Sink::default());

    m.update(
        1,
        sink.clone(),
        &[
            Request::new(1, "no.such.key", "30"),
            Request::new(2, "test.echo[", "30"),
            Request::new(3, "test.echo", "never"),
        ],
        at(0),
    );

    let results = sink.results();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(AgentResult::is_not_supported));
    assert_eq!(results[0].error.as_deref(), Some("Unknown metric."));
    assert!(results[1].error.as_deref().unwrap().starts_with("Invalid item key format"));
    assert_eq!(results[2].error.as_deref(), Some("Invalid update interval \"never\"."));
    assert_eq!(m.task_count(), 0);
}

#[test]
fn aliases_are_resolved_before_scheduling() {
    let mut registry = PluginRegistry::new();
    registry.register(echo_plugin("P", 10, &["system.cpu.util"])).unwrap();
    let aliases = AliasTable::from_pairs([("cpu[*]", "system.cpu.util[*]")]).unwrap();
    let mut m = Manager::new(registry, aliases, SchedulerOptions::default());
    let sink = Arc::new(Sink::default());

    m.update(1, sink.clone(), &[Request::new(10, "cpu[1]", "1")], at(0));
    let task = m.item_task(1, 10).unwrap();
    match m.task(task).unwrap().kind() {
        TaskKind::Exporter(item) => {
            assert_eq!(item.key, "system.cpu.util[1]");
            assert_eq!(item.params, vec!["1"]);
        }
        _ => panic!("expected an exporter task"),
    }
}

#[test]
fn runner_starts_on_first_reference_and_stops_on_last() {
    let lifecycle = Arc::new(Lifecycle::default());
    let plugin = Plugin::builder("Svc")
        .capacity(4)
        .metric("svc.echo", "Echo.")
        .exporter(Arc::new(Echo))
        .runner(lifecycle.clone())
        .build();
    let mut m = manager(vec![plugin]);
    let p = m.find_plugin("Svc").unwrap();
    let sink = Arc::new(Sink::default());

    m.update(1, sink.clone(), &[Request::new(1, "svc.echo", "1")], at(0));
    m.update(2, sink.clone(), &[Request::new(1, "svc.echo", "1")], at(0));
    assert_eq!(m.agent(p).unwrap().ref_count(), 2);

    // the starter holds the whole plugin
    let started = m.dispatch(at(1));
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].kind, "starter");
    assert_eq!(used(&m, p), 4);
    let starter = run(started)[0];
    assert_eq!(lifecycle.starts.load(Ordering::SeqCst), 1);
    m.finish(starter, at(1));

    assert_eq!(m.dispatch(at(1)).len(), 2);

    m.unregister(1, at(2));
    assert_eq!(m.agent(p).unwrap().ref_count(), 1);
    m.unregister(2, at(2));
    assert_eq!(m.agent(p).unwrap().ref_count(), 0);
    assert!(!m.has_client(2));

    let stop: Vec<_> = m
        .tasks
        .iter()
        .filter(|t| t.kind().name() == "stopper")
        .map(|t| t.id())
        .collect();
    assert_eq!(stop.len(), 1);
}

#[test]
fn watcher_receives_request_set_changes() {
    let trap = Arc::new(Trap::default());
    let plugin = Plugin::builder("Trap")
        .metric("debug.trap", "Trap.")
        .watcher(trap.clone())
        .build();
    let mut m = manager(vec![plugin]);
    let p = m.find_plugin("Trap").unwrap();
    let sink = Arc::new(Sink::default());
    let batch = [Request::new(1, "debug.trap[9000]", "0")];

    m.update(1, sink.clone(), &batch, at(0));
    for task in run(m.dispatch(at(0))) {
        m.finish(task, at(0));
    }
    assert_eq!(*trap.0.lock().unwrap(), vec![vec!["debug.trap[9000]".to_string()]]);

    // unchanged set: nothing to deliver
    m.update(1, sink.clone(), &batch, at(1));
    assert!(m.dispatch(at(1)).is_empty());

    m.update(1, sink.clone(), &[], at(2));
    run(m.dispatch(at(2)));
    assert_eq!(trap.0.lock().unwrap().last(), Some(&Vec::new()));
    assert!(!m.agent(p).unwrap().active());
}

#[test]
fn housekeeping_expires_idle_clients_and_single_check_plugins() {
    let mut m = manager(vec![
        echo_plugin("Batch", 10, &["batch.echo"]),
        echo_plugin("Single", 10, &["single.echo"]),
    ]);
    let batch = m.find_plugin("Batch").unwrap();
    let single = m.find_plugin("Single").unwrap();
    let sink = Arc::new(Sink::default());

    m.update(5, sink.clone(), &[Request::new(1, "batch.echo", "30")], at(0));
    m.perform_direct("single.echo", sink.clone(), at(0)).unwrap();
    assert!(m.agent(single).unwrap().active());

    m.housekeeping(at(3600));
    assert!(m.has_client(5));
    assert!(m.agent(single).unwrap().active());

    m.housekeeping(at(3601));
    assert!(!m.has_client(5));
    assert!(!m.agent(batch).unwrap().active());
    assert!(!m.agent(single).unwrap().active());
    assert!(!m.has_client(hostmon_common::id::SINGLE_CHECK_CLIENT_ID));
}

#[test]
fn direct_check_rejects_unknown_keys() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let sink = Arc::new(Sink::default());
    let err = m.perform_direct("missing", sink, at(0)).unwrap_err();
    assert_eq!(err.to_string(), "Unknown metric.");
}

#[test]
fn configurators_run_at_startup() {
    let options = Arc::new(Options::default());
    let plugin = Plugin::builder("Conf")
        .metric("conf.echo", "Echo.")
        .exporter(Arc::new(Echo))
        .configurator(options.clone())
        .build();
    let mut registry = PluginRegistry::new();
    registry.register(plugin).unwrap();
    let mut settings = SchedulerOptions::default();
    settings
        .plugin_options
        .insert("Conf".into(), HashMap::from([("Timeout".to_string(), "5".to_string())]));
    let mut m = Manager::new(registry, AliasTable::new(), settings);

    let now = Utc::now() + Duration::seconds(1);
    let dispatched = m.dispatch(now);
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].kind, "configurator");
    run(dispatched);

    let received = options.0.lock().unwrap().clone().unwrap();
    assert_eq!(received.get("Timeout").map(String::as_str), Some("5"));
}

#[test]
fn metrics_query_is_sorted() {
    let m = manager(vec![
        echo_plugin("Zeta", 3, &["z.b", "z.a"]),
        echo_plugin("Alpha", 7, &["a.key"]),
    ]);

    let report = m.process_query("metrics").unwrap();
    let expected = "[Alpha]\nactive: false\ncapacity: 0/7\ntasks: 0\na.key: Echo.\n\n\
                    [Zeta]\nactive: false\ncapacity: 0/3\ntasks: 0\nz.a: Echo.\nz.b: Echo.\n\n";
    assert_eq!(report, expected);

    match m.process_query("bogus") {
        Err(SchedulerError::UnknownRequest(command)) => assert_eq!(command, "bogus"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn regexp_bundle_is_replaced_only_on_change() {
    use crate::regexp::ExpressionType;

    let mut m = manager(Vec::new());
    let expressions = vec![Expression {
        name: "errors".into(),
        body: "error".into(),
        kind: ExpressionType::Included,
        delimiter: ",".into(),
        case_sensitive: false,
    }];
    m.update_regexps(expressions.clone()).unwrap();
    let first = Arc::clone(m.regexp());
    m.update_regexps(expressions).unwrap();
    assert!(Arc::ptr_eq(&first, m.regexp()));
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn handle_runs_single_checks_and_queries() {
    let m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let (handle, join) = m.start();

    let result = handle
        .perform_check("test.echo[x]", std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.value.as_deref(), Some("test.echo[x]"));

    let missing = handle
        .perform_check("nope", std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(missing.error.as_deref(), Some("Unknown metric."));

    assert!(handle.query("metrics").await.unwrap().contains("[P]"));
    assert!(matches!(
        handle.query("bogus").await,
        Err(SchedulerError::UnknownRequest(_))
    ));

    handle.stop();
    join.await.unwrap();
    assert!(matches!(handle.query("metrics").await, Err(SchedulerError::Stopped)));
}

/// Blocks for `delay` on every call and records how many calls overlap.
struct Slow {
    delay: std::time::Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Slow {
    fn new(delay: std::time::Duration) -> Self {
        Self {
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn block(&self) {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl Collector for Slow {
    fn collect(&self) -> Result<(), PluginError> {
        self.block();
        Ok(())
    }
    fn period(&self) -> u64 {
        1
    }
}

impl Exporter for Slow {
    fn export(
        &self,
        _key: &str,
        _params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        self.block();
        Ok(Some("late".into()))
    }
}

fn short_timeout() -> SchedulerOptions {
    SchedulerOptions {
        timeout: std::time::Duration::from_millis(100),
        ..SchedulerOptions::default()
    }
}

#[tokio::test]
async fn timed_out_collector_holds_capacity_until_it_returns() {
    let slow = Arc::new(Slow::new(std::time::Duration::from_millis(1500)));
    let plugin = Plugin::builder("Slow")
        .capacity(1)
        .metric("slow.echo", "Echo.")
        .exporter(Arc::new(Echo))
        .collector(slow.clone())
        .build();
    let m = manager_with(vec![plugin], short_timeout());
    let (handle, join) = m.start();

    handle
        .update(1, Arc::new(Sink::default()), vec![Request::new(1, "slow.echo", "1")])
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2800)).await;

    handle.stop();
    join.await.unwrap();
    assert!(slow.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(slow.peak.load(Ordering::SeqCst), 1, "collector ran on top of itself");
}

#[tokio::test]
async fn timed_out_check_is_answered_and_keeps_capacity() {
    let slow = Arc::new(Slow::new(std::time::Duration::from_millis(400)));
    let plugin = Plugin::builder("Lag")
        .capacity(1)
        .metric("lag.value", "Slow value.")
        .exporter(slow.clone())
        .build();
    let m = manager_with(vec![plugin], short_timeout());
    let (handle, join) = m.start();

    let result = handle
        .perform_check("lag.value", std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.error.as_deref(), Some("Timeout while executing check."));
    assert!(handle.query("metrics").await.unwrap().contains("capacity: 1/1"));

    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
    assert!(handle.query("metrics").await.unwrap().contains("capacity: 0/1"));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);

    handle.stop();
    join.await.unwrap();
}

#[test]
fn resubmitted_batch_outlives_item_ttl() {
    let mut m = manager(vec![echo_plugin("P", 10, &["test.echo"])]);
    let sink = Arc::new(Sink::default());
    let batch = [Request::new(1, "test.echo", "30")];

    m.update(5, sink.clone(), &batch, at(0));
    let task = m.item_task(5, 1).unwrap();
    m.update(5, sink.clone(), &batch, at(1800));
    m.update(5, sink.clone(), &batch, at(3600));

    m.housekeeping(at(3601));
    m.housekeeping(at(5000));
    assert!(m.has_client(5));
    assert_eq!(m.item_task(5, 1), Some(task));

    m.housekeeping(at(7201));
    assert!(!m.has_client(5));
    assert!(m.task(task).is_none());
}

/// Checks the bookkeeping that must hold between any two operations.
fn assert_consistent(m: &Manager, running: &[TaskId]) {
    for agent in m.agents.iter() {
        let name = agent.plugin().name();
        assert!(agent.used_capacity() <= agent.capacity(), "{name} over capacity");

        let reserved: u32 = running
            .iter()
            .filter_map(|id| m.task(*id))
            .filter(|t| t.plugin() == agent.id() && t.state() == TaskState::Dispatched)
            .map(|t| t.weight())
            .sum();
        assert_eq!(agent.used_capacity(), reserved, "{name} leaked capacity");

        let in_heap = m.plugin_heap.iter().any(|id| id == agent.id());
        assert_eq!(agent.queued(), in_heap, "{name} heap position out of sync");
        if agent.queued() {
            assert!(agent.task_count() > 0, "{name} queued without work");
        }
        if agent.task_count() > 0 && agent.has_capacity(&m.tasks) {
            assert!(agent.queued(), "{name} parked although its next task fits");
        }
    }
}

#[test]
fn randomized_operations_keep_capacity_and_order() {
    let plugins = [("A", 1, "a.echo"), ("B", 4, "b.echo"), ("C", 10, "c.echo")];
    let mut rng = StdRng::seed_from_u64(0x7a5c);

    for _ in 0..20 {
        let mut m = manager(
            plugins
                .iter()
                .map(|(name, capacity, key)| echo_plugin(name, *capacity, &[*key]))
                .collect(),
        );
        let ids: Vec<(PluginId, u32)> = plugins
            .iter()
            .map(|(name, capacity, _)| (m.find_plugin(name).unwrap(), *capacity))
            .collect();
        let sink = Arc::new(Sink::default());
        let mut now = 1_000;
        let mut known: Vec<TaskId> = Vec::new();
        let mut running: Vec<TaskId> = Vec::new();

        for _ in 0..400 {
            now += rng.gen_range(0..3);
            match rng.gen_range(0..10) {
                0..=2 => {
                    let (id, capacity) = ids[rng.gen_range(0..ids.len())];
                    let scheduled = at(now + rng.gen_range(-2..6));
                    let weight = rng.gen_range(1..=capacity);
                    known.push(m.enqueue(id, scheduled, weight, direct(&sink)));
                }
                3..=5 => {
                    let mut last: HashMap<PluginId, DateTime<Utc>> = HashMap::new();
                    for d in m.dispatch(at(now)) {
                        let scheduled = m.task(d.task).unwrap().scheduled();
                        assert!(scheduled <= at(now), "dispatched before due");
                        if let Some(prev) = last.insert(d.plugin, scheduled) {
                            assert!(prev <= scheduled, "{prev} dispatched before {scheduled}");
                        }
                        running.push(d.task);
                    }
                    for (plugin, latest) in last {
                        let agent = m.agent(plugin).unwrap();
                        for pending in agent.task_ids() {
                            assert!(m.task(pending).unwrap().scheduled() >= latest);
                        }
                    }
                    for agent in m.agents.iter() {
                        if agent.has_capacity(&m.tasks) {
                            assert!(agent.next_due().map_or(true, |due| due > at(now)));
                        }
                    }
                }
                6 | 7 if !running.is_empty() => {
                    let task = running.swap_remove(rng.gen_range(0..running.len()));
                    m.finish(task, at(now));
                }
                8 if !known.is_empty() => {
                    m.deactivate_task(known[rng.gen_range(0..known.len())]);
                }
                _ => {
                    let client = rng.gen_range(1..=3);
                    let requests: Vec<Request> = (1..=6)
                        .filter_map(|itemid| {
                            if rng.gen_bool(0.5) {
                                return None;
                            }
                            let key = plugins[rng.gen_range(0..plugins.len())].2;
                            let delay = rng.gen_range(1..=5).to_string();
                            Some(Request::new(itemid, key, delay))
                        })
                        .collect();
                    m.update(client, sink.clone(), &requests, at(now));
                    known.extend((1..=6).filter_map(|itemid| m.item_task(client, itemid)));
                }
            }
            assert_consistent(&m, &running);
        }
    }
}
