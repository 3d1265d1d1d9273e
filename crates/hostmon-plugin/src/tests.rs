use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hostmon_common::itemutil::parse_key;
use hostmon_common::types::{AgentResult, Request};

use crate::watch::{EventFilter, EventProvider, EventSource, EventValue, WatchManager};
use crate::{
    ContextProvider, ExportValue, Exporter, Plugin, PluginError, PluginRegistry, RegistryError,
    ResultWriter,
};

struct Constant;

impl Exporter for Constant {
    fn export(
        &self,
        _key: &str,
        _params: &[String],
        _ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        Ok(Some(ExportValue::Uint(1)))
    }
}

fn plugin(name: &str, keys: &[&str]) -> Plugin {
    keys.iter()
        .fold(Plugin::builder(name), |b, key| b.metric(*key, "test metric"))
        .exporter(Arc::new(Constant))
        .build()
}

#[test]
fn registry_assigns_sequential_ids() {
    let mut registry = PluginRegistry::new();
    let cpu = registry.register(plugin("Cpu", &["system.cpu.util"])).unwrap();
    let mem = registry.register(plugin("Memory", &["vm.memory.size"])).unwrap();

    assert_eq!(cpu.index(), 0);
    assert_eq!(mem.index(), 1);
    assert_eq!(registry.find_by_name("Memory"), Some(mem));
    assert_eq!(registry.get(cpu).map(|p| p.name()), Some("Cpu"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn registry_rejects_duplicate_metric_across_plugins() {
    let mut registry = PluginRegistry::new();
    registry.register(plugin("Cpu", &["system.cpu.util"])).unwrap();
    let err = registry.register(plugin("Other", &["system.cpu.util"])).unwrap_err();
    match err {
        RegistryError::DuplicateMetric { key, plugin } => {
            assert_eq!(key, "system.cpu.util");
            assert_eq!(plugin, "Cpu");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(registry.find_by_name("Other").is_none());
}

#[test]
fn registry_rejects_duplicate_metric_within_plugin() {
    let mut registry = PluginRegistry::new();
    let err = registry.register(plugin("Cpu", &["a.b", "a.b"])).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateMetric { .. }));
    assert!(registry.is_empty());
}

#[test]
fn registry_rejects_duplicate_plugin_name_and_bad_keys() {
    let mut registry = PluginRegistry::new();
    registry.register(plugin("Cpu", &["system.cpu.util"])).unwrap();
    assert!(matches!(
        registry.register(plugin("Cpu", &["system.cpu.num"])),
        Err(RegistryError::DuplicatePlugin(_))
    ));
    assert!(matches!(
        registry.register(plugin("Bad", &["key[with,params]"])),
        Err(RegistryError::InvalidMetric(_))
    ));
    assert!(matches!(
        registry.register(Plugin::builder("Zero").capacity(0).build()),
        Err(RegistryError::ZeroCapacity(_))
    ));
}

#[derive(Default)]
struct Collected(Mutex<Vec<AgentResult>>);

impl Collected {
    fn take(&self) -> Vec<AgentResult> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl ResultWriter for Collected {
    fn write(&self, result: AgentResult) {
        self.0.lock().unwrap().push(result);
    }
    fn flush(&self) {}
    fn slots_available(&self) -> usize {
        usize::MAX
    }
    fn persist_slots_available(&self) -> usize {
        usize::MAX
    }
}

#[derive(Default)]
struct Counters {
    subscribed: AtomicUsize,
    unsubscribed: AtomicUsize,
}

struct PortSource {
    port: String,
    counters: Arc<Counters>,
}

struct PrefixFilter(Option<String>);

impl EventFilter for PrefixFilter {
    fn convert(&self, event: &EventValue) -> Result<Option<String>, String> {
        let data = event.as_ref().map_err(Clone::clone)?;
        let text = String::from_utf8_lossy(data).to_string();
        match &self.0 {
            Some(prefix) if !text.starts_with(prefix.as_str()) => Ok(None),
            _ => Ok(Some(text)),
        }
    }
}

impl EventSource for PortSource {
    fn uri(&self) -> String {
        self.port.clone()
    }
    fn subscribe(&self) -> Result<(), PluginError> {
        if self.port == "0" {
            return Err(PluginError::unsupported("cannot listen on port 0"));
        }
        self.counters.subscribed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn unsubscribe(&self) {
        self.counters.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }
    fn new_filter(&self, key: &str) -> Result<Box<dyn EventFilter>, PluginError> {
        let (_, params) = parse_key(key).map_err(|e| PluginError::unsupported(e.to_string()))?;
        Ok(Box::new(PrefixFilter(params.get(1).cloned())))
    }
}

struct Provider(Arc<Counters>);

impl EventProvider for Provider {
    fn event_source_by_key(&self, key: &str) -> Result<Arc<dyn EventSource>, PluginError> {
        let (_, params) = parse_key(key).map_err(|e| PluginError::unsupported(e.to_string()))?;
        let port = params
            .first()
            .cloned()
            .ok_or_else(|| PluginError::unsupported("missing port"))?;
        Ok(Arc::new(PortSource {
            port,
            counters: self.0.clone(),
        }))
    }
}

#[test]
fn watch_subscribes_once_and_fans_out() {
    let counters = Arc::new(Counters::default());
    let provider = Provider(counters.clone());
    let mut manager = WatchManager::new();
    let out1 = Arc::new(Collected::default());
    let out2 = Arc::new(Collected::default());

    manager.update(1, out1.clone(), &[Request::new(10, "debug.trap[9000]", "")], &provider);
    manager.update(
        2,
        out2.clone(),
        &[Request::new(20, "debug.trap[9000,ERR]", "")],
        &provider,
    );
    assert_eq!(counters.subscribed.load(Ordering::SeqCst), 1);
    assert!(manager.is_subscribed("9000"));

    manager.notify("9000", &Ok(b"ERR disk".to_vec()));
    manager.notify("9000", &Ok(b"OK".to_vec()));

    let first: Vec<_> = out1.take().into_iter().map(|r| r.value).collect();
    assert_eq!(first, vec![Some("ERR disk".to_string()), Some("OK".to_string())]);
    let second = out2.take();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].itemid, 20);
}

#[test]
fn watch_unsubscribes_when_last_client_leaves() {
    let counters = Arc::new(Counters::default());
    let provider = Provider(counters.clone());
    let mut manager = WatchManager::new();
    let out = Arc::new(Collected::default());

    manager.update(1, out.clone(), &[Request::new(1, "debug.trap[9000]", "")], &provider);
    manager.update(2, out.clone(), &[Request::new(2, "debug.trap[9000]", "")], &provider);
    manager.update(1, out.clone(), &[], &provider);
    assert!(manager.is_subscribed("9000"));
    assert_eq!(counters.unsubscribed.load(Ordering::SeqCst), 0);

    manager.update(2, out.clone(), &[Request::new(2, "debug.trap[9001]", "")], &provider);
    assert!(!manager.is_subscribed("9000"));
    assert!(manager.is_subscribed("9001"));
    assert_eq!(counters.unsubscribed.load(Ordering::SeqCst), 1);
    assert_eq!(manager.subscription_count(), 1);
}

#[test]
fn watch_reports_unresolvable_requests() {
    let counters = Arc::new(Counters::default());
    let provider = Provider(counters.clone());
    let mut manager = WatchManager::new();
    let out = Arc::new(Collected::default());

    manager.update(
        1,
        out.clone(),
        &[
            Request::new(1, "debug.trap", ""),
            Request::new(2, "debug.trap[0]", ""),
        ],
        &provider,
    );
    let results = out.take();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(AgentResult::is_not_supported));
    assert_eq!(manager.subscription_count(), 0);
}

#[test]
fn watch_forwards_source_errors() {
    let counters = Arc::new(Counters::default());
    let provider = Provider(counters);
    let mut manager = WatchManager::new();
    let out = Arc::new(Collected::default());

    manager.update(1, out.clone(), &[Request::new(5, "debug.trap[7000]", "")], &provider);
    manager.notify("7000", &Err("connection reset".to_string()));
    let results = out.take();
    assert_eq!(results[0].error.as_deref(), Some("connection reset"));
}
