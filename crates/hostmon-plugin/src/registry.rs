use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use hostmon_common::itemutil::parse_key;

use crate::{Collector, Configurator, Exporter, RegistryError, Runner, Watcher};

/// Concurrency slots a plugin offers unless it says otherwise.
pub const DEFAULT_CAPACITY: u32 = 100;

/// Identifier assigned to a plugin at registration; its position in the
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginId(usize);

impl PluginId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub key: String,
    pub description: String,
}

/// A plugin descriptor: name, capacity, exported metric keys and the
/// optional capability implementations.
pub struct Plugin {
    name: String,
    capacity: u32,
    metrics: Vec<Metric>,
    collector: Option<Arc<dyn Collector>>,
    exporter: Option<Arc<dyn Exporter>>,
    runner: Option<Arc<dyn Runner>>,
    watcher: Option<Arc<dyn Watcher>>,
    configurator: Option<Arc<dyn Configurator>>,
}

impl Plugin {
    pub fn builder(name: impl Into<String>) -> PluginBuilder {
        PluginBuilder {
            plugin: Plugin {
                name: name.into(),
                capacity: DEFAULT_CAPACITY,
                metrics: Vec::new(),
                collector: None,
                exporter: None,
                runner: None,
                watcher: None,
                configurator: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn collector(&self) -> Option<&Arc<dyn Collector>> {
        self.collector.as_ref()
    }

    pub fn exporter(&self) -> Option<&Arc<dyn Exporter>> {
        self.exporter.as_ref()
    }

    pub fn runner(&self) -> Option<&Arc<dyn Runner>> {
        self.runner.as_ref()
    }

    pub fn watcher(&self) -> Option<&Arc<dyn Watcher>> {
        self.watcher.as_ref()
    }

    pub fn configurator(&self) -> Option<&Arc<dyn Configurator>> {
        self.configurator.as_ref()
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("metrics", &self.metrics.len())
            .field("collector", &self.collector.is_some())
            .field("exporter", &self.exporter.is_some())
            .field("runner", &self.runner.is_some())
            .field("watcher", &self.watcher.is_some())
            .field("configurator", &self.configurator.is_some())
            .finish()
    }
}

pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.plugin.capacity = capacity;
        self
    }

    pub fn metric(mut self, key: impl Into<String>, description: impl Into<String>) -> Self {
        self.plugin.metrics.push(Metric {
            key: key.into(),
            description: description.into(),
        });
        self
    }

    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.plugin.collector = Some(collector);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.plugin.exporter = Some(exporter);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.plugin.runner = Some(runner);
        self
    }

    pub fn watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.plugin.watcher = Some(watcher);
        self
    }

    pub fn configurator(mut self, configurator: Arc<dyn Configurator>) -> Self {
        self.plugin.configurator = Some(configurator);
        self
    }

    pub fn build(self) -> Plugin {
        self.plugin
    }
}

/// Registry of loaded plugins, built once at startup and handed to the
/// scheduler.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use hostmon_plugin::{
///     ContextProvider, ExportValue, Exporter, Plugin, PluginError, PluginRegistry,
/// };
///
/// struct Ping;
///
/// impl Exporter for Ping {
///     fn export(&self, _: &str, _: &[String], _: &dyn ContextProvider)
///         -> Result<Option<ExportValue>, PluginError> {
///         Ok(Some(ExportValue::Uint(1)))
///     }
/// }
///
/// let mut registry = PluginRegistry::new();
/// let id = registry
///     .register(
///         Plugin::builder("Agent")
///             .metric("agent.ping", "Ping.")
///             .exporter(Arc::new(Ping))
///             .build(),
///     )
///     .unwrap();
/// assert_eq!(registry.find_by_metric("agent.ping"), Some(id));
/// assert!(registry.find_by_metric("agent.version").is_none());
/// ```
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<Plugin>>,
    metrics: HashMap<String, PluginId>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Plugin) -> Result<PluginId, RegistryError> {
        if self.plugins.iter().any(|p| p.name == plugin.name) {
            return Err(RegistryError::DuplicatePlugin(plugin.name));
        }
        if plugin.capacity == 0 {
            return Err(RegistryError::ZeroCapacity(plugin.name));
        }
        for metric in &plugin.metrics {
            match parse_key(&metric.key) {
                Ok((_, params)) if params.is_empty() => {}
                _ => return Err(RegistryError::InvalidMetric(metric.key.clone())),
            }
            if let Some(existing) = self.metrics.get(&metric.key) {
                return Err(RegistryError::DuplicateMetric {
                    key: metric.key.clone(),
                    plugin: self.plugins[existing.0].name.clone(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for metric in &plugin.metrics {
            if !seen.insert(metric.key.as_str()) {
                return Err(RegistryError::DuplicateMetric {
                    key: metric.key.clone(),
                    plugin: plugin.name.clone(),
                });
            }
        }

        let id = PluginId(self.plugins.len());
        for metric in &plugin.metrics {
            self.metrics.insert(metric.key.clone(), id);
        }
        tracing::debug!(
            plugin = %plugin.name,
            id = %id,
            metrics = plugin.metrics.len(),
            "Plugin registered"
        );
        self.plugins.push(Arc::new(plugin));
        Ok(id)
    }

    pub fn get(&self, id: PluginId) -> Option<&Arc<Plugin>> {
        self.plugins.get(id.0)
    }

    pub fn find_by_metric(&self, key: &str) -> Option<PluginId> {
        self.metrics.get(key).copied()
    }

    pub fn find_by_name(&self, name: &str) -> Option<PluginId> {
        self.plugins.iter().position(|p| p.name == name).map(PluginId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PluginId, &Arc<Plugin>)> {
        self.plugins.iter().enumerate().map(|(i, p)| (PluginId(i), p))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
